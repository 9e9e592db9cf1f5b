//! Keepalive probing.
//!
//! Servers close sessions that stay idle longer than their idle timeout
//! (`wait_timeout` on MySQL, `idle_session_timeout` on PostgreSQL). The
//! monitor learns that timeout once, then runs `SELECT 1` against every pool
//! at half of it (never more often than every 10 seconds).
//!
//! A tick that fires while the previous sweep is still running is dropped.

use crate::db::executor::StatementExecutor;
use crate::models::{DatabaseType, ExecutionResult, QueryOptions};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Lower bound for the probe interval.
pub const MIN_PROBE_INTERVAL_SECS: u64 = 10;

/// No-op statement used as the probe.
pub const PROBE_SQL: &str = "SELECT 1";

const MYSQL_TIMEOUT_SQL: &str = "SHOW SESSION VARIABLES LIKE 'wait_timeout'";
const POSTGRES_TIMEOUT_SQL: &str = "SELECT name AS \"Variable_name\", setting AS \"Value\" \
     FROM pg_settings WHERE name = 'idle_session_timeout'";

/// Why idle-timeout discovery did not produce an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryFailure {
    /// The discovery statement failed or returned no rows.
    Db,
    /// The returned row is not the expected variable.
    VariableNotExists,
    /// The value is not a positive integer.
    ValueInvalid,
    /// The backend has no server-side idle timeout.
    Unsupported,
}

impl std::fmt::Display for DiscoveryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            Self::Db => "FAIL:DB",
            Self::VariableNotExists => "FAIL:VARIABLE_NOT_EXISTS",
            Self::ValueInvalid => "FAIL:VALUE_INVALID",
            Self::Unsupported => "UNSUPPORTED",
        };
        f.write_str(reason)
    }
}

/// Probe interval for a server idle timeout in seconds.
pub fn probe_interval(idle_timeout_secs: u64) -> Duration {
    Duration::from_secs((idle_timeout_secs / 2).max(MIN_PROBE_INTERVAL_SECS))
}

/// Extract the idle timeout (seconds) from a discovery result.
///
/// The first row must name `variable` in `Variable_name` and carry an integer
/// `Value`. PostgreSQL reports milliseconds.
pub fn parse_idle_timeout(
    result: &ExecutionResult,
    variable: &str,
    db_type: DatabaseType,
) -> Result<u64, DiscoveryFailure> {
    let row = match result.first_row() {
        Some(row) if result.success() => row,
        _ => return Err(DiscoveryFailure::Db),
    };

    if row.get("Variable_name").and_then(|v| v.as_str()) != Some(variable) {
        return Err(DiscoveryFailure::VariableNotExists);
    }

    let value = match row.get("Value") {
        Some(serde_json::Value::String(s)) => s.trim().parse::<u64>().ok(),
        Some(serde_json::Value::Number(n)) => n.as_u64(),
        _ => None,
    }
    .filter(|v| *v > 0)
    .ok_or(DiscoveryFailure::ValueInvalid)?;

    Ok(match db_type {
        DatabaseType::PostgreSQL => value.div_ceil(1000),
        _ => value,
    })
}

/// Ask the server for its idle timeout in seconds.
pub async fn discover_idle_timeout(executor: &StatementExecutor) -> Result<u64, DiscoveryFailure> {
    let db_type = executor.registry().db_type();
    let (sql, variable) = match db_type {
        DatabaseType::MySQL => (MYSQL_TIMEOUT_SQL, "wait_timeout"),
        DatabaseType::PostgreSQL => (POSTGRES_TIMEOUT_SQL, "idle_session_timeout"),
        DatabaseType::SQLite => return Err(DiscoveryFailure::Unsupported),
    };

    let result = executor.query(sql, &[], QueryOptions::silent()).await;
    parse_idle_timeout(&result, variable, db_type)
}

/// Resets the in-flight flag when a sweep ends, even if it panics.
struct ProbeGuard(Arc<AtomicBool>);

impl ProbeGuard {
    fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Background task keeping pooled sessions alive.
#[derive(Debug)]
pub struct KeepaliveMonitor {
    task: Option<JoinHandle<()>>,
    interval: Option<Duration>,
    sweeps: Arc<AtomicU64>,
    skipped: Arc<AtomicU64>,
}

impl KeepaliveMonitor {
    /// Discover the server idle timeout and start probing.
    ///
    /// When discovery fails the monitor stays disabled and a warning names
    /// the reason.
    pub async fn start(executor: StatementExecutor) -> Self {
        match discover_idle_timeout(&executor).await {
            Ok(timeout_secs) => {
                let interval = probe_interval(timeout_secs);
                info!(
                    idle_timeout_secs = timeout_secs,
                    interval_secs = interval.as_secs(),
                    "Keepalive enabled"
                );
                Self::with_interval(executor, interval)
            }
            Err(reason) => {
                warn!(reason = %reason, "Keepalive disabled: idle timeout discovery failed");
                Self::disabled()
            }
        }
    }

    /// A monitor that never probes.
    pub fn disabled() -> Self {
        Self {
            task: None,
            interval: None,
            sweeps: Arc::new(AtomicU64::new(0)),
            skipped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start probing every `interval`, skipping the immediate first tick.
    pub fn with_interval(executor: StatementExecutor, interval: Duration) -> Self {
        let sweeps = Arc::new(AtomicU64::new(0));
        let skipped = Arc::new(AtomicU64::new(0));
        let in_flight = Arc::new(AtomicBool::new(false));

        let task = {
            let sweeps = Arc::clone(&sweeps);
            let skipped = Arc::clone(&skipped);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker.tick().await;

                loop {
                    ticker.tick().await;
                    let Some(guard) = ProbeGuard::try_acquire(&in_flight) else {
                        skipped.fetch_add(1, Ordering::Relaxed);
                        debug!("Keepalive sweep still running, tick dropped");
                        continue;
                    };

                    let executor = executor.clone();
                    let sweeps = Arc::clone(&sweeps);
                    tokio::spawn(async move {
                        let _guard = guard;
                        probe_all(&executor).await;
                        sweeps.fetch_add(1, Ordering::Relaxed);
                    });
                }
            })
        };

        Self {
            task: Some(task),
            interval: Some(interval),
            sweeps,
            skipped,
        }
    }

    /// Probe interval, or `None` when disabled.
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Completed probe sweeps.
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    /// Ticks dropped because a sweep was still in flight.
    pub fn skipped_ticks(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Stop probing. In-flight sweeps finish on their own.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Keepalive stopped");
        }
    }
}

impl Drop for KeepaliveMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run the probe once on every pool so none is starved.
async fn probe_all(executor: &StatementExecutor) {
    for handle in executor.registry().handles() {
        let mut conn = match handle.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(pool = %handle.label(), error = %e, "Keepalive probe could not acquire");
                continue;
            }
        };

        let result = executor
            .query_on(&mut conn, PROBE_SQL, &[], QueryOptions::silent())
            .await;
        if !result.success() {
            warn!(pool = %handle.label(), error = ?result.error(), "Keepalive probe failed");
        }

        if let Err(e) = conn.release().await {
            warn!(pool = %handle.label(), error = %e, "Keepalive probe release failed");
        }
    }
}
