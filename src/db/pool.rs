//! Connection pool management.
//!
//! This module owns the writer and reader pools of a cluster. Pools use the
//! database-specific sqlx types (MySqlPool, PgPool, SqlitePool) to ensure full
//! type support, and connections are handed out as exclusively owned
//! [`PooledConnection`] values that must be released exactly once.

use crate::config::{ClusterConfig, Endpoint, PoolOptions};
use crate::error::{DbError, DbResult};
use crate::impl_db_dispatch;
use crate::models::{ConnectionRole, DatabaseType};
use serde::Serialize;
use sqlx::pool::PoolConnection;
use sqlx::{
    MySql, MySqlPool, PgPool, Postgres, Sqlite, SqlitePool, mysql::MySqlConnectOptions,
    mysql::MySqlPoolOptions, postgres::PgConnectOptions, postgres::PgPoolOptions,
    sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions,
};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// Database-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

impl DbPool {
    /// Build a pool for `endpoint` without opening any connection.
    pub fn connect_lazy(
        endpoint: &Endpoint,
        role: ConnectionRole,
        pool_opts: &PoolOptions,
    ) -> DbResult<Self> {
        let is_sqlite = endpoint.db_type == DatabaseType::SQLite;
        let max_connections = pool_opts.max_connections_or_default(is_sqlite);
        let min_connections = pool_opts.min_connections_or_default().min(max_connections);
        let acquire_timeout = pool_opts.acquire_timeout_or_default();
        let idle_timeout = Some(pool_opts.idle_timeout_or_default());
        let test_before_acquire = pool_opts.test_before_acquire_or_default();

        match endpoint.db_type {
            DatabaseType::MySQL => {
                let options = MySqlConnectOptions::from_str(&endpoint.connection_string)
                    .map_err(|e| {
                        DbError::configuration(format!(
                            "Invalid MySQL endpoint {}: {}",
                            endpoint.masked(),
                            e
                        ))
                    })?
                    .charset("utf8mb4");

                let pool = MySqlPoolOptions::new()
                    .min_connections(min_connections)
                    .max_connections(max_connections)
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(idle_timeout)
                    .test_before_acquire(test_before_acquire)
                    .connect_lazy_with(options);
                Ok(DbPool::MySql(pool))
            }
            DatabaseType::PostgreSQL => {
                let options =
                    PgConnectOptions::from_str(&endpoint.connection_string).map_err(|e| {
                        DbError::configuration(format!(
                            "Invalid PostgreSQL endpoint {}: {}",
                            endpoint.masked(),
                            e
                        ))
                    })?;

                let pool = PgPoolOptions::new()
                    .min_connections(min_connections)
                    .max_connections(max_connections)
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(idle_timeout)
                    .test_before_acquire(test_before_acquire)
                    .connect_lazy_with(options);
                Ok(DbPool::Postgres(pool))
            }
            DatabaseType::SQLite => {
                let mut options = SqliteConnectOptions::from_str(&endpoint.connection_string)
                    .map_err(|e| {
                        DbError::configuration(format!(
                            "Invalid SQLite endpoint {}: {}",
                            endpoint.masked(),
                            e
                        ))
                    })?;

                if role.is_writer() {
                    options = options.create_if_missing(true);
                }

                let pool = SqlitePoolOptions::new()
                    .min_connections(min_connections)
                    .max_connections(max_connections)
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(idle_timeout)
                    .test_before_acquire(test_before_acquire)
                    .connect_lazy_with(options);
                Ok(DbPool::SQLite(pool))
            }
        }
    }

    /// Check out one connection.
    pub async fn acquire(&self) -> Result<DbConnection, sqlx::Error> {
        impl_db_dispatch!(self, {
            MySql(pool) => pool.acquire().await.map(DbConnection::MySql),
            Postgres(pool) => pool.acquire().await.map(DbConnection::Postgres),
            SQLite(pool) => pool.acquire().await.map(DbConnection::SQLite),
        })
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        impl_db_dispatch!(self, {
            MySql(pool) => pool.close().await,
            Postgres(pool) => pool.close().await,
            SQLite(pool) => pool.close().await,
        })
    }

    /// Connections currently open (idle and in use).
    pub fn size(&self) -> u32 {
        impl_db_dispatch!(self, {
            MySql(pool) => pool.size(),
            Postgres(pool) => pool.size(),
            SQLite(pool) => pool.size(),
        })
    }

    /// Connections currently idle in the pool.
    pub fn num_idle(&self) -> usize {
        impl_db_dispatch!(self, {
            MySql(pool) => pool.num_idle(),
            Postgres(pool) => pool.num_idle(),
            SQLite(pool) => pool.num_idle(),
        })
    }

    /// Get the database type for this pool.
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbPool::MySql(_) => DatabaseType::MySQL,
            DbPool::Postgres(_) => DatabaseType::PostgreSQL,
            DbPool::SQLite(_) => DatabaseType::SQLite,
        }
    }
}

/// One live session checked out of a [`DbPool`].
#[derive(Debug)]
pub enum DbConnection {
    MySql(PoolConnection<MySql>),
    Postgres(PoolConnection<Postgres>),
    SQLite(PoolConnection<Sqlite>),
}

impl DbConnection {
    /// Run a statement through the simple (text) protocol, discarding rows.
    /// Used for transaction control statements.
    pub async fn execute_raw(&mut self, sql: &str) -> Result<u64, sqlx::Error> {
        use sqlx::Executor;
        impl_db_dispatch!(DbConnection; self, {
            MySql(conn) => (&mut **conn).execute(sql).await.map(|r| r.rows_affected()),
            Postgres(conn) => (&mut **conn).execute(sql).await.map(|r| r.rows_affected()),
            SQLite(conn) => (&mut **conn).execute(sql).await.map(|r| r.rows_affected()),
        })
    }

    /// Close the session instead of returning it to its pool.
    async fn close(self) -> Result<(), sqlx::Error> {
        impl_db_dispatch!(DbConnection; self, {
            MySql(conn) => conn.close().await,
            Postgres(conn) => conn.close().await,
            SQLite(conn) => conn.close().await,
        })
    }

    /// Take the session out of its pool and drop it. Usable from `Drop`; the
    /// server rolls back whatever the session left open when it disconnects.
    fn discard(self) {
        impl_db_dispatch!(DbConnection; self, {
            MySql(conn) => drop(conn.detach()),
            Postgres(conn) => drop(conn.detach()),
            SQLite(conn) => drop(conn.detach()),
        })
    }
}

/// Exclusively owned connection with release accounting.
///
/// [`PooledConnection::release`] consumes the handle, so a connection cannot be
/// released twice. Dropping an unreleased handle still returns the connection
/// to its pool but logs a warning, unless it is broken or inside a
/// transaction, in which case the session is discarded.
pub struct PooledConnection {
    conn: Option<DbConnection>,
    pool: Arc<str>,
    role: ConnectionRole,
    checked_out: Arc<AtomicUsize>,
    broken: bool,
    in_transaction: bool,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool)
            .field("role", &self.role)
            .field("broken", &self.broken)
            .field("in_transaction", &self.in_transaction)
            .field("released", &self.conn.is_none())
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    fn new(
        conn: DbConnection,
        pool: Arc<str>,
        role: ConnectionRole,
        checked_out: Arc<AtomicUsize>,
    ) -> Self {
        checked_out.fetch_add(1, Ordering::SeqCst);
        Self {
            conn: Some(conn),
            pool,
            role,
            checked_out,
            broken: false,
            in_transaction: false,
        }
    }

    /// Label of the pool this connection belongs to (`W`, `R_0`, ...).
    pub fn pool_label(&self) -> &str {
        &self.pool
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    /// Mark the session unusable so release closes it instead of pooling it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Flag an explicit transaction as open (or finished) on this session.
    ///
    /// A handle dropped while the flag is set never goes back to the pool,
    /// since the next borrower would inherit the open transaction.
    pub fn set_in_transaction(&mut self, open: bool) {
        self.in_transaction = open;
    }

    /// Borrow the underlying session.
    pub fn connection_mut(&mut self) -> DbResult<&mut DbConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::release(self.pool.to_string(), "connection already released"))
    }

    /// Return the connection to its pool, or close it when marked broken.
    pub async fn release(mut self) -> DbResult<()> {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| DbError::release(self.pool.to_string(), "connection already released"))?;
        self.checked_out.fetch_sub(1, Ordering::SeqCst);

        if self.broken || self.in_transaction {
            debug!(
                pool = %self.pool,
                in_transaction = self.in_transaction,
                "Closing connection instead of pooling it"
            );
            conn.close()
                .await
                .map_err(|e| DbError::release(self.pool.to_string(), e.to_string()))?;
        }
        // Dropping a PoolConnection hands it back to the pool
        Ok(())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        self.checked_out.fetch_sub(1, Ordering::SeqCst);

        if self.in_transaction || self.broken {
            warn!(
                pool = %self.pool,
                role = %self.role,
                in_transaction = self.in_transaction,
                "Connection dropped mid-transaction or broken, discarding it"
            );
            conn.discard();
        } else {
            warn!(
                pool = %self.pool,
                role = %self.role,
                "Connection returned via Drop - consider using explicit release()"
            );
        }
    }
}

/// Point-in-time view of one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub label: String,
    pub role: ConnectionRole,
    pub size: u32,
    pub idle: usize,
    pub checked_out: usize,
    pub acquired_total: u64,
}

/// One sqlx pool bound to one endpoint.
#[derive(Debug)]
pub struct PoolHandle {
    label: Arc<str>,
    role: ConnectionRole,
    endpoint: String,
    pool: DbPool,
    checked_out: Arc<AtomicUsize>,
    acquired_total: AtomicU64,
}

impl PoolHandle {
    fn new(label: String, role: ConnectionRole, endpoint: &Endpoint, pool: DbPool) -> Self {
        Self {
            label: label.into(),
            role,
            endpoint: endpoint.masked(),
            pool,
            checked_out: Arc::new(AtomicUsize::new(0)),
            acquired_total: AtomicU64::new(0),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Connections from this pool not yet released.
    pub fn checked_out(&self) -> usize {
        self.checked_out.load(Ordering::SeqCst)
    }

    /// Connections handed out over the pool's lifetime.
    pub fn acquired_total(&self) -> u64 {
        self.acquired_total.load(Ordering::Relaxed)
    }

    /// Check out a connection, waiting at most the pool's acquire timeout.
    pub async fn acquire(&self) -> DbResult<PooledConnection> {
        let conn = self.pool.acquire().await.map_err(|e| {
            let err = DbError::from_acquire(self.role, e);
            debug!(pool = %self.label, endpoint = %self.endpoint, error = %err, "Acquire failed");
            err
        })?;
        self.acquired_total.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection::new(
            conn,
            Arc::clone(&self.label),
            self.role,
            Arc::clone(&self.checked_out),
        ))
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            label: self.label.to_string(),
            role: self.role,
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            checked_out: self.checked_out(),
            acquired_total: self.acquired_total(),
        }
    }
}

/// Pools serving one role, selected round-robin.
#[derive(Debug)]
struct PoolGroup {
    handles: Vec<Arc<PoolHandle>>,
    next: AtomicUsize,
}

impl PoolGroup {
    fn pick(&self) -> Option<&Arc<PoolHandle>> {
        if self.handles.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        self.handles.get(idx)
    }
}

/// The writer group and the reader pools of one cluster.
#[derive(Debug)]
pub struct PoolRegistry {
    db_type: DatabaseType,
    writers: PoolGroup,
    readers: PoolGroup,
}

impl PoolRegistry {
    /// Build every pool described by `config`.
    ///
    /// Pools are lazy: no connection is opened until the first acquire.
    /// Pool construction spawns maintenance tasks, so this runs on the
    /// caller's tokio runtime.
    pub async fn initialize(config: &ClusterConfig) -> DbResult<Self> {
        config.validate()?;
        let db_type = config.db_type().ok_or_else(|| {
            DbError::configuration("At least one writer endpoint must be configured")
        })?;

        let build = |endpoints: &[Endpoint], role: ConnectionRole| -> DbResult<PoolGroup> {
            let mut handles = Vec::with_capacity(endpoints.len());
            for (idx, endpoint) in endpoints.iter().enumerate() {
                let label = match (role, idx) {
                    (ConnectionRole::Writer, 0) => "W".to_string(),
                    (ConnectionRole::Writer, i) => format!("W_{}", i),
                    (ConnectionRole::Reader, i) => format!("R_{}", i),
                };
                let options = endpoint.pool_options.or(&config.pool_options);
                let pool = DbPool::connect_lazy(endpoint, role, &options)?;
                info!(
                    pool = %label,
                    role = %role,
                    endpoint = %endpoint.masked(),
                    max_connections = options.max_connections_or_default(db_type == DatabaseType::SQLite),
                    "Registered pool"
                );
                handles.push(Arc::new(PoolHandle::new(label, role, endpoint, pool)));
            }
            Ok(PoolGroup {
                handles,
                next: AtomicUsize::new(0),
            })
        };

        let writers = build(&config.writers, ConnectionRole::Writer)?;
        let readers = build(&config.readers, ConnectionRole::Reader)?;

        if readers.handles.is_empty() {
            info!("No reader endpoints configured, reads will use the writer");
        }

        Ok(Self {
            db_type,
            writers,
            readers,
        })
    }

    /// Acquire a connection for `role`.
    ///
    /// Readers are selected round-robin; with no readers configured the writer
    /// group serves reads.
    pub async fn acquire(&self, role: ConnectionRole) -> DbResult<PooledConnection> {
        let group = match role {
            ConnectionRole::Reader if !self.readers.handles.is_empty() => &self.readers,
            _ => &self.writers,
        };
        let handle = group.pick().ok_or_else(|| {
            DbError::connection_unavailable(
                role,
                "No pool configured for this role",
                "Configure at least one writer endpoint",
            )
        })?;
        let conn = handle.acquire().await?;
        debug!(pool = %handle.label(), role = %role, "Connection acquired");
        Ok(conn)
    }

    /// Every pool, writers first.
    pub fn handles(&self) -> impl Iterator<Item = &Arc<PoolHandle>> {
        self.writers.handles.iter().chain(self.readers.handles.iter())
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        self.handles().map(|h| h.stats()).collect()
    }

    /// Outstanding connections across all pools of `role`.
    pub fn checked_out(&self, role: ConnectionRole) -> usize {
        self.handles()
            .filter(|h| h.role() == role)
            .map(|h| h.checked_out())
            .sum()
    }

    pub fn has_readers(&self) -> bool {
        !self.readers.handles.is_empty()
    }

    pub fn reader_count(&self) -> usize {
        self.readers.handles.len()
    }

    pub fn writer_count(&self) -> usize {
        self.writers.handles.len()
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    /// Close every pool. Waits for checked-out connections to come back.
    pub async fn shutdown(&self) {
        for handle in self.handles() {
            info!(pool = %handle.label(), "Closing pool");
            handle.pool().close().await;
        }
        info!("All pools closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_config(readers: &[&str]) -> ClusterConfig {
        ClusterConfig::from_urls(&["sqlite::memory:"], readers).unwrap()
    }

    #[tokio::test]
    async fn test_initialize_labels_pools() {
        let config = ClusterConfig::from_urls(
            &["mysql://a/db", "mysql://b/db"],
            &["mysql://r0/db", "mysql://r1/db"],
        )
        .unwrap();
        let registry = PoolRegistry::initialize(&config).await.unwrap();

        let labels: Vec<&str> = registry.handles().map(|h| h.label()).collect();
        assert_eq!(labels, vec!["W", "W_1", "R_0", "R_1"]);
        assert_eq!(registry.writer_count(), 2);
        assert_eq!(registry.reader_count(), 2);
        assert_eq!(registry.db_type(), DatabaseType::MySQL);
    }

    #[tokio::test]
    async fn test_initialize_requires_writer() {
        let config = ClusterConfig::new(Vec::new(), Vec::new());
        let result = PoolRegistry::initialize(&config).await;
        assert!(matches!(result, Err(DbError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_pool_group_round_robin() {
        let config = ClusterConfig::from_urls(
            &["postgres://w/db"],
            &["postgres://r0/db", "postgres://r1/db", "postgres://r2/db"],
        )
        .unwrap();
        let registry = PoolRegistry::initialize(&config).await.unwrap();

        let picks: Vec<&str> = (0..6)
            .filter_map(|_| registry.readers.pick())
            .map(|h| h.label())
            .collect();
        assert_eq!(picks, vec!["R_0", "R_1", "R_2", "R_0", "R_1", "R_2"]);
    }

    #[tokio::test]
    async fn test_release_returns_counter_to_zero() {
        let registry = PoolRegistry::initialize(&sqlite_config(&[])).await.unwrap();
        assert!(!registry.has_readers());

        let conn = registry.acquire(ConnectionRole::Reader).await.unwrap();
        assert_eq!(conn.pool_label(), "W");
        assert_eq!(registry.checked_out(ConnectionRole::Writer), 1);

        conn.release().await.unwrap();
        assert_eq!(registry.checked_out(ConnectionRole::Writer), 0);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_drop_without_release_still_accounts() {
        let registry = PoolRegistry::initialize(&sqlite_config(&[])).await.unwrap();
        {
            let _conn = registry.acquire(ConnectionRole::Writer).await.unwrap();
            assert_eq!(registry.checked_out(ConnectionRole::Writer), 1);
        }
        assert_eq!(registry.checked_out(ConnectionRole::Writer), 0);
    }

    #[tokio::test]
    async fn test_broken_connection_is_closed_on_release() {
        let registry = PoolRegistry::initialize(&sqlite_config(&[])).await.unwrap();
        let mut conn = registry.acquire(ConnectionRole::Writer).await.unwrap();
        conn.mark_broken();
        conn.release().await.unwrap();

        let stats = registry.stats();
        assert_eq!(stats[0].checked_out, 0);
        assert_eq!(stats[0].acquired_total, 1);
    }

    #[test]
    fn test_initialize_from_sync_caller_with_runtime() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let registry = PoolRegistry::initialize(&sqlite_config(&[])).await.unwrap();
            assert_eq!(registry.writer_count(), 1);
            let conn = registry.acquire(ConnectionRole::Writer).await.unwrap();
            conn.release().await.unwrap();
            registry.shutdown().await;
        });
    }

    #[tokio::test]
    async fn test_dropped_transaction_connection_is_not_pooled() {
        let registry = PoolRegistry::initialize(&sqlite_config(&[])).await.unwrap();
        {
            let mut conn = registry.acquire(ConnectionRole::Writer).await.unwrap();
            conn.connection_mut()
                .unwrap()
                .execute_raw("CREATE TABLE t (x INTEGER)")
                .await
                .unwrap();
            conn.connection_mut().unwrap().execute_raw("BEGIN").await.unwrap();
            conn.set_in_transaction(true);
        }
        assert_eq!(registry.checked_out(ConnectionRole::Writer), 0);

        // A fresh in-memory session: the discarded one took its table with it
        let mut conn = registry.acquire(ConnectionRole::Writer).await.unwrap();
        let begin = conn.connection_mut().unwrap().execute_raw("BEGIN").await;
        assert!(begin.is_ok());
        let missing = conn
            .connection_mut()
            .unwrap()
            .execute_raw("SELECT * FROM t")
            .await;
        assert!(missing.is_err());
        conn.release().await.unwrap();
    }
}
