//! Transaction coordination.
//!
//! A transaction holds one writer connection from `BEGIN` until it is
//! finalized. The caller's body receives a [`TransactionScope`] whose
//! statements all run on that connection, and returns a
//! [`TransactionDecision`]. A body error or panic always ends in `ROLLBACK`.
//!
//! The connection lives in a shared slot so the coordinator can take it back
//! after the body finishes. Once taken, any scope clone the body leaked fails
//! every statement with `TransactionInfrastructureFailure`.
//!
//! PostgreSQL aborts the whole transaction on the first failed statement and
//! answers a later `COMMIT` with a rollback, so a `Commit` decision after a
//! failed statement is rolled back and reported as a failure there.
//!
//! If the `run` future is dropped mid-transaction, the connection is
//! discarded rather than pooled with the transaction still open.

use crate::db::executor::StatementExecutor;
use crate::db::pool::PooledConnection;
use crate::error::{DbError, DbResult, ErrorKind};
use crate::models::{
    ConnectionRole, DatabaseType, ExecutionResult, QueryOptions, QueryParam,
    TransactionDecision, TransactionOutcome, TransactionPhase, TransactionState,
};
use futures_util::FutureExt;
use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

type ConnectionSlot = Arc<Mutex<Option<PooledConnection>>>;

/// Statements bound to one open transaction.
///
/// Clones share the same connection; statements issued through clones are
/// serialized in the order they acquire the slot.
#[derive(Debug, Clone)]
pub struct TransactionScope {
    executor: StatementExecutor,
    slot: ConnectionSlot,
    transaction_id: Arc<str>,
    statement_failed: Arc<AtomicBool>,
}

impl TransactionScope {
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// Whether the transaction is still open.
    pub async fn is_active(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> ExecutionResult {
        self.query_with(sql, params, QueryOptions::default()).await
    }

    /// Run a query inside the transaction. `options.role` is ignored; every
    /// statement runs on the transaction's writer connection.
    pub async fn query_with(
        &self,
        sql: &str,
        params: &[QueryParam],
        options: QueryOptions,
    ) -> ExecutionResult {
        let mut slot = self.slot.lock().await;
        match slot.as_mut() {
            Some(conn) => {
                let result = self.executor.query_on(conn, sql, params, options).await;
                self.record(result)
            }
            None => self.finalized(sql),
        }
    }

    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> ExecutionResult {
        self.execute_with(sql, params, QueryOptions::default()).await
    }

    pub async fn execute_with(
        &self,
        sql: &str,
        params: &[QueryParam],
        options: QueryOptions,
    ) -> ExecutionResult {
        let mut slot = self.slot.lock().await;
        match slot.as_mut() {
            Some(conn) => {
                let result = self.executor.execute_on(conn, sql, params, options).await;
                self.record(result)
            }
            None => self.finalized(sql),
        }
    }

    /// Whether any statement in this transaction has failed.
    pub fn has_failed_statement(&self) -> bool {
        self.statement_failed.load(Ordering::Acquire)
    }

    fn record(&self, result: ExecutionResult) -> ExecutionResult {
        if !result.success() {
            self.statement_failed.store(true, Ordering::Release);
        }
        result
    }

    fn finalized(&self, sql: &str) -> ExecutionResult {
        warn!(
            transaction_id = %self.transaction_id,
            sql = %sql,
            "Statement issued on a finalized transaction"
        );
        ExecutionResult::failed(ErrorKind::TransactionInfrastructureFailure)
    }
}

/// Traces state transitions of one transaction attempt.
struct Lifecycle<'a> {
    transaction_id: &'a str,
    state: TransactionState,
}

impl<'a> Lifecycle<'a> {
    fn new(transaction_id: &'a str) -> Self {
        debug!(transaction_id = %transaction_id, state = %TransactionState::Init, "Transaction state");
        Self {
            transaction_id,
            state: TransactionState::Init,
        }
    }

    fn advance(&mut self, next: TransactionState) {
        if !self.state.can_transition_to(next) {
            warn!(
                transaction_id = %self.transaction_id,
                from = %self.state,
                to = %next,
                "Unexpected transaction state transition"
            );
        }
        debug!(
            transaction_id = %self.transaction_id,
            from = %self.state,
            to = %next,
            "Transaction state"
        );
        self.state = next;
    }
}

/// Runs caller bodies inside writer transactions.
#[derive(Debug, Clone)]
pub struct TransactionCoordinator {
    executor: StatementExecutor,
}

impl TransactionCoordinator {
    pub fn new(executor: StatementExecutor) -> Self {
        Self { executor }
    }

    /// Run `body` inside one transaction on a writer connection.
    ///
    /// Returns `{success: true, committed: true}` only after a clean COMMIT,
    /// `{success: true, committed: false}` after a requested ROLLBACK, and
    /// `{success: false, committed: false}` on any infrastructure failure
    /// (acquire, BEGIN, COMMIT, ROLLBACK, body error or panic).
    pub async fn run<F, Fut, E>(&self, body: F) -> TransactionOutcome
    where
        F: FnOnce(TransactionScope) -> Fut,
        Fut: Future<Output = Result<TransactionDecision, E>>,
        E: Display,
    {
        let transaction_id = generate_transaction_id();
        let mut lifecycle = Lifecycle::new(&transaction_id);

        let mut conn = match self
            .executor
            .registry()
            .acquire(ConnectionRole::Writer)
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                error!(
                    transaction_id = %transaction_id,
                    error = %DbError::transaction(TransactionPhase::Acquire, e.to_string()),
                    "Transaction not started"
                );
                lifecycle.advance(TransactionState::Finalized);
                return TransactionOutcome::failed();
            }
        };

        conn.set_in_transaction(true);
        if let Err(e) = control(&mut conn, "BEGIN").await {
            error!(
                transaction_id = %transaction_id,
                pool = %conn.pool_label(),
                error = %DbError::transaction(TransactionPhase::Begin, e.to_string()),
                "Transaction not started"
            );
            conn.mark_broken();
            release(conn, &transaction_id).await;
            lifecycle.advance(TransactionState::Finalized);
            return TransactionOutcome::failed();
        }
        lifecycle.advance(TransactionState::Running);

        let slot: ConnectionSlot = Arc::new(Mutex::new(Some(conn)));
        let statement_failed = Arc::new(AtomicBool::new(false));
        let scope = TransactionScope {
            executor: self.executor.clone(),
            slot: Arc::clone(&slot),
            transaction_id: Arc::from(transaction_id.as_str()),
            statement_failed: Arc::clone(&statement_failed),
        };

        // Call the body inside the future so a panic before its first await is caught too
        let body_result = AssertUnwindSafe(async move { body(scope).await })
            .catch_unwind()
            .await;

        let Some(mut conn) = slot.lock().await.take() else {
            error!(transaction_id = %transaction_id, "Transaction connection missing after body");
            lifecycle.advance(TransactionState::Finalized);
            return TransactionOutcome::failed();
        };

        let decision = match body_result {
            Ok(Ok(decision)) => Some(decision),
            Ok(Err(e)) => {
                warn!(
                    transaction_id = %transaction_id,
                    error = %DbError::transaction(TransactionPhase::Body, e.to_string()),
                    "Transaction body failed, rolling back"
                );
                None
            }
            Err(panic) => {
                error!(
                    transaction_id = %transaction_id,
                    panic = %panic_message(panic.as_ref()),
                    "Transaction body panicked, rolling back"
                );
                None
            }
        };

        let outcome = match decision {
            Some(TransactionDecision::Commit)
                if self.executor.registry().db_type() == DatabaseType::PostgreSQL
                    && statement_failed.load(Ordering::Acquire) =>
            {
                warn!(
                    transaction_id = %transaction_id,
                    "Commit requested after a failed statement, rolling back aborted transaction"
                );
                lifecycle.advance(TransactionState::RollingBack);
                rollback_quietly(&mut conn, &transaction_id).await;
                TransactionOutcome::failed()
            }
            Some(TransactionDecision::Commit) => {
                lifecycle.advance(TransactionState::Committing);
                match control(&mut conn, "COMMIT").await {
                    Ok(()) => {
                        conn.set_in_transaction(false);
                        TransactionOutcome::committed()
                    }
                    Err(e) => {
                        error!(
                            transaction_id = %transaction_id,
                            error = %DbError::transaction(TransactionPhase::Commit, e.to_string()),
                            "COMMIT failed, rolling back"
                        );
                        lifecycle.advance(TransactionState::RollingBack);
                        rollback_quietly(&mut conn, &transaction_id).await;
                        TransactionOutcome::failed()
                    }
                }
            }
            Some(TransactionDecision::Rollback) => {
                lifecycle.advance(TransactionState::RollingBack);
                match control(&mut conn, "ROLLBACK").await {
                    Ok(()) => {
                        conn.set_in_transaction(false);
                        TransactionOutcome::rolled_back()
                    }
                    Err(e) => {
                        error!(
                            transaction_id = %transaction_id,
                            error = %DbError::transaction(TransactionPhase::Rollback, e.to_string()),
                            "ROLLBACK failed"
                        );
                        conn.mark_broken();
                        TransactionOutcome::failed()
                    }
                }
            }
            None => {
                lifecycle.advance(TransactionState::RollingBack);
                rollback_quietly(&mut conn, &transaction_id).await;
                TransactionOutcome::failed()
            }
        };

        release(conn, &transaction_id).await;
        lifecycle.advance(TransactionState::Finalized);
        outcome
    }
}

/// Issue a transaction control statement.
async fn control(conn: &mut PooledConnection, sql: &str) -> DbResult<()> {
    conn.connection_mut()?
        .execute_raw(sql)
        .await
        .map(|_| ())
        .map_err(DbError::from)
}

/// Roll back after a failure. A second failure is logged and the connection is
/// closed on release.
async fn rollback_quietly(conn: &mut PooledConnection, transaction_id: &str) {
    match control(conn, "ROLLBACK").await {
        Ok(()) => conn.set_in_transaction(false),
        Err(e) => {
            warn!(
                transaction_id = %transaction_id,
                error = %e,
                "Rollback after failure also failed, discarding connection"
            );
            conn.mark_broken();
        }
    }
}

async fn release(conn: PooledConnection, transaction_id: &str) {
    let pool = conn.pool_label().to_string();
    if let Err(e) = conn.release().await {
        error!(
            transaction_id = %transaction_id,
            pool = %pool,
            error = %e,
            "Failed to release transaction connection"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id_format() {
        let id = generate_transaction_id();
        assert!(id.starts_with("tx_"));
        assert_eq!(id.len(), 3 + 32);
        assert_ne!(id, generate_transaction_id());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[test]
    fn test_lifecycle_tracks_state() {
        let mut lifecycle = Lifecycle::new("tx_test");
        lifecycle.advance(TransactionState::Running);
        lifecycle.advance(TransactionState::Committing);
        lifecycle.advance(TransactionState::Finalized);
        assert!(lifecycle.state.is_finalized());
    }
}
