//! Cluster service.
//!
//! [`DbCluster`] owns the pool registry, the statement executor, the
//! transaction coordinator and the keepalive monitor. It is built once with
//! [`DbCluster::initialize`] and shared by reference (or `Arc`) afterwards.

use crate::config::ClusterConfig;
use crate::db::{
    Classifier, KeepaliveMonitor, PoolRegistry, PoolStats, StatementExecutor,
    TransactionCoordinator, TransactionScope,
};
use crate::error::{DbError, DbResult};
use crate::models::{
    ConnectionRole, DatabaseType, ExecutionResult, QueryOptions, QueryParam, TransactionDecision,
    TransactionOutcome,
};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Statement run by the startup connectivity check.
const CONNECTION_CHECK_SQL: &str = "SELECT 1";

/// Writer/reader cluster with routing, transactions and keepalive.
#[derive(Debug)]
pub struct DbCluster {
    registry: Arc<PoolRegistry>,
    executor: StatementExecutor,
    transactions: TransactionCoordinator,
    keepalive: Mutex<KeepaliveMonitor>,
    keepalive_interval: Option<Duration>,
}

impl DbCluster {
    /// Build the pools, verify connectivity and start keepalive.
    ///
    /// Fails on invalid configuration or when the connectivity check does
    /// not succeed.
    pub async fn initialize(config: ClusterConfig) -> DbResult<Self> {
        config.validate()?;
        let registry = Arc::new(PoolRegistry::initialize(&config).await?);
        let db_type = registry.db_type();

        info!(
            db_type = %db_type,
            writers = registry.writer_count(),
            readers = registry.reader_count(),
            classifier = ?config.classifier,
            "Initializing cluster"
        );

        let executor = StatementExecutor::new(
            Arc::clone(&registry),
            Classifier::new(config.classifier, db_type),
            config.row_format,
        );

        let check = executor
            .query(CONNECTION_CHECK_SQL, &[], QueryOptions::silent())
            .await;
        if !check.success() {
            error!(error = ?check.error(), "Connection check failed");
            registry.shutdown().await;
            return Err(DbError::connection_unavailable(
                ConnectionRole::Reader,
                "Connection check failed",
                "Verify the endpoints are reachable and the credentials are correct",
            ));
        }
        info!("Connection check: OK");

        let keepalive = KeepaliveMonitor::start(executor.clone()).await;
        let keepalive_interval = keepalive.interval();

        Ok(Self {
            transactions: TransactionCoordinator::new(executor.clone()),
            registry,
            executor,
            keepalive: Mutex::new(keepalive),
            keepalive_interval,
        })
    }

    /// Run a statement routed by its text.
    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> ExecutionResult {
        self.executor
            .query(sql, params, QueryOptions::default())
            .await
    }

    /// Run a statement with explicit options (routing override, silence).
    pub async fn query_with(
        &self,
        sql: &str,
        params: &[QueryParam],
        options: QueryOptions,
    ) -> ExecutionResult {
        self.executor.query(sql, params, options).await
    }

    /// Run a prepared statement on the writer.
    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> ExecutionResult {
        self.executor
            .execute(sql, params, QueryOptions::default())
            .await
    }

    pub async fn execute_with(
        &self,
        sql: &str,
        params: &[QueryParam],
        options: QueryOptions,
    ) -> ExecutionResult {
        self.executor.execute(sql, params, options).await
    }

    /// Run `body` inside a writer transaction.
    ///
    /// See [`TransactionCoordinator::run`] for the outcome rules.
    pub async fn run_transaction<F, Fut, E>(&self, body: F) -> TransactionOutcome
    where
        F: FnOnce(TransactionScope) -> Fut,
        Fut: Future<Output = Result<TransactionDecision, E>>,
        E: Display,
    {
        self.transactions.run(body).await
    }

    pub fn db_type(&self) -> DatabaseType {
        self.registry.db_type()
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        self.registry.stats()
    }

    /// Keepalive probe interval, or `None` when keepalive is disabled.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.keepalive_interval
    }

    /// Stop keepalive and close every pool.
    pub async fn shutdown(&self) {
        self.keepalive.lock().await.stop();
        self.registry.shutdown().await;
        info!("Cluster shut down");
    }
}
