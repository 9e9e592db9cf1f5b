//! Statement execution engine.
//!
//! This module runs one statement on one connection and folds every outcome
//! into an [`ExecutionResult`]:
//! - Routed execution (`query`/`execute`): acquire, run, always release
//! - Manual-release execution (`query_on`/`execute_on`): run on a caller-owned
//!   connection, used by transaction scopes
//!
//! # Architecture
//!
//! The executor uses database-specific implementations organized in submodules:
//! - `mysql`: MySQL-specific statement execution
//! - `postgres`: PostgreSQL-specific statement execution
//! - `sqlite`: SQLite-specific statement execution
//!
//! Each submodule provides identical functionality adapted to the database's type system.

use crate::db::classifier::{Classifier, FragmentEffect, fragment_effects};
use crate::db::params::{bind_mysql_param, bind_postgres_param, bind_sqlite_param};
use crate::db::pool::{DbConnection, PoolRegistry, PooledConnection};
use crate::db::types::{RowFormat, RowToJson};
use crate::error::DbError;
use crate::impl_db_dispatch;
use crate::models::{ConnectionRole, ExecutionResult, JsonRow, QueryOptions, QueryParam};
use futures_util::TryStreamExt;
use sqlx::Either;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Which entry point issued the statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatementKind {
    /// Plain query; uses the text protocol when there are no parameters.
    Query,
    /// Prepared statement, always on the writer.
    Prepared,
}

/// Rows and counters gathered from one statement (or `;`-batch).
#[derive(Debug, Default)]
struct Collected {
    rows: Vec<JsonRow>,
    affected_rows: u64,
    insert_id: Option<u64>,
}

/// Runs statements against the pool registry.
///
/// Cheap to clone; clones share the registry.
#[derive(Debug, Clone)]
pub struct StatementExecutor {
    registry: Arc<PoolRegistry>,
    classifier: Classifier,
    format: RowFormat,
}

impl StatementExecutor {
    pub fn new(registry: Arc<PoolRegistry>, classifier: Classifier, format: RowFormat) -> Self {
        Self {
            registry,
            classifier,
            format,
        }
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    /// Role a `query` would be routed to.
    pub fn route(&self, sql: &str, options: QueryOptions) -> ConnectionRole {
        options
            .role
            .unwrap_or_else(|| self.classifier.classify(sql))
    }

    /// Run a query routed by its text (or by `options.role`).
    pub async fn query(
        &self,
        sql: &str,
        params: &[QueryParam],
        options: QueryOptions,
    ) -> ExecutionResult {
        let role = self.route(sql, options);
        self.run_pooled(role, sql, params, StatementKind::Query, options)
            .await
    }

    /// Run a prepared statement on the writer.
    pub async fn execute(
        &self,
        sql: &str,
        params: &[QueryParam],
        options: QueryOptions,
    ) -> ExecutionResult {
        self.run_pooled(
            ConnectionRole::Writer,
            sql,
            params,
            StatementKind::Prepared,
            options,
        )
        .await
    }

    /// Run a query on a caller-owned connection. The connection is not released.
    pub async fn query_on(
        &self,
        conn: &mut PooledConnection,
        sql: &str,
        params: &[QueryParam],
        options: QueryOptions,
    ) -> ExecutionResult {
        self.run_on(conn, sql, params, StatementKind::Query, options)
            .await
    }

    /// Run a prepared statement on a caller-owned connection. The connection is
    /// not released.
    pub async fn execute_on(
        &self,
        conn: &mut PooledConnection,
        sql: &str,
        params: &[QueryParam],
        options: QueryOptions,
    ) -> ExecutionResult {
        self.run_on(conn, sql, params, StatementKind::Prepared, options)
            .await
    }

    async fn run_pooled(
        &self,
        role: ConnectionRole,
        sql: &str,
        params: &[QueryParam],
        kind: StatementKind,
        options: QueryOptions,
    ) -> ExecutionResult {
        let mut conn = match self.registry.acquire(role).await {
            Ok(conn) => conn,
            Err(e) => {
                error!(role = %role, sql = %sql, error = %e, "Failed to acquire connection");
                return ExecutionResult::failed(e.kind());
            }
        };

        let result = self.run_on(&mut conn, sql, params, kind, options).await;

        let pool = conn.pool_label().to_string();
        if let Err(e) = conn.release().await {
            error!(pool = %pool, error = %e, "Failed to release connection");
        }
        result
    }

    async fn run_on(
        &self,
        conn: &mut PooledConnection,
        sql: &str,
        params: &[QueryParam],
        kind: StatementKind,
        options: QueryOptions,
    ) -> ExecutionResult {
        let start = Instant::now();
        let prepared = kind == StatementKind::Prepared || !params.is_empty();
        let format = self.format;

        let outcome = match conn.connection_mut() {
            Ok(db_conn) => impl_db_dispatch!(DbConnection; db_conn, {
                MySql(c) => mysql::run(&mut **c, sql, params, prepared, format).await,
                Postgres(c) => postgres::run(&mut **c, sql, params, prepared, format).await,
                SQLite(c) => sqlite::run(&mut **c, sql, params, prepared, format).await,
            })
            .map_err(DbError::from),
            Err(e) => Err(e),
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(collected) => {
                if !options.silent {
                    info!(
                        pool = %conn.pool_label(),
                        sql = %sql,
                        params = params.len(),
                        rows = collected.rows.len(),
                        affected_rows = collected.affected_rows,
                        elapsed_ms = elapsed_ms,
                        "Statement executed"
                    );
                }
                ExecutionResult::succeeded(
                    collected.rows,
                    collected.affected_rows,
                    collected.insert_id,
                )
            }
            Err(e) => {
                if e.is_retryable() {
                    // The session may be half-read or dead; do not pool it again
                    conn.mark_broken();
                }
                warn!(
                    pool = %conn.pool_label(),
                    sql = %sql,
                    error = %e,
                    sql_state = ?e.sql_state(),
                    elapsed_ms = elapsed_ms,
                    "Statement failed"
                );
                ExecutionResult::failed(e.kind())
            }
        }
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its database type.
// The code structure is intentionally parallel to make differences obvious.

mod mysql {
    use super::*;
    use sqlx::{Executor, MySqlConnection};

    pub async fn run(
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[QueryParam],
        prepared: bool,
        format: RowFormat,
    ) -> Result<Collected, sqlx::Error> {
        // Text protocol allows `;`-batches and statements that cannot be prepared
        let mut stream = if prepared {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_mysql_param(query, param);
            }
            conn.fetch_many(query)
        } else {
            conn.fetch_many(sql)
        };

        let mut out = Collected::default();
        while let Some(step) = stream.try_next().await? {
            match step {
                Either::Left(done) => {
                    out.affected_rows += done.rows_affected();
                    if done.last_insert_id() > 0 {
                        out.insert_id = Some(done.last_insert_id());
                    }
                }
                Either::Right(row) => out.rows.push(row.to_json_map(format)),
            }
        }
        Ok(out)
    }
}

mod postgres {
    use super::*;
    use sqlx::{Executor, PgConnection};

    pub async fn run(
        conn: &mut PgConnection,
        sql: &str,
        params: &[QueryParam],
        prepared: bool,
        format: RowFormat,
    ) -> Result<Collected, sqlx::Error> {
        let mut stream = if prepared {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_postgres_param(query, param);
            }
            conn.fetch_many(query)
        } else {
            conn.fetch_many(sql)
        };

        // No insert id on PostgreSQL; use RETURNING instead
        let mut out = Collected::default();
        while let Some(step) = stream.try_next().await? {
            match step {
                Either::Left(done) => out.affected_rows += done.rows_affected(),
                Either::Right(row) => out.rows.push(row.to_json_map(format)),
            }
        }
        Ok(out)
    }
}

mod sqlite {
    use super::*;
    use sqlx::{Executor, SqliteConnection};

    pub async fn run(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[QueryParam],
        prepared: bool,
        format: RowFormat,
    ) -> Result<Collected, sqlx::Error> {
        // changes() and last_insert_rowid() are per connection and keep their
        // values across later statements, so only trust them for fragments
        // that write
        let effects = fragment_effects(sql);
        let any_effect = effects
            .iter()
            .copied()
            .fold(FragmentEffect::default(), FragmentEffect::union);

        let mut stream = if prepared {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_sqlite_param(query, param);
            }
            conn.fetch_many(query)
        } else {
            conn.fetch_many(sql)
        };

        let mut out = Collected::default();
        let mut statement = 0;
        while let Some(step) = stream.try_next().await? {
            match step {
                Either::Left(done) => {
                    // One result per statement; fall back to the whole batch
                    // when `;` inside literals made the split miscount
                    let effect = effects.get(statement).copied().unwrap_or(any_effect);
                    statement += 1;
                    if !effect.modifies {
                        continue;
                    }
                    out.affected_rows += done.rows_affected();
                    let rowid = done.last_insert_rowid();
                    if effect.inserts && done.rows_affected() > 0 && rowid > 0 {
                        out.insert_id = Some(rowid as u64);
                    }
                }
                Either::Right(row) => out.rows.push(row.to_json_map(format)),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::db::classifier::ClassifierMode;
    use crate::error::ErrorKind;
    use crate::models::DatabaseType;

    async fn executor() -> StatementExecutor {
        let config = ClusterConfig::from_urls(&["sqlite::memory:"], &[]).unwrap();
        let registry = Arc::new(PoolRegistry::initialize(&config).await.unwrap());
        StatementExecutor::new(
            registry,
            Classifier::new(ClassifierMode::Heuristic, DatabaseType::SQLite),
            RowFormat::default(),
        )
    }

    #[tokio::test]
    async fn test_route_prefers_explicit_role() {
        let executor = executor().await;
        assert_eq!(
            executor.route("SELECT 1", QueryOptions::default()),
            ConnectionRole::Reader
        );
        assert_eq!(
            executor.route("SELECT 1", QueryOptions::default().on_writer()),
            ConnectionRole::Writer
        );
        assert_eq!(
            executor.route("CALL p()", QueryOptions::default().read_only()),
            ConnectionRole::Reader
        );
    }

    #[tokio::test]
    async fn test_query_select_one() {
        let executor = executor().await;
        let result = executor
            .query("SELECT 1 AS one", &[], QueryOptions::silent())
            .await;
        assert!(result.success());
        assert_eq!(result.row_count(), 1);
        assert_eq!(result.first_row().unwrap()["one"], serde_json::json!(1));
        assert_eq!(executor.registry().checked_out(ConnectionRole::Writer), 0);
    }

    #[tokio::test]
    async fn test_manual_release_keeps_connection() {
        let executor = executor().await;
        let mut conn = executor
            .registry()
            .acquire(ConnectionRole::Writer)
            .await
            .unwrap();

        let created = executor
            .execute_on(
                &mut conn,
                "CREATE TABLE t (id INTEGER PRIMARY KEY, x INTEGER)",
                &[],
                QueryOptions::default(),
            )
            .await;
        assert!(created.success());

        let inserted = executor
            .execute_on(
                &mut conn,
                "INSERT INTO t (x) VALUES (?)",
                &[QueryParam::Int(7)],
                QueryOptions::default(),
            )
            .await;
        assert_eq!(inserted.affected_rows(), Some(1));
        assert_eq!(inserted.insert_id(), Some(1));

        // Same in-memory database, so the row is visible on this connection
        let rows = executor
            .query_on(&mut conn, "SELECT x FROM t", &[], QueryOptions::default())
            .await;
        assert_eq!(rows.first_row().unwrap()["x"], serde_json::json!(7));
        // The connection still remembers the INSERT; a read reports nothing
        assert_eq!(rows.affected_rows(), Some(0));
        assert_eq!(rows.insert_id(), None);
        assert_eq!(executor.registry().checked_out(ConnectionRole::Writer), 1);

        conn.release().await.unwrap();
        assert_eq!(executor.registry().checked_out(ConnectionRole::Writer), 0);
    }

    #[tokio::test]
    async fn test_statement_failure_is_folded() {
        let executor = executor().await;
        let result = executor
            .query("SELEC broken", &[], QueryOptions::default())
            .await;
        assert!(!result.success());
        assert_eq!(result.error(), Some(ErrorKind::StatementFailure));
        assert!(result.rows().is_none());
        assert_eq!(executor.registry().checked_out(ConnectionRole::Writer), 0);
    }
}
