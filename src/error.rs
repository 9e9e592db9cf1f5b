//! Error types for the database cluster.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Only configuration and startup failures escape the crate as `Err`; everything that
//! happens while serving statements is folded into `ExecutionResult` or
//! `TransactionOutcome` and classified with an [`ErrorKind`].

use crate::models::{ConnectionRole, TransactionPhase};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection unavailable ({role}): {message}")]
    ConnectionUnavailable {
        role: ConnectionRole,
        message: String,
        suggestion: String,
    },

    #[error("Statement failed: {message}")]
    Statement {
        message: String,
        /// e.g., "23000" for integrity constraint violation
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Transaction failed during {phase}: {message}")]
    Transaction {
        phase: TransactionPhase,
        message: String,
    },

    #[error("Release failed for pool '{pool}': {message}")]
    Release { pool: String, message: String },

    #[error("Invalid configuration: {message}")]
    Configuration { message: String },
}

/// Serializable classification of a failure, carried by `ExecutionResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionUnavailable,
    StatementFailure,
    TransactionInfrastructureFailure,
    ReleaseFailure,
    InvalidConfiguration,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ConnectionUnavailable => "connection_unavailable",
            Self::StatementFailure => "statement_failure",
            Self::TransactionInfrastructureFailure => "transaction_infrastructure_failure",
            Self::ReleaseFailure => "release_failure",
            Self::InvalidConfiguration => "invalid_configuration",
        };
        f.write_str(name)
    }
}

impl DbError {
    /// Create a connection-unavailable error with a helpful suggestion.
    pub fn connection_unavailable(
        role: ConnectionRole,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::ConnectionUnavailable {
            role,
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a statement error with optional SQL state.
    pub fn statement(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Statement {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a transaction infrastructure error.
    pub fn transaction(phase: TransactionPhase, message: impl Into<String>) -> Self {
        Self::Transaction {
            phase,
            message: message.into(),
        }
    }

    /// Create a release error.
    pub fn release(pool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Release {
            pool: pool.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Classification used in `ExecutionResult.error`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionUnavailable { .. } => ErrorKind::ConnectionUnavailable,
            Self::Statement { .. } => ErrorKind::StatementFailure,
            Self::Transaction { .. } => ErrorKind::TransactionInfrastructureFailure,
            Self::Release { .. } => ErrorKind::ReleaseFailure,
            Self::Configuration { .. } => ErrorKind::InvalidConfiguration,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::ConnectionUnavailable { suggestion, .. } => Some(suggestion),
            Self::Statement { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// SQLSTATE reported by the server, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Statement { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionUnavailable { .. })
    }

    /// Convert a driver error raised while acquiring a connection for `role`.
    pub fn from_acquire(role: ConnectionRole, err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => Self::connection_unavailable(
                role,
                "Timed out waiting for a pooled connection",
                "Increase the connection limit or the acquire timeout",
            ),
            sqlx::Error::PoolClosed => Self::connection_unavailable(
                role,
                "Connection pool is closed",
                "The cluster has been shut down",
            ),
            other => match Self::from(other) {
                Self::Statement { message, .. } => Self::connection_unavailable(
                    role,
                    message,
                    "Check that the database server is running and accessible",
                ),
                Self::ConnectionUnavailable {
                    message,
                    suggestion,
                    ..
                } => Self::connection_unavailable(role, message, suggestion),
                converted => converted,
            },
        }
    }
}

/// Convert sqlx errors to DbError.
///
/// Connectivity problems are attributed to the writer because the driver error
/// does not say which pool raised it; use [`DbError::from_acquire`] when the
/// role is known.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        let role = ConnectionRole::Writer;
        match err {
            sqlx::Error::Configuration(msg) => DbError::configuration(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::statement(
                    db_err.message(),
                    code,
                    "Check the SQL syntax, referenced objects and constraints",
                )
            }
            sqlx::Error::RowNotFound => DbError::statement(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::connection_unavailable(
                role,
                "Timed out waiting for a pooled connection",
                "Increase the connection limit or the acquire timeout",
            ),
            sqlx::Error::PoolClosed => DbError::connection_unavailable(
                role,
                "Connection pool is closed",
                "The cluster has been shut down",
            ),
            sqlx::Error::Io(io_err) => DbError::connection_unavailable(
                role,
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection_unavailable(
                role,
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection_unavailable(
                role,
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => DbError::statement(
                format!("Column not found: {}", col),
                None,
                "Check the selected column names",
            ),
            sqlx::Error::ColumnDecode { index, source } => DbError::statement(
                format!("Failed to decode column {}: {}", index, source),
                None,
                "Check the column types returned by the statement",
            ),
            sqlx::Error::Decode(source) => DbError::statement(
                format!("Decode error: {}", source),
                None,
                "Check the column types returned by the statement",
            ),
            sqlx::Error::WorkerCrashed => DbError::connection_unavailable(
                role,
                "Database worker crashed",
                "Reconnect to the database",
            ),
            _ => DbError::statement(
                format!("Unknown database error: {}", err),
                None,
                "Check the database server logs",
            ),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
