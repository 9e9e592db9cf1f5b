//! db-cluster library
//!
//! Multiplexes SQL traffic over one writer and any number of read replicas
//! (MySQL, PostgreSQL, SQLite), with statement routing, single-connection
//! transactions and keepalive probing.

pub mod cluster;
pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use cluster::DbCluster;
pub use config::{ClusterConfig, Config};
pub use error::{DbError, DbResult, ErrorKind};
pub use models::{
    ConnectionRole, DatabaseType, ExecutionResult, QueryOptions, QueryParam, TransactionDecision,
    TransactionOutcome,
};
