//! Data models for the database cluster.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod transaction;

// Re-export commonly used types
pub use connection::{ConnectionRole, DatabaseType};
pub use query::{ExecutionResult, JsonRow, QueryOptions, QueryParam};
pub use transaction::{TransactionDecision, TransactionOutcome, TransactionPhase, TransactionState};
