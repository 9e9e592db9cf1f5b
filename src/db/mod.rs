//! Database access layer.
//!
//! This module provides:
//! - Pool registry with one writer group and rotating reader pools
//! - Statement classification (writer vs reader)
//! - Statement execution folded into `ExecutionResult`
//! - Transaction coordination on a single writer connection
//! - Keepalive probing against server idle timeouts
//! - Type mappings and database dispatch macros

pub mod classifier;
pub mod executor;
pub mod keepalive;
#[macro_use]
pub mod macros;
pub mod params;
pub mod pool;
pub mod transaction;
pub mod types;

pub use classifier::{Classifier, ClassifierMode};
pub use executor::StatementExecutor;
pub use keepalive::{DiscoveryFailure, KeepaliveMonitor};
pub use pool::{DbPool, PoolHandle, PoolRegistry, PoolStats, PooledConnection};
pub use transaction::{TransactionCoordinator, TransactionScope};
pub use types::RowFormat;
