//! Database dispatch macros for reducing code duplication.
//!
//! This module provides declarative macros that generate database-specific
//! implementations while maintaining linear readability. The macros expand
//! at compile time with zero runtime overhead.

/// Macro for generating database dispatch match arms.
///
/// This macro generates match arms for the per-backend enums in
/// [`crate::db::pool`]. Without an enum name it matches `DbPool` variants.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(pool, {
///     MySql(p) => do_mysql(p),
///     Postgres(p) => do_postgres(p),
///     SQLite(p) => do_sqlite(p),
/// });
///
/// impl_db_dispatch!(DbConnection; conn, {
///     MySql(c) => mysql::run(&mut **c).await,
///     Postgres(c) => postgres::run(&mut **c).await,
///     SQLite(c) => sqlite::run(&mut **c).await,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($kind:ident; $value:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $value {
            $(
                $crate::db::pool::$kind::$variant($p) => $body,
            )+
        }
    };
    ($pool:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        $crate::impl_db_dispatch!(DbPool; $pool, { $($variant($p) => $body),+ })
    };
}

pub use impl_db_dispatch;
