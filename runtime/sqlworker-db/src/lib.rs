//! Connection-resource pools and drivers for sqlworker execution units.
//!
//! Every execution unit owns exactly one [`ConnectionPool`]. The pool is
//! generic over a [`Driver`], which knows how to open a [`Connection`] from
//! [`Credentials`]. Connections are checked out as [`Pooled`] guards and go
//! back to the pool when the guard drops, even if the query failed.

mod driver;
mod envelope;
mod error;
pub mod fake;
mod pool;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub mod sqlite;

pub use driver::{Connection, Credentials, Driver};
pub use envelope::{ColumnMeta, Params, QueryResult, Row};
pub use error::DbError;
pub use pool::{ConnectionPool, PoolOptions, Pooled};
