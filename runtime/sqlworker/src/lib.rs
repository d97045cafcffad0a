//! Bounded pool of database execution units.
//!
//! A [`WorkerPool`] keeps a fixed number of execution units alive. Each unit
//! is an OS thread with its own private connection pool. Callers submit a
//! statement with [`WorkerPool::execute_query`] and get a [`QueryHandle`]
//! that resolves once; a single dispatcher thread hands queued tasks to idle
//! units in submission order and replaces units that die.
//!
//! ```no_run
//! use sqlworker::{PoolConfig, WorkerPool};
//! use sqlworker_db::sqlite::SqliteDriver;
//!
//! # async fn demo() -> Result<(), sqlworker::PoolError> {
//! let config = PoolConfig::from_env()?;
//! let pool = WorkerPool::start(SqliteDriver::default(), config)?;
//! let result = pool.query("SELECT 1 AS one", ()).await?;
//! assert_eq!(result.rows.len(), 1);
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod dispatcher;
mod error;
mod pool;
mod task;
mod unit;

pub use config::{PoolConfig, default_workers};
pub use dispatcher::{PoolStats, UnitSnapshot};
pub use error::{PoolError, PoolResult};
pub use pool::WorkerPool;
pub use task::{Query, QueryHandle, ShutdownHandle, TaskId};
pub use unit::{UnitId, UnitState};

pub use sqlworker_db::{Credentials, Params, PoolOptions, QueryResult};
