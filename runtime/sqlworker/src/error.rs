use thiserror::Error;

use crate::unit::UnitId;

/// Failures surfaced to callers of the [`WorkerPool`](crate::WorkerPool).
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Submission after `terminate` has begun.
    #[error("worker pool is shutting down")]
    ShuttingDown,

    /// The pool stopped before the task could run.
    #[error("worker pool terminated before the task ran")]
    Terminated,

    /// The statement ran and failed; the unit stays healthy.
    #[error("query failed: {0}")]
    Query(String),

    /// The unit running the task died and the retry budget is spent.
    #[error("{unit} exited while running the task")]
    UnitLost { unit: UnitId },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to spawn thread: {0}")]
    Spawn(String),
}

pub type PoolResult<T> = Result<T, PoolError>;
