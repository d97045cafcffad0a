use std::time::Duration;

use thiserror::Error;

/// Errors raised by drivers and connection pools.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("invalid pool options: {0}")]
    InvalidOptions(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    /// The driver could not open a connection.
    #[error("connection failed: {0}")]
    Connect(String),

    /// An open connection broke while in use. The pool discards it instead of
    /// handing it out again.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("no connection available after {0:?}")]
    AcquireTimeout(Duration),

    #[error("connection pool is closed")]
    PoolClosed,

    /// The statement itself failed: bad SQL, constraint violation, bad binds.
    #[error("{0}")]
    Query(String),

    #[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl DbError {
    /// True when the connection that produced this error must not be reused.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, DbError::ConnectionLost(_))
    }
}
