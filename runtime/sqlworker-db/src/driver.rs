use std::fmt;

use crate::{DbError, Params, QueryResult};

/// Login material handed to a [`Driver`] when it opens connections.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    /// Driver specific target: a DSN, a TNS alias or a file path.
    pub connect_string: String,
}

impl Credentials {
    pub fn new(
        user: impl Into<String>,
        password: impl Into<String>,
        connect_string: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            connect_string: connect_string.into(),
        }
    }

    /// Credentials for drivers that only need a target, such as SQLite.
    pub fn target(connect_string: impl Into<String>) -> Self {
        Self {
            connect_string: connect_string.into(),
            ..Self::default()
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("connect_string", &self.connect_string)
            .finish()
    }
}

/// A single database session.
///
/// Connections are driven from one execution unit thread at a time, so
/// `execute` takes `&mut self`.
pub trait Connection: Send + 'static {
    fn execute(&mut self, sql: &str, params: &Params) -> Result<QueryResult, DbError>;

    /// Cheap liveness probe used before reusing a long-idle connection.
    fn ping(&mut self) -> Result<(), DbError> {
        Ok(())
    }
}

/// Opens connections for a [`ConnectionPool`](crate::ConnectionPool).
pub trait Driver: Send + Sync + 'static {
    type Connection: Connection;

    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Reject credentials that can never work before any connection is tried.
    fn check_credentials(&self, credentials: &Credentials) -> Result<(), DbError> {
        let mut missing = Vec::new();
        if credentials.user.is_empty() {
            missing.push("user");
        }
        if credentials.password.is_empty() {
            missing.push("password");
        }
        if credentials.connect_string.is_empty() {
            missing.push("connect string");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(DbError::MissingCredentials(missing.join(", ")))
        }
    }

    fn connect(&self, credentials: &Credentials) -> Result<Self::Connection, DbError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDriver;

    struct NullConn;

    impl Connection for NullConn {
        fn execute(&mut self, _sql: &str, _params: &Params) -> Result<QueryResult, DbError> {
            Ok(QueryResult::default())
        }
    }

    impl Driver for NullDriver {
        type Connection = NullConn;

        fn name(&self) -> &'static str {
            "null"
        }

        fn connect(&self, _credentials: &Credentials) -> Result<NullConn, DbError> {
            Ok(NullConn)
        }
    }

    #[test]
    fn default_credential_check_lists_every_missing_field() {
        let err = NullDriver
            .check_credentials(&Credentials::target("db.example:1521/ORCL"))
            .unwrap_err();
        assert_eq!(err.to_string(), "missing credentials: user, password");
        assert!(
            NullDriver
                .check_credentials(&Credentials::new("app", "secret", "db"))
                .is_ok()
        );
    }

    #[test]
    fn debug_output_hides_password() {
        let rendered = format!("{:?}", Credentials::new("app", "hunter2", "db"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
