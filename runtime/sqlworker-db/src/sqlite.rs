//! SQLite driver backed by rusqlite.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{ErrorCode, OpenFlags, Statement};
use serde_json::{Number, Value};

use crate::{
    ColumnMeta, Connection, ConnectionPool, Credentials, DbError, Driver, Params, PoolOptions,
    QueryResult, Row,
};

const BUSY_TIMEOUT_MS: u64 = 100;
const MEMORY_TARGET: &str = ":memory:";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SqliteOpenMode {
    ReadOnly,
    ReadWrite,
}

/// Opens SQLite databases named by `Credentials::connect_string`.
///
/// `":memory:"` opens a private in-memory database per connection, so it is
/// only useful with single-connection pools.
#[derive(Clone, Debug)]
pub struct SqliteDriver {
    mode: SqliteOpenMode,
    busy_timeout: Duration,
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new(SqliteOpenMode::ReadWrite)
    }
}

impl SqliteDriver {
    pub fn new(mode: SqliteOpenMode) -> Self {
        Self {
            mode,
            busy_timeout: Duration::from_millis(BUSY_TIMEOUT_MS),
        }
    }

    pub fn read_only() -> Self {
        Self::new(SqliteOpenMode::ReadOnly)
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }
}

pub struct SqliteConn {
    conn: rusqlite::Connection,
}

impl SqliteConn {
    pub fn open(path: &Path, mode: SqliteOpenMode, busy_timeout: Duration) -> Result<Self, DbError> {
        let opened = if path == Path::new(MEMORY_TARGET) {
            rusqlite::Connection::open_in_memory()
        } else {
            let flags = match mode {
                SqliteOpenMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY,
                SqliteOpenMode::ReadWrite => {
                    OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
                }
            };
            rusqlite::Connection::open_with_flags(path, flags)
        };
        let conn = opened.map_err(|err| DbError::Connect(err.to_string()))?;
        conn.busy_timeout(busy_timeout)?;
        if matches!(mode, SqliteOpenMode::ReadOnly) {
            conn.pragma_update(None, "query_only", 1)?;
        }
        Ok(Self { conn })
    }

    fn run(&mut self, sql: &str, params: &Params) -> Result<QueryResult, rusqlite::Error> {
        let mut stmt = self.conn.prepare(sql)?;
        bind_params(&mut stmt, params)?;
        if stmt.column_count() == 0 {
            let changed = stmt.raw_execute()?;
            return Ok(QueryResult::affected(changed as u64));
        }

        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = Vec::new();
        {
            let mut cursor = stmt.raw_query();
            while let Some(row) = cursor.next()? {
                let mut record = Row::new();
                for (idx, name) in names.iter().enumerate() {
                    record.insert(name.clone(), json_from_sql(row.get_ref(idx)?));
                }
                rows.push(record);
            }
        }
        let columns = names.into_iter().map(ColumnMeta::named).collect();
        let mut result = QueryResult::with_rows(columns, rows);
        if !stmt.readonly() {
            result.rows_affected = self.conn.changes() as u64;
        }
        Ok(result)
    }
}

impl Connection for SqliteConn {
    fn execute(&mut self, sql: &str, params: &Params) -> Result<QueryResult, DbError> {
        self.run(sql, params).map_err(classify)
    }

    fn ping(&mut self) -> Result<(), DbError> {
        self.conn
            .query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|err| DbError::ConnectionLost(err.to_string()))
    }
}

impl Driver for SqliteDriver {
    type Connection = SqliteConn;

    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn check_credentials(&self, credentials: &Credentials) -> Result<(), DbError> {
        if credentials.connect_string.trim().is_empty() {
            return Err(DbError::MissingCredentials("database path".into()));
        }
        Ok(())
    }

    fn connect(&self, credentials: &Credentials) -> Result<SqliteConn, DbError> {
        SqliteConn::open(
            Path::new(credentials.connect_string.trim()),
            self.mode,
            self.busy_timeout,
        )
    }
}

pub fn sqlite_pool(
    path: &Path,
    mode: SqliteOpenMode,
    options: PoolOptions,
) -> Result<Arc<ConnectionPool<SqliteDriver>>, DbError> {
    ConnectionPool::create(
        Arc::new(SqliteDriver::new(mode)),
        Credentials::target(path.to_string_lossy()),
        options,
    )
}

fn bind_params(stmt: &mut Statement<'_>, params: &Params) -> Result<(), rusqlite::Error> {
    match params {
        Params::Positional(values) => {
            let expected = stmt.parameter_count();
            if values.len() != expected {
                return Err(rusqlite::Error::InvalidParameterCount(values.len(), expected));
            }
            for (idx, value) in values.iter().enumerate() {
                stmt.raw_bind_parameter(idx + 1, sql_from_json(value))?;
            }
        }
        Params::Named(values) => {
            for (name, value) in values {
                let idx = named_index(stmt, name)?
                    .ok_or_else(|| rusqlite::Error::InvalidParameterName(name.clone()))?;
                stmt.raw_bind_parameter(idx, sql_from_json(value))?;
            }
        }
    }
    Ok(())
}

/// Accept bind names with or without their sigil (`id` matches `:id`).
fn named_index(stmt: &Statement<'_>, name: &str) -> Result<Option<usize>, rusqlite::Error> {
    if name.starts_with([':', '@', '$']) {
        return stmt.parameter_index(name);
    }
    for sigil in [':', '@', '$'] {
        if let Some(idx) = stmt.parameter_index(&format!("{sigil}{name}"))? {
            return Ok(Some(idx));
        }
    }
    Ok(None)
}

fn sql_from_json(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(int) => SqlValue::Integer(int),
            None => SqlValue::Real(number.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        nested => SqlValue::Text(nested.to_string()),
    }
}

fn json_from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(int) => Value::from(int),
        ValueRef::Real(real) => Number::from_f64(real).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(BASE64.encode(bytes)),
    }
}

fn classify(err: rusqlite::Error) -> DbError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::SystemIoFailure
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::NotADatabase
                    | ErrorCode::CannotOpen
            ) =>
        {
            DbError::ConnectionLost(err.to_string())
        }
        _ => DbError::Sqlite(err),
    }
}
