//! In-process scripted driver for tests and dry runs.
//!
//! Statements are interpreted, not parsed:
//!
//! | statement | outcome |
//! |---|---|
//! | `SELECT 1 FROM DUAL` | one row `{"1": 1}` |
//! | `SLEEP <ms>` | sleeps, then one row `{"SLEPT": ms}` |
//! | `ECHO ...` | one row with the statement text and the bind values |
//! | `INSERT`/`UPDATE`/`DELETE ...` | `rowsAffected = 1` |
//! | `PANIC` | panics inside `execute` |
//! | `DISCONNECT` | fails with [`DbError::ConnectionLost`] |
//! | anything else | fails with [`DbError::Query`] |

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};

use crate::{ColumnMeta, Connection, Credentials, DbError, Driver, Params, QueryResult, Row};

#[derive(Default)]
struct FakeState {
    delay: Duration,
    connects: AtomicUsize,
    closed: AtomicUsize,
    failing_connects: AtomicUsize,
    executing: AtomicUsize,
    peak: AtomicUsize,
    executed: Mutex<Vec<(String, Params)>>,
}

/// Cloning shares the counters, so a test can keep a handle while the pool
/// owns another.
#[derive(Clone, Default)]
pub struct FakeDriver {
    state: Arc<FakeState>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fixed latency to every statement.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            state: Arc::new(FakeState {
                delay,
                ..FakeState::default()
            }),
        }
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.state.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Connection attempts so far, failed ones included.
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Connections dropped so far, by a pool closing or discarding them.
    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Highest number of statements observed executing at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    /// Every statement that reached a connection, in execution order.
    pub fn executed(&self) -> Vec<(String, Params)> {
        self.state
            .executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct FakeConn {
    state: Arc<FakeState>,
}

impl Drop for FakeConn {
    fn drop(&mut self) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct Executing<'a>(&'a FakeState);

impl<'a> Executing<'a> {
    fn enter(state: &'a FakeState) -> Self {
        let now = state.executing.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for Executing<'_> {
    fn drop(&mut self) {
        self.0.executing.fetch_sub(1, Ordering::SeqCst);
    }
}

fn single_row(column: &str, value: Value) -> QueryResult {
    let mut row = Row::new();
    row.insert(column.to_string(), value);
    QueryResult::with_rows(vec![ColumnMeta::named(column)], vec![row])
}

impl Connection for FakeConn {
    fn execute(&mut self, sql: &str, params: &Params) -> Result<QueryResult, DbError> {
        let _executing = Executing::enter(&self.state);
        self.state
            .executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((sql.to_string(), params.clone()));
        if !self.state.delay.is_zero() {
            thread::sleep(self.state.delay);
        }

        let statement = sql.trim();
        let upper = statement.to_ascii_uppercase();
        let verb = upper.split_whitespace().next().unwrap_or("");
        match verb {
            "SELECT" if upper == "SELECT 1 FROM DUAL" => Ok(single_row("1", json!(1))),
            "SLEEP" => {
                let millis: u64 = upper
                    .split_whitespace()
                    .nth(1)
                    .and_then(|raw| raw.parse().ok())
                    .ok_or_else(|| DbError::Query(format!("invalid SLEEP statement: {statement}")))?;
                thread::sleep(Duration::from_millis(millis));
                Ok(single_row("SLEPT", json!(millis)))
            }
            "ECHO" => {
                let mut row = Row::new();
                row.insert("SQL".into(), json!(sql));
                row.insert("PARAMS".into(), serde_json::to_value(params).unwrap_or(Value::Null));
                Ok(QueryResult::with_rows(
                    vec![ColumnMeta::named("SQL"), ColumnMeta::named("PARAMS")],
                    vec![row],
                ))
            }
            "INSERT" | "UPDATE" | "DELETE" => Ok(QueryResult::affected(1)),
            "PANIC" => panic!("fake driver panicked on request"),
            "DISCONNECT" => Err(DbError::ConnectionLost("fake connection reset".into())),
            _ => Err(DbError::Query(format!(
                "invalid SQL statement: {statement}"
            ))),
        }
    }
}

impl Driver for FakeDriver {
    type Connection = FakeConn;

    fn name(&self) -> &'static str {
        "fake"
    }

    fn check_credentials(&self, _credentials: &Credentials) -> Result<(), DbError> {
        Ok(())
    }

    fn connect(&self, _credentials: &Credentials) -> Result<FakeConn, DbError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self.state.failing_connects.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |left| left.checked_sub(1),
        );
        if failing.is_ok() {
            return Err(DbError::Connect("fake connect refused".into()));
        }
        Ok(FakeConn {
            state: Arc::clone(&self.state),
        })
    }
}
