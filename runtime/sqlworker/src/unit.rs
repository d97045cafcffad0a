//! Execution units: one thread, one private connection pool.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use serde::Serialize;
use sqlworker_db::{
    Connection, ConnectionPool, Credentials, DbError, Driver, PoolOptions, QueryResult,
};
use tracing::{debug, error, info, warn};

use crate::dispatcher::Message;
use crate::task::{Query, TaskId};

/// Identity of one execution unit incarnation.
///
/// `slot` is the supervisor's index and survives replacement; `serial` is
/// fresh for every unit ever spawned, so messages from a dead predecessor in
/// the same slot are recognisable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct UnitId {
    pub slot: usize,
    pub serial: u64,
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{} (slot {})", self.serial, self.slot)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Initializing,
    Idle,
    Busy,
    Dead,
}

/// Everything a unit needs to build its private pool.
#[derive(Clone, Debug)]
pub(crate) struct UnitSettings {
    pub(crate) credentials: Credentials,
    pub(crate) connections: PoolOptions,
    pub(crate) shutdown_drain: Duration,
}

pub(crate) enum Command {
    /// Wait `backoff` (unless terminated meanwhile), then open the pool.
    Init { backoff: Duration },
    Query { task: TaskId, query: Arc<Query> },
    Terminate,
}

#[derive(Debug)]
pub(crate) enum UnitEvent {
    Ready,
    Finished {
        task: TaskId,
        outcome: Result<QueryResult, String>,
    },
    Exited {
        cause: ExitCause,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ExitCause {
    Terminated,
    InitFailed(String),
    Panicked,
    /// The command channel closed without a `Terminate`.
    Disconnected,
}

impl ExitCause {
    pub(crate) fn is_clean(&self) -> bool {
        matches!(self, ExitCause::Terminated)
    }
}

/// The supervisor's view of a live unit.
pub(crate) struct UnitHandle {
    pub(crate) id: UnitId,
    pub(crate) state: UnitState,
    pub(crate) task: Option<TaskId>,
    /// Consecutive init failures in this slot, carried across replacements.
    pub(crate) failures: u32,
    commands: Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl UnitHandle {
    /// Returns the command back if the unit's thread is gone.
    pub(crate) fn send(&self, command: Command) -> Result<(), Command> {
        self.commands.send(command).map_err(|err| err.into_inner())
    }

    pub(crate) fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                debug!(unit = %self.id, "unit thread ended by panic");
            }
        }
    }
}

/// Start a unit thread and queue its `Init`.
pub(crate) fn spawn<D: Driver>(
    id: UnitId,
    driver: Arc<D>,
    settings: Arc<UnitSettings>,
    events: Sender<Message>,
    backoff: Duration,
    failures: u32,
) -> std::io::Result<UnitHandle> {
    let (commands, inbox) = unbounded();
    // Queued before the thread exists, so Init is always the first command.
    let _ = commands.send(Command::Init { backoff });
    let thread = thread::Builder::new()
        .name(format!("sqlworker-unit-{}", id.serial))
        .spawn(move || run(id, driver, settings, inbox, events))?;
    Ok(UnitHandle {
        id,
        state: UnitState::Initializing,
        task: None,
        failures,
        commands,
        thread: Some(thread),
    })
}

/// Reports the unit's exit to the dispatcher, including exits by panic.
struct ExitGuard {
    id: UnitId,
    events: Sender<Message>,
    cause: Option<ExitCause>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let cause = if thread::panicking() {
            ExitCause::Panicked
        } else {
            self.cause.take().unwrap_or(ExitCause::Disconnected)
        };
        let _ = self.events.send(Message::Unit {
            unit: self.id,
            event: UnitEvent::Exited { cause },
        });
    }
}

fn run<D: Driver>(
    id: UnitId,
    driver: Arc<D>,
    settings: Arc<UnitSettings>,
    inbox: Receiver<Command>,
    events: Sender<Message>,
) {
    let mut guard = ExitGuard {
        id,
        events: events.clone(),
        cause: None,
    };
    let report = |event: UnitEvent| {
        let _ = events.send(Message::Unit { unit: id, event });
    };
    let mut pool: Option<Arc<ConnectionPool<D>>> = None;

    while let Ok(command) = inbox.recv() {
        match command {
            Command::Init { backoff } => {
                if !backoff.is_zero() {
                    debug!(unit = %id, ?backoff, "delaying unit start");
                    match inbox.recv_timeout(backoff) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(Command::Terminate) | Err(RecvTimeoutError::Disconnected) => {
                            guard.cause = Some(ExitCause::Terminated);
                            return;
                        }
                        Ok(_) => warn!(unit = %id, "command arrived before init; dropped"),
                    }
                }
                match ConnectionPool::create(
                    Arc::clone(&driver),
                    settings.credentials.clone(),
                    settings.connections.clone(),
                ) {
                    Ok(created) => {
                        info!(unit = %id, driver = driver.name(), "execution unit ready");
                        pool = Some(created);
                        report(UnitEvent::Ready);
                    }
                    Err(err) => {
                        error!(unit = %id, error = %err, "connection pool init failed");
                        guard.cause = Some(ExitCause::InitFailed(err.to_string()));
                        return;
                    }
                }
            }
            Command::Query { task, query } => {
                let outcome = match pool.as_ref() {
                    Some(pool) => execute(pool, &query).map_err(|err| err.to_string()),
                    None => Err("execution unit has no connection pool".to_string()),
                };
                report(UnitEvent::Finished { task, outcome });
            }
            Command::Terminate => {
                if let Some(pool) = pool.take() {
                    let outstanding = pool.close(settings.shutdown_drain);
                    if outstanding > 0 {
                        warn!(unit = %id, outstanding, "closed pool with connections still checked out");
                    }
                }
                debug!(unit = %id, "execution unit terminated");
                guard.cause = Some(ExitCause::Terminated);
                return;
            }
        }
    }
}

/// Run one statement with a scoped connection. The connection returns to the
/// pool on every path except a broken connection, which is discarded.
fn execute<D: Driver>(pool: &Arc<ConnectionPool<D>>, query: &Query) -> Result<QueryResult, DbError> {
    let mut conn = pool.acquire()?;
    match conn.execute(&query.sql, &query.params) {
        Ok(result) => Ok(result),
        Err(err) => {
            if err.is_connection_fatal() {
                conn.discard();
            }
            Err(err)
        }
    }
}
