//! Tasks and the handles callers wait on.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use sqlworker_db::{Params, QueryResult};
use tokio::sync::oneshot;

use crate::error::{PoolError, PoolResult};

/// Correlation id linking a dispatched command to its result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// The statement a task carries. Shared with the unit that runs it, so the
/// bind values reach the driver exactly as submitted.
#[derive(Debug, PartialEq)]
pub struct Query {
    pub sql: String,
    pub params: Params,
}

pub(crate) type Outcome = PoolResult<QueryResult>;

pub(crate) struct Task {
    pub(crate) id: TaskId,
    pub(crate) query: Arc<Query>,
    /// Dispatches that ended with the unit dying.
    pub(crate) attempts: u32,
    reply: oneshot::Sender<Outcome>,
}

impl Task {
    pub(crate) fn new(id: TaskId, query: Query) -> (Self, QueryHandle) {
        let (reply, rx) = oneshot::channel();
        let task = Self {
            id,
            query: Arc::new(query),
            attempts: 0,
            reply,
        };
        (task, QueryHandle { id, rx })
    }

    /// Deliver the terminal outcome. Consumes the task, so it fires once.
    pub(crate) fn complete(self, outcome: Outcome) {
        // The caller may have dropped its handle; the outcome is discarded.
        let _ = self.reply.send(outcome);
    }
}

/// Resolves once with the task's result.
///
/// Await it from async code or call [`wait`](Self::wait) from a plain
/// thread. If the pool disappears first it resolves with
/// [`PoolError::Terminated`].
#[must_use = "dropping the handle discards the query result"]
pub struct QueryHandle {
    id: TaskId,
    rx: oneshot::Receiver<Outcome>,
}

impl QueryHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Block the current thread until the task resolves.
    ///
    /// Panics if called from inside an async runtime; await the handle there.
    pub fn wait(self) -> Outcome {
        self.rx.blocking_recv().unwrap_or(Err(PoolError::Terminated))
    }
}

impl Future for QueryHandle {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(PoolError::Terminated)))
    }
}

/// Resolves when every execution unit has exited.
#[must_use = "dropping the handle does not wait for shutdown"]
pub struct ShutdownHandle {
    rx: Option<oneshot::Receiver<()>>,
}

impl ShutdownHandle {
    pub(crate) fn pending(rx: oneshot::Receiver<()>) -> Self {
        Self { rx: Some(rx) }
    }

    pub(crate) fn done() -> Self {
        Self { rx: None }
    }

    pub fn wait(self) {
        if let Some(rx) = self.rx {
            let _ = rx.blocking_recv();
        }
    }
}

impl Future for ShutdownHandle {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match self.rx.as_mut() {
            // A dropped sender means the dispatcher already finished.
            Some(rx) => Pin::new(rx).poll(cx).map(|_| ()),
            None => Poll::Ready(()),
        }
    }
}
