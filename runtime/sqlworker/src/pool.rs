//! Public entry point.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_channel::Sender;
use sqlworker_db::{Driver, Params, QueryResult};
use tokio::sync::oneshot;

use crate::config::PoolConfig;
use crate::dispatcher::{Dispatcher, Message, PoolStats};
use crate::error::{PoolError, PoolResult};
use crate::task::{Query, QueryHandle, ShutdownHandle, Task, TaskId};

/// A bounded pool of database execution units.
///
/// Construct one at process start with [`WorkerPool::start`], share it by
/// reference (or `Arc`) with whatever issues queries, and call
/// [`shutdown`](Self::shutdown) before exiting. Dropping the pool starts a
/// shutdown without waiting for it.
pub struct WorkerPool {
    inbox: Sender<Message>,
    next_task: AtomicU64,
    closing: AtomicBool,
    target: usize,
}

impl WorkerPool {
    /// Spawn `config.workers` execution units using `driver`.
    ///
    /// Units open their connection pools in the background; tasks submitted
    /// before any unit is ready simply wait in the queue.
    pub fn start<D: Driver>(driver: D, config: PoolConfig) -> PoolResult<Self> {
        Self::start_shared(Arc::new(driver), config)
    }

    /// Like [`start`](Self::start) for a driver the caller keeps a handle to.
    pub fn start_shared<D: Driver>(driver: Arc<D>, config: PoolConfig) -> PoolResult<Self> {
        config.validate()?;
        let target = config.workers;
        let inbox = Dispatcher::start(driver, config)?;
        Ok(Self {
            inbox,
            next_task: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            target,
        })
    }

    /// Queue a statement. The handle resolves exactly once with the result or
    /// the failure.
    ///
    /// Fails immediately with [`PoolError::ShuttingDown`] once
    /// [`terminate`](Self::terminate) has been called.
    pub fn execute_query(
        &self,
        sql: impl Into<String>,
        params: impl Into<Params>,
    ) -> PoolResult<QueryHandle> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }
        let id = TaskId(self.next_task.fetch_add(1, Ordering::Relaxed) + 1);
        let (task, handle) = Task::new(
            id,
            Query {
                sql: sql.into(),
                params: params.into(),
            },
        );
        self.inbox
            .send(Message::Submit(task))
            .map_err(|_| PoolError::ShuttingDown)?;
        Ok(handle)
    }

    /// Submit and await in one step.
    pub async fn query(
        &self,
        sql: impl Into<String>,
        params: impl Into<Params>,
    ) -> PoolResult<QueryResult> {
        self.execute_query(sql, params)?.await
    }

    /// Stop every unit and resolve once all of them have exited.
    ///
    /// Tasks still waiting in the queue are rejected with
    /// [`PoolError::Terminated`]; tasks already running finish first. Calling
    /// this again joins the shutdown already in progress.
    pub fn terminate(&self) -> ShutdownHandle {
        self.closing.store(true, Ordering::SeqCst);
        let (reply, rx) = oneshot::channel();
        match self.inbox.send(Message::Shutdown(reply)) {
            Ok(()) => ShutdownHandle::pending(rx),
            Err(_) => ShutdownHandle::done(),
        }
    }

    pub async fn shutdown(&self) {
        self.terminate().await
    }

    pub async fn stats(&self) -> PoolResult<PoolStats> {
        let (reply, rx) = oneshot::channel();
        self.inbox
            .send(Message::Stats(reply))
            .map_err(|_| PoolError::Terminated)?;
        rx.await.map_err(|_| PoolError::Terminated)
    }

    /// The number of units the pool keeps alive.
    pub fn target_workers(&self) -> usize {
        self.target
    }

    pub fn is_shutting_down(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            let (reply, _rx) = oneshot::channel();
            let _ = self.inbox.send(Message::Shutdown(reply));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{ExitCause, UnitEvent, UnitState};
    use sqlworker_db::Credentials;
    use sqlworker_db::fake::FakeDriver;
    use std::time::Duration;

    fn config(workers: usize) -> PoolConfig {
        PoolConfig::new(Credentials::default())
            .with_workers(workers)
            .with_restart_backoff(Duration::from_millis(5), Duration::from_millis(20))
    }

    async fn wait_for<F>(pool: &WorkerPool, mut done: F) -> PoolStats
    where
        F: FnMut(&PoolStats) -> bool,
    {
        for _ in 0..400 {
            let stats = pool.stats().await.expect("stats");
            if done(&stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pool never reached the expected state");
    }

    #[tokio::test]
    async fn units_become_idle_after_init() {
        let pool = WorkerPool::start(FakeDriver::new(), config(3)).expect("pool");
        assert_eq!(pool.target_workers(), 3);
        let stats = wait_for(&pool, |stats| stats.idle == 3).await;
        assert_eq!(stats.target, 3);
        assert_eq!(stats.live(), 3);
        assert_eq!(stats.restarts, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn idle_crash_is_replaced_without_losing_tasks() {
        let driver = FakeDriver::with_delay(Duration::from_millis(5));
        let pool = WorkerPool::start(driver, config(2)).expect("pool");
        let stats = wait_for(&pool, |stats| stats.idle == 2).await;
        let victim = stats.units[0].id;

        pool.inbox
            .send(Message::Unit {
                unit: victim,
                event: UnitEvent::Exited {
                    cause: ExitCause::Panicked,
                },
            })
            .expect("inject");
        let handles: Vec<_> = (0..4)
            .map(|_| pool.execute_query("SELECT 1 FROM DUAL", ()).expect("submit"))
            .collect();
        for handle in handles {
            assert_eq!(handle.await.expect("result").rows.len(), 1);
        }

        let stats = wait_for(&pool, |stats| stats.idle == 2).await;
        assert_eq!(stats.restarts, 1);
        assert!(stats.units.iter().all(|unit| unit.id != victim));
        assert!(stats.units.iter().all(|unit| unit.state == UnitState::Idle));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn task_ids_are_unique_and_increasing() {
        let pool = WorkerPool::start(FakeDriver::new(), config(1)).expect("pool");
        let first = pool.execute_query("SELECT 1 FROM DUAL", ()).expect("first");
        let second = pool.execute_query("SELECT 1 FROM DUAL", ()).expect("second");
        assert!(first.id() < second.id());
        first.await.expect("first result");
        second.await.expect("second result");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn dropping_the_pool_stops_the_units() {
        let driver = FakeDriver::new();
        let pool = WorkerPool::start(driver.clone(), config(2)).expect("pool");
        wait_for(&pool, |stats| stats.idle == 2).await;
        let inbox = pool.inbox.clone();
        drop(pool);
        for _ in 0..400 {
            let (reply, rx) = oneshot::channel();
            if inbox.send(Message::Stats(reply)).is_err() || rx.await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("dispatcher kept running after the pool was dropped");
    }
}
