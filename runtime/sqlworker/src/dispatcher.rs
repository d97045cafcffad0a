//! The single coordination thread.
//!
//! The dispatcher owns the unit slots, the pending-task map, the FIFO queue
//! and the idle registry. Nothing else touches them: submissions, unit
//! events, stats requests and shutdown all arrive as [`Message`]s on one
//! channel and are handled in order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use serde::Serialize;
use sqlworker_db::{Driver, QueryResult};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::task::{Outcome, Task, TaskId};
use crate::unit::{self, Command, ExitCause, UnitEvent, UnitHandle, UnitId, UnitSettings, UnitState};

/// Floor on the retry interval after a failed replacement spawn.
const MIN_RESPAWN_RETRY: Duration = Duration::from_millis(10);

pub(crate) enum Message {
    Submit(Task),
    Unit { unit: UnitId, event: UnitEvent },
    Stats(oneshot::Sender<PoolStats>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone, Debug, Serialize)]
pub struct UnitSnapshot {
    pub id: UnitId,
    pub state: UnitState,
}

/// Point-in-time view of the pool, taken on the dispatcher thread.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PoolStats {
    pub target: usize,
    pub units: Vec<UnitSnapshot>,
    pub initializing: usize,
    pub idle: usize,
    pub busy: usize,
    /// Tasks waiting for a unit.
    pub queued: usize,
    /// Tasks dispatched and not yet resolved.
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    /// Units spawned to replace dead ones.
    pub restarts: u64,
    pub shutting_down: bool,
}

impl PoolStats {
    /// Units that have not died.
    pub fn live(&self) -> usize {
        self.units
            .iter()
            .filter(|unit| unit.state != UnitState::Dead)
            .count()
    }
}

enum TaskState {
    Queued,
    Dispatched(UnitId),
}

struct TaskRecord {
    task: Task,
    state: TaskState,
}

pub(crate) struct Dispatcher<D: Driver> {
    driver: Arc<D>,
    settings: Arc<UnitSettings>,
    config: PoolConfig,
    inbox: Receiver<Message>,
    /// Cloned into every unit so it can report back.
    outbox: Sender<Message>,
    slots: Vec<UnitHandle>,
    /// Oldest-idle first.
    idle: VecDeque<UnitId>,
    /// Ids of tasks not yet dispatched, oldest first.
    queue: VecDeque<TaskId>,
    /// Every unresolved task, queued or in flight.
    pending: HashMap<TaskId, TaskRecord>,
    next_serial: u64,
    /// Set once shutdown begins; resolved when every unit has exited.
    waiters: Option<Vec<oneshot::Sender<()>>>,
    respawn_pending: bool,
    completed: u64,
    failed: u64,
    restarts: u64,
}

impl<D: Driver> Dispatcher<D> {
    /// Spawn the initial units and the dispatcher thread. Returns the sender
    /// the facade submits through.
    pub(crate) fn start(driver: Arc<D>, config: PoolConfig) -> PoolResult<Sender<Message>> {
        let (dispatcher, outbox) = Self::new(driver, config)?;
        // On failure the dispatcher is dropped with the unit handles; the
        // units see their command channels close and exit.
        thread::Builder::new()
            .name("sqlworker-dispatcher".into())
            .spawn(move || dispatcher.run())
            .map_err(|err| PoolError::Spawn(err.to_string()))?;
        Ok(outbox)
    }

    fn new(driver: Arc<D>, config: PoolConfig) -> PoolResult<(Self, Sender<Message>)> {
        let (outbox, inbox) = unbounded();
        let settings = Arc::new(UnitSettings {
            credentials: config.credentials.clone(),
            connections: config.connections.clone(),
            shutdown_drain: config.shutdown_drain,
        });

        let mut slots = Vec::with_capacity(config.workers);
        for slot in 0..config.workers {
            let id = UnitId {
                slot,
                serial: slot as u64,
            };
            let handle = unit::spawn(
                id,
                Arc::clone(&driver),
                Arc::clone(&settings),
                outbox.clone(),
                Duration::ZERO,
                0,
            )
            .map_err(|err| PoolError::Spawn(err.to_string()))?;
            slots.push(handle);
        }
        info!(
            driver = driver.name(),
            workers = config.workers,
            pool_min = config.connections.min,
            pool_max = config.connections.max,
            "starting worker pool"
        );

        let dispatcher = Self {
            driver,
            settings,
            next_serial: config.workers as u64,
            config,
            inbox,
            outbox: outbox.clone(),
            slots,
            idle: VecDeque::new(),
            queue: VecDeque::new(),
            pending: HashMap::new(),
            waiters: None,
            respawn_pending: false,
            completed: 0,
            failed: 0,
            restarts: 0,
        };
        Ok((dispatcher, outbox))
    }

    fn run(mut self) {
        loop {
            let message = if self.respawn_pending {
                // Wake up to retry the failed spawn even if nothing arrives.
                let retry = self.config.restart_backoff.max(MIN_RESPAWN_RETRY);
                match self.inbox.recv_timeout(retry) {
                    Ok(message) => Some(message),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                match self.inbox.recv() {
                    Ok(message) => Some(message),
                    Err(_) => break,
                }
            };
            if let Some(message) = message {
                self.handle(message);
            }
            if self.respawn_pending {
                self.replenish();
            }
            if self.stopped() {
                break;
            }
        }
        self.finish();
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Submit(task) => self.on_submit(task),
            Message::Unit { unit, event } => self.on_unit(unit, event),
            Message::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Message::Shutdown(reply) => self.on_shutdown(reply),
        }
    }

    fn on_submit(&mut self, task: Task) {
        if self.waiters.is_some() {
            task.complete(Err(PoolError::Terminated));
            return;
        }
        let id = task.id;
        self.pending.insert(
            id,
            TaskRecord {
                task,
                state: TaskState::Queued,
            },
        );
        self.queue.push_back(id);
        self.pump();
    }

    fn on_unit(&mut self, unit: UnitId, event: UnitEvent) {
        if self.slots.get(unit.slot).map(|slot| slot.id) != Some(unit) {
            debug!(%unit, ?event, "ignoring event from a replaced unit");
            return;
        }
        match event {
            UnitEvent::Ready => self.on_ready(unit),
            UnitEvent::Finished { task, outcome } => self.on_finished(unit, task, outcome),
            UnitEvent::Exited { cause } => self.on_exited(unit, cause),
        }
    }

    fn on_ready(&mut self, unit: UnitId) {
        let slot = &mut self.slots[unit.slot];
        if slot.state != UnitState::Initializing {
            warn!(%unit, state = ?slot.state, "unexpected ready signal");
            return;
        }
        slot.failures = 0;
        if self.waiters.is_some() {
            // Terminate is already queued behind the init.
            return;
        }
        slot.state = UnitState::Idle;
        self.idle.push_back(unit);
        self.pump();
    }

    fn on_finished(&mut self, unit: UnitId, task: TaskId, outcome: Result<QueryResult, String>) {
        let slot = &mut self.slots[unit.slot];
        if slot.task != Some(task) {
            warn!(%unit, %task, "result for a task the unit was not running");
            return;
        }
        slot.task = None;
        slot.state = UnitState::Idle;
        if self.waiters.is_none() {
            self.idle.push_back(unit);
        }

        if let Some(record) = self.pending.remove(&task) {
            let outcome: Outcome = match outcome {
                Ok(result) => {
                    self.completed += 1;
                    debug!(%unit, %task, rows = result.rows.len(), "task completed");
                    Ok(result)
                }
                Err(message) => {
                    self.failed += 1;
                    debug!(%unit, %task, error = %message, "task failed");
                    Err(PoolError::Query(message))
                }
            };
            record.task.complete(outcome);
        }
        self.pump();
    }

    fn on_exited(&mut self, unit: UnitId, cause: ExitCause) {
        let slot = &mut self.slots[unit.slot];
        // Dying before Ready counts toward the restart backoff.
        if slot.state == UnitState::Initializing && !cause.is_clean() {
            slot.failures += 1;
        }
        slot.state = UnitState::Dead;
        let orphan = slot.task.take();
        self.idle.retain(|id| *id != unit);

        match &cause {
            cause if cause.is_clean() => debug!(%unit, "unit exited"),
            ExitCause::InitFailed(reason) => warn!(%unit, %reason, "unit failed to start"),
            ExitCause::Panicked => warn!(%unit, "unit crashed"),
            _ => warn!(%unit, ?cause, "unit exited unexpectedly"),
        }

        if let Some(task) = orphan {
            self.on_orphaned(task, unit);
        }
        if self.waiters.is_none() {
            self.respawn(unit.slot);
        }
        self.pump();
    }

    /// A unit died holding `task`: requeue it at the front while the retry
    /// budget lasts, otherwise reject it.
    fn on_orphaned(&mut self, task: TaskId, unit: UnitId) {
        let Some(record) = self.pending.get_mut(&task) else {
            return;
        };
        if !matches!(record.state, TaskState::Dispatched(owner) if owner == unit) {
            warn!(%task, %unit, "orphaned task was not dispatched to this unit");
        }
        record.task.attempts += 1;
        let attempts = record.task.attempts;
        if self.waiters.is_none() && attempts <= self.config.task_retries {
            warn!(%task, %unit, attempts, "requeueing task from crashed unit");
            record.state = TaskState::Queued;
            self.queue.push_front(task);
            return;
        }
        if let Some(record) = self.pending.remove(&task) {
            warn!(%task, %unit, attempts, "rejecting task from crashed unit");
            self.failed += 1;
            record.task.complete(Err(PoolError::UnitLost { unit }));
        }
    }

    fn on_shutdown(&mut self, reply: oneshot::Sender<()>) {
        if let Some(waiters) = self.waiters.as_mut() {
            waiters.push(reply);
            return;
        }
        info!(
            queued = self.queue.len(),
            in_flight = self.pending.len() - self.queue.len(),
            "terminating worker pool"
        );
        self.waiters = Some(vec![reply]);
        for task in std::mem::take(&mut self.queue) {
            if let Some(record) = self.pending.remove(&task) {
                record.task.complete(Err(PoolError::Terminated));
            }
        }
        self.idle.clear();
        for slot in &self.slots {
            if slot.state != UnitState::Dead {
                let _ = slot.send(Command::Terminate);
            }
        }
    }

    /// Match queued tasks with idle units, oldest first on both sides.
    fn pump(&mut self) {
        while !self.queue.is_empty() {
            let Some(unit) = self.idle.pop_front() else {
                break;
            };
            let slot = &mut self.slots[unit.slot];
            if slot.id != unit || slot.state != UnitState::Idle {
                continue;
            }
            let Some(task) = self.queue.pop_front() else {
                break;
            };
            let Some(record) = self.pending.get_mut(&task) else {
                self.idle.push_front(unit);
                continue;
            };
            let command = Command::Query {
                task,
                query: Arc::clone(&record.task.query),
            };
            match slot.send(command) {
                Ok(()) => {
                    slot.state = UnitState::Busy;
                    slot.task = Some(task);
                    record.state = TaskState::Dispatched(unit);
                    debug!(%task, %unit, "dispatched");
                }
                Err(_) => {
                    // The unit's thread is gone and its exit event is queued.
                    self.queue.push_front(task);
                }
            }
        }
    }

    fn respawn(&mut self, slot: usize) {
        let failures = self.slots[slot].failures;
        let backoff = self.config.backoff_for(failures);
        let id = UnitId {
            slot,
            serial: self.next_serial,
        };
        self.next_serial += 1;
        match unit::spawn(
            id,
            Arc::clone(&self.driver),
            Arc::clone(&self.settings),
            self.outbox.clone(),
            backoff,
            failures,
        ) {
            Ok(handle) => {
                info!(unit = %id, ?backoff, "spawned replacement unit");
                // Dropping the old handle detaches its thread and closes its
                // command channel; a unit reported dead while still running
                // exits on its next receive.
                self.slots[slot] = handle;
                self.restarts += 1;
            }
            Err(err) => {
                error!(slot, error = %err, "failed to spawn replacement unit");
                self.respawn_pending = true;
            }
        }
    }

    /// Retry replacements whose spawn failed earlier.
    fn replenish(&mut self) {
        self.respawn_pending = false;
        if self.waiters.is_some() {
            return;
        }
        let dead: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state == UnitState::Dead)
            .map(|(idx, _)| idx)
            .collect();
        for slot in dead {
            self.respawn(slot);
        }
    }

    fn stopped(&self) -> bool {
        self.waiters.is_some()
            && self
                .slots
                .iter()
                .all(|slot| slot.state == UnitState::Dead)
    }

    fn finish(mut self) {
        for slot in &mut self.slots {
            slot.join();
        }
        for (_, record) in self.pending.drain() {
            record.task.complete(Err(PoolError::Terminated));
        }
        for waiter in self.waiters.take().unwrap_or_default() {
            let _ = waiter.send(());
        }
        info!(
            completed = self.completed,
            failed = self.failed,
            restarts = self.restarts,
            "worker pool stopped"
        );
    }

    fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            target: self.config.workers,
            queued: self.queue.len(),
            in_flight: self
                .pending
                .values()
                .filter(|record| matches!(record.state, TaskState::Dispatched(_)))
                .count(),
            completed: self.completed,
            failed: self.failed,
            restarts: self.restarts,
            shutting_down: self.waiters.is_some(),
            ..PoolStats::default()
        };
        for slot in &self.slots {
            match slot.state {
                UnitState::Initializing => stats.initializing += 1,
                UnitState::Idle => stats.idle += 1,
                UnitState::Busy => stats.busy += 1,
                UnitState::Dead => {}
            }
            stats.units.push(UnitSnapshot {
                id: slot.id,
                state: slot.state,
            });
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlworker_db::Credentials;
    use sqlworker_db::fake::FakeDriver;

    fn ask_stats(inbox: &Sender<Message>) -> PoolStats {
        let (reply, rx) = oneshot::channel();
        inbox.send(Message::Stats(reply)).expect("stats request");
        rx.blocking_recv().expect("stats reply")
    }

    #[test]
    fn failed_respawn_is_retried_while_idle() {
        let config = PoolConfig::new(Credentials::default())
            .with_workers(1)
            .with_restart_backoff(Duration::from_millis(5), Duration::from_millis(20));
        let (mut dispatcher, inbox) =
            Dispatcher::new(Arc::new(FakeDriver::new()), config).expect("dispatcher");
        match dispatcher.inbox.recv().expect("ready") {
            Message::Unit { unit, event } => dispatcher.on_unit(unit, event),
            _ => panic!("expected the unit's ready event"),
        }
        assert_eq!(dispatcher.slots[0].state, UnitState::Idle);

        // Slot 0 died and its replacement could not be spawned.
        dispatcher.idle.clear();
        dispatcher.slots[0].state = UnitState::Dead;
        dispatcher.respawn_pending = true;
        let runner = thread::spawn(move || dispatcher.run());

        thread::sleep(Duration::from_millis(100));
        let stats = ask_stats(&inbox);
        assert_eq!(stats.restarts, 1);
        assert_eq!(stats.live(), 1);

        let (reply, done) = oneshot::channel();
        inbox.send(Message::Shutdown(reply)).expect("shutdown");
        done.blocking_recv().expect("stopped");
        runner.join().expect("dispatcher thread");
    }
}
