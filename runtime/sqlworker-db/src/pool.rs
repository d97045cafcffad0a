//! Bounded connection pool owned by a single execution unit.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::{Connection, Credentials, DbError, Driver};

/// Sizing and timing for a [`ConnectionPool`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolOptions {
    /// Connections opened eagerly by [`ConnectionPool::create`] and never
    /// pruned for idleness.
    pub min: usize,
    pub max: usize,
    /// Connections opened at once when the pool has to grow.
    pub increment: usize,
    /// Surplus idle connections (above `min`) are closed after this long.
    pub idle_timeout: Duration,
    /// How long `acquire` waits for a connection before giving up.
    pub acquire_timeout: Duration,
    /// Idle connections older than this are pinged before being handed out.
    pub ping_after: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min: 1,
            max: 3,
            increment: 1,
            idle_timeout: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(60),
            ping_after: Duration::from_secs(30),
        }
    }
}

impl PoolOptions {
    pub fn validate(&self) -> Result<(), DbError> {
        if self.max == 0 {
            return Err(DbError::InvalidOptions("max must be at least 1".into()));
        }
        if self.min > self.max {
            return Err(DbError::InvalidOptions(format!(
                "min ({}) exceeds max ({})",
                self.min, self.max
            )));
        }
        if self.increment == 0 {
            return Err(DbError::InvalidOptions(
                "increment must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

struct IdleConn<C> {
    conn: C,
    since: Instant,
}

struct PoolState<C> {
    /// Most recently returned connection last.
    idle: Vec<IdleConn<C>>,
    /// Idle plus checked out plus reserved for an in-progress connect.
    open: usize,
    closed: bool,
}

/// A bounded pool of driver connections.
pub struct ConnectionPool<D: Driver> {
    driver: Arc<D>,
    credentials: Credentials,
    options: PoolOptions,
    state: Mutex<PoolState<D::Connection>>,
    available: Condvar,
}

/// A checked-out connection that returns to its pool on drop.
pub struct Pooled<D: Driver> {
    pool: Arc<ConnectionPool<D>>,
    conn: Option<D::Connection>,
}

impl<D: Driver> ConnectionPool<D> {
    /// Validate the configuration and open `options.min` connections.
    ///
    /// Any failure here is returned to the caller; nothing is retried.
    pub fn create(
        driver: Arc<D>,
        credentials: Credentials,
        options: PoolOptions,
    ) -> Result<Arc<Self>, DbError> {
        options.validate()?;
        driver.check_credentials(&credentials)?;
        let mut idle = Vec::with_capacity(options.max);
        for _ in 0..options.min {
            let conn = driver.connect(&credentials)?;
            idle.push(IdleConn {
                conn,
                since: Instant::now(),
            });
        }
        debug!(
            driver = driver.name(),
            min = options.min,
            max = options.max,
            increment = options.increment,
            "connection pool created"
        );
        Ok(Arc::new(Self {
            driver,
            credentials,
            options,
            state: Mutex::new(PoolState {
                open: idle.len(),
                idle,
                closed: false,
            }),
            available: Condvar::new(),
        }))
    }

    /// Check out a connection, growing the pool by `increment` when no idle
    /// connection is available and `max` has not been reached.
    pub fn acquire(self: &Arc<Self>) -> Result<Pooled<D>, DbError> {
        let deadline = Instant::now() + self.options.acquire_timeout;
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(DbError::PoolClosed);
            }
            self.prune_idle(&mut state);

            if let Some(idle) = state.idle.pop() {
                drop(state);
                let mut conn = idle.conn;
                if idle.since.elapsed() >= self.options.ping_after {
                    if let Err(err) = conn.ping() {
                        warn!(driver = self.driver.name(), error = %err, "dropping stale connection");
                        drop(conn);
                        state = self.lock();
                        state.open -= 1;
                        continue;
                    }
                }
                return Ok(self.checkout(conn));
            }

            if state.open < self.options.max {
                let batch = self.options.increment.min(self.options.max - state.open);
                state.open += batch;
                drop(state);
                return self.grow(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(DbError::AcquireTimeout(self.options.acquire_timeout));
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Stop handing out connections and close them, waiting up to `drain`
    /// for checked-out connections to come back. Returns how many were still
    /// checked out when the wait ended.
    pub fn close(&self, drain: Duration) -> usize {
        let deadline = Instant::now() + drain;
        let mut state = self.lock();
        state.closed = true;
        let idle = std::mem::take(&mut state.idle);
        state.open -= idle.len();
        drop(idle);
        self.available.notify_all();
        while state.open > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        let outstanding = state.open;
        debug!(driver = self.driver.name(), outstanding, "connection pool closed");
        outstanding
    }

    pub fn open_count(&self) -> usize {
        self.lock().open
    }

    pub fn idle_count(&self) -> usize {
        self.lock().idle.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<D::Connection>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn checkout(self: &Arc<Self>, conn: D::Connection) -> Pooled<D> {
        Pooled {
            pool: Arc::clone(self),
            conn: Some(conn),
        }
    }

    /// Open `batch` reserved connections, hand out the first and park the
    /// rest as idle. Reservations that fail to connect are released.
    fn grow(self: &Arc<Self>, batch: usize) -> Result<Pooled<D>, DbError> {
        let first = match self.driver.connect(&self.credentials) {
            Ok(conn) => conn,
            Err(err) => {
                self.forget(batch);
                return Err(err);
            }
        };
        for _ in 1..batch {
            match self.driver.connect(&self.credentials) {
                Ok(conn) => self.release(conn),
                Err(err) => {
                    warn!(driver = self.driver.name(), error = %err, "extra connection failed to open");
                    self.forget(1);
                }
            }
        }
        Ok(self.checkout(first))
    }

    /// Close idle connections that have outlived `idle_timeout`, oldest
    /// first, without dropping below `min`.
    fn prune_idle(&self, state: &mut PoolState<D::Connection>) {
        let timeout = self.options.idle_timeout;
        while state.open > self.options.min
            && state
                .idle
                .first()
                .is_some_and(|idle| idle.since.elapsed() >= timeout)
        {
            state.idle.remove(0);
            state.open -= 1;
        }
    }

    fn release(&self, conn: D::Connection) {
        let mut state = self.lock();
        if state.closed {
            state.open -= 1;
        } else {
            state.idle.push(IdleConn {
                conn,
                since: Instant::now(),
            });
        }
        self.available.notify_all();
    }

    fn forget(&self, count: usize) {
        let mut state = self.lock();
        state.open -= count;
        self.available.notify_all();
    }
}

impl<D: Driver> Pooled<D> {
    /// Close this connection instead of returning it, freeing its slot.
    pub fn discard(mut self) {
        if self.conn.take().is_some() {
            self.pool.forget(1);
        }
    }
}

impl<D: Driver> Deref for Pooled<D> {
    type Target = D::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("Pooled connection missing (already released)")
    }
}

impl<D: Driver> DerefMut for Pooled<D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .expect("Pooled connection missing (already released)")
    }
}

impl<D: Driver> Drop for Pooled<D> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Connection, Params, QueryResult};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingDriver {
        connects: AtomicUsize,
        fail_after: Option<usize>,
        dead_on_ping: bool,
    }

    struct CountingConn {
        dead_on_ping: bool,
    }

    impl Connection for CountingConn {
        fn execute(&mut self, _sql: &str, _params: &Params) -> Result<QueryResult, DbError> {
            Ok(QueryResult::default())
        }

        fn ping(&mut self) -> Result<(), DbError> {
            if self.dead_on_ping {
                return Err(DbError::ConnectionLost("server went away".into()));
            }
            Ok(())
        }
    }

    impl Driver for CountingDriver {
        type Connection = CountingConn;

        fn name(&self) -> &'static str {
            "counting"
        }

        fn check_credentials(&self, _credentials: &Credentials) -> Result<(), DbError> {
            Ok(())
        }

        fn connect(&self, _credentials: &Credentials) -> Result<CountingConn, DbError> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            match self.fail_after {
                Some(limit) if n >= limit => Err(DbError::Connect("refused".into())),
                _ => Ok(CountingConn {
                    dead_on_ping: self.dead_on_ping,
                }),
            }
        }
    }

    fn options(min: usize, max: usize) -> PoolOptions {
        PoolOptions {
            min,
            max,
            acquire_timeout: Duration::from_millis(10),
            ..PoolOptions::default()
        }
    }

    fn pool(min: usize, max: usize) -> Arc<ConnectionPool<CountingDriver>> {
        ConnectionPool::create(
            Arc::new(CountingDriver::default()),
            Credentials::default(),
            options(min, max),
        )
        .expect("pool")
    }

    #[test]
    fn pool_reuses_connections() {
        let pool = pool(0, 2);
        let first = pool.acquire().expect("first");
        let second = pool.acquire().expect("second");
        assert_eq!(pool.open_count(), 2);
        drop(first);
        assert_eq!(pool.idle_count(), 1);
        drop(second);
        assert_eq!(pool.idle_count(), 2);
        let _again = pool.acquire().expect("again");
        assert_eq!(pool.driver.connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn create_opens_min_connections_eagerly() {
        let pool = pool(2, 3);
        assert_eq!(pool.open_count(), 2);
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn pool_timeout() {
        let pool = pool(1, 1);
        let _guard = pool.acquire().expect("guard");
        let result = pool.acquire();
        assert!(matches!(result, Err(DbError::AcquireTimeout(_))));
    }

    #[test]
    fn growth_opens_increment_connections_at_once() {
        let pool = ConnectionPool::create(
            Arc::new(CountingDriver::default()),
            Credentials::default(),
            PoolOptions {
                increment: 2,
                ..options(0, 3)
            },
        )
        .expect("pool");
        let _first = pool.acquire().expect("first");
        assert_eq!(pool.open_count(), 2);
        assert_eq!(pool.idle_count(), 1);
        let _second = pool.acquire().expect("second");
        let _third = pool.acquire().expect("third");
        assert_eq!(pool.open_count(), 3);
    }

    #[test]
    fn pool_discard_allows_recreate() {
        let pool = pool(0, 1);
        let guard = pool.acquire().expect("guard");
        guard.discard();
        assert_eq!(pool.open_count(), 0);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn failed_connect_releases_reservation() {
        let driver = CountingDriver {
            fail_after: Some(0),
            ..CountingDriver::default()
        };
        let pool = ConnectionPool::create(Arc::new(driver), Credentials::default(), options(0, 1))
            .expect("pool");
        assert!(matches!(pool.acquire(), Err(DbError::Connect(_))));
        assert_eq!(pool.open_count(), 0);
    }

    #[test]
    fn create_fails_when_min_cannot_connect() {
        let driver = CountingDriver {
            fail_after: Some(1),
            ..CountingDriver::default()
        };
        let result = ConnectionPool::create(Arc::new(driver), Credentials::default(), options(2, 2));
        assert!(matches!(result, Err(DbError::Connect(_))));
    }

    #[test]
    fn invalid_options_are_rejected() {
        let result = ConnectionPool::create(
            Arc::new(CountingDriver::default()),
            Credentials::default(),
            options(4, 2),
        );
        assert!(matches!(result, Err(DbError::InvalidOptions(_))));
    }

    #[test]
    fn idle_connections_above_min_are_pruned() {
        let pool = ConnectionPool::create(
            Arc::new(CountingDriver::default()),
            Credentials::default(),
            PoolOptions {
                idle_timeout: Duration::ZERO,
                ..options(1, 3)
            },
        )
        .expect("pool");
        let a = pool.acquire().expect("a");
        let b = pool.acquire().expect("b");
        drop(a);
        drop(b);
        assert_eq!(pool.open_count(), 2);
        let _c = pool.acquire().expect("c");
        assert_eq!(pool.open_count(), 1);
    }

    #[test]
    fn close_rejects_new_acquires() {
        let pool = pool(1, 2);
        let outstanding = pool.close(Duration::from_millis(5));
        assert_eq!(outstanding, 0);
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire(), Err(DbError::PoolClosed)));
    }

    #[test]
    fn close_reports_connections_still_checked_out() {
        let pool = pool(0, 1);
        let guard = pool.acquire().expect("guard");
        assert_eq!(pool.close(Duration::from_millis(5)), 1);
        drop(guard);
        assert_eq!(pool.open_count(), 0);
    }

    #[test]
    fn stale_idle_connection_failing_ping_is_replaced() {
        let driver = CountingDriver {
            dead_on_ping: true,
            ..CountingDriver::default()
        };
        let pool = ConnectionPool::create(
            Arc::new(driver),
            Credentials::default(),
            PoolOptions {
                ping_after: Duration::ZERO,
                ..options(1, 1)
            },
        )
        .expect("pool");
        let guard = pool.acquire().expect("fresh connection");
        assert_eq!(pool.driver.connects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.open_count(), 1);
        drop(guard);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn healthy_idle_connection_survives_ping() {
        let pool = ConnectionPool::create(
            Arc::new(CountingDriver::default()),
            Credentials::default(),
            PoolOptions {
                ping_after: Duration::ZERO,
                ..options(1, 1)
            },
        )
        .expect("pool");
        let _guard = pool.acquire().expect("pinged connection");
        assert_eq!(pool.driver.connects.load(Ordering::SeqCst), 1);
    }
}
