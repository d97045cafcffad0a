//! Pool configuration, built in code or read from the environment.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use sqlworker_db::{Credentials, PoolOptions};

use crate::error::{PoolError, PoolResult};

#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Number of execution units the pool keeps alive.
    pub workers: usize,
    pub credentials: Credentials,
    /// Sizing of the private connection pool inside each unit.
    pub connections: PoolOptions,
    /// Times a task orphaned by a crashed unit is requeued before it is
    /// rejected with [`PoolError::UnitLost`].
    pub task_retries: u32,
    /// Delay before restarting a unit after its first failed init; doubles on
    /// each consecutive failure.
    pub restart_backoff: Duration,
    pub max_restart_backoff: Duration,
    /// How long a terminating unit waits for checked-out connections.
    pub shutdown_drain: Duration,
}

impl PoolConfig {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            workers: default_workers(),
            credentials,
            connections: PoolOptions::default(),
            task_retries: 0,
            restart_backoff: Duration::from_millis(100),
            max_restart_backoff: Duration::from_secs(5),
            shutdown_drain: Duration::from_secs(10),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_connections(mut self, connections: PoolOptions) -> Self {
        self.connections = connections;
        self
    }

    pub fn with_task_retries(mut self, retries: u32) -> Self {
        self.task_retries = retries;
        self
    }

    pub fn with_restart_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.restart_backoff = initial;
        self.max_restart_backoff = max;
        self
    }

    /// Read the `DB_*` variables from the process environment.
    pub fn from_env() -> PoolResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> PoolResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).unwrap_or_default();
        let credentials = Credentials::new(
            text("DB_USER").trim(),
            text("DB_PASSWORD").trim(),
            text("DB_HOST").trim(),
        );
        let mut config = Self::new(credentials);
        let defaults = PoolOptions::default();

        config.workers = parse(&lookup, "DB_WORKERS")?.unwrap_or(config.workers);
        config.connections = PoolOptions {
            min: parse(&lookup, "DB_POOL_MIN")?.unwrap_or(defaults.min),
            max: parse(&lookup, "DB_POOL_MAX")?.unwrap_or(defaults.max),
            increment: parse(&lookup, "DB_POOL_INCREMENT")?.unwrap_or(defaults.increment),
            idle_timeout: parse(&lookup, "DB_POOL_TIMEOUT")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            acquire_timeout: parse(&lookup, "DB_POOL_ACQUIRE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.acquire_timeout),
            ping_after: defaults.ping_after,
        };
        config.task_retries = parse(&lookup, "DB_TASK_RETRIES")?.unwrap_or(0);
        if let Some(secs) = parse(&lookup, "DB_SHUTDOWN_DRAIN_SECS")? {
            config.shutdown_drain = Duration::from_secs(secs);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PoolResult<()> {
        if self.workers == 0 {
            return Err(PoolError::Config("workers must be at least 1".into()));
        }
        self.connections
            .validate()
            .map_err(|err| PoolError::Config(err.to_string()))?;
        if self.restart_backoff > self.max_restart_backoff {
            return Err(PoolError::Config(
                "restart backoff exceeds its maximum".into(),
            ));
        }
        Ok(())
    }

    /// Backoff before the `failures`-th consecutive restart of a unit.
    pub(crate) fn backoff_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.restart_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_restart_backoff)
            .min(self.max_restart_backoff)
    }
}

/// One unit per core, leaving a core for the caller's own thread.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

fn parse<T, F>(lookup: &F, key: &str) -> PoolResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|err| PoolError::Config(format!("{key}={raw:?}: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = PoolConfig::from_lookup(lookup(&[
            ("DB_USER", "billing"),
            ("DB_PASSWORD", "  s3cret\n"),
            ("DB_HOST", "db.internal:1521/FACT"),
            ("DB_WORKERS", "4"),
            ("DB_POOL_MAX", "10"),
            ("DB_POOL_TIMEOUT", "30"),
            ("DB_TASK_RETRIES", "2"),
        ]))
        .expect("config");
        assert_eq!(config.workers, 4);
        assert_eq!(config.credentials.password, "s3cret");
        assert_eq!(config.credentials.connect_string, "db.internal:1521/FACT");
        assert_eq!(config.connections.min, 1);
        assert_eq!(config.connections.max, 10);
        assert_eq!(config.connections.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.task_retries, 2);
    }

    #[test]
    fn missing_variables_fall_back_to_defaults() {
        let config = PoolConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config.workers, default_workers());
        assert_eq!(config.connections, PoolOptions::default());
        assert_eq!(config.shutdown_drain, Duration::from_secs(10));
    }

    #[test]
    fn malformed_numbers_name_the_variable() {
        let err = PoolConfig::from_lookup(lookup(&[("DB_WORKERS", "many")])).unwrap_err();
        match err {
            PoolError::Config(message) => assert!(message.contains("DB_WORKERS"), "{message}"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = PoolConfig::from_lookup(lookup(&[("DB_WORKERS", "0")])).unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let config = PoolConfig::new(Credentials::default())
            .with_restart_backoff(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(config.backoff_for(0), Duration::ZERO);
        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(350));
        assert_eq!(config.backoff_for(40), Duration::from_millis(350));
    }
}
