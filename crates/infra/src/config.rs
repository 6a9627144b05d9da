//! Configuration loading and representation.
//!
//! Everything is read from `TACTIX_*` environment variables, after loading a
//! `.env` file if one is present. Unset variables fall back to defaults.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::jobs::{DispatcherConfig, RetryPolicy, SchedulerConfig};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0}")]
    Constraint(String),
}

/// Engine tuning.
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    /// Concurrent dispatch workers.
    pub pool_size: usize,
    /// Hard limit on one notifier call.
    pub send_timeout: Duration,
    /// Look-ahead of the in-memory scheduler index.
    pub due_window: Duration,
    /// Maximum time between two index refills.
    pub refresh_interval: Duration,
    /// Maximum jobs read per refill.
    pub batch_limit: usize,
    /// Claims older than this are considered abandoned.
    pub stale_after: Duration,
    /// How often the control loop runs crash recovery.
    pub recovery_interval: Duration,
    /// Width of the idempotency bucket.
    pub dedup_bucket: Duration,
    /// Lead time for due-soon reminders; none are created when unset.
    pub due_soon_lead: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            send_timeout: Duration::from_secs(10),
            due_window: Duration::from_secs(5 * 60),
            refresh_interval: Duration::from_secs(30),
            batch_limit: 256,
            stale_after: Duration::from_secs(5 * 60),
            recovery_interval: Duration::from_secs(60),
            dedup_bucket: Duration::from_secs(60),
            due_soon_lead: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_due_soon_lead(mut self, lead: Duration) -> Self {
        self.due_soon_lead = Some(lead);
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            due_window: self.due_window,
            refresh_interval: self.refresh_interval,
            batch_limit: self.batch_limit,
        }
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            send_timeout: self.send_timeout,
            dedup_bucket: self.dedup_bucket,
            retry: self.retry.clone(),
        }
    }

    /// Read overrides through `lookup` (normally the process environment).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parse(&lookup, "TACTIX_POOL_SIZE")? {
            config.pool_size = v;
        }
        if let Some(v) = parse(&lookup, "TACTIX_SEND_TIMEOUT_SECS")? {
            config.send_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse(&lookup, "TACTIX_DUE_WINDOW_SECS")? {
            config.due_window = Duration::from_secs(v);
        }
        if let Some(v) = parse(&lookup, "TACTIX_REFRESH_INTERVAL_SECS")? {
            config.refresh_interval = Duration::from_secs(v);
        }
        if let Some(v) = parse(&lookup, "TACTIX_BATCH_LIMIT")? {
            config.batch_limit = v;
        }
        if let Some(v) = parse(&lookup, "TACTIX_STALE_AFTER_SECS")? {
            config.stale_after = Duration::from_secs(v);
        }
        if let Some(v) = parse(&lookup, "TACTIX_RECOVERY_INTERVAL_SECS")? {
            config.recovery_interval = Duration::from_secs(v);
        }
        if let Some(v) = parse(&lookup, "TACTIX_DEDUP_BUCKET_SECS")? {
            config.dedup_bucket = Duration::from_secs(v);
        }
        if let Some(v) = parse::<u64>(&lookup, "TACTIX_DUE_SOON_LEAD_SECS")? {
            config.due_soon_lead = (v > 0).then(|| Duration::from_secs(v));
        }
        if let Some(v) = parse(&lookup, "TACTIX_MAX_ATTEMPTS")? {
            config.retry.max_attempts = v;
        }
        if let Some(v) = parse(&lookup, "TACTIX_RETRY_BASE_MS")? {
            config.retry.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse(&lookup, "TACTIX_RETRY_MAX_MS")? {
            config.retry.max_delay = Duration::from_millis(v);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::Constraint("pool size must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Constraint("max attempts must be at least 1".into()));
        }
        if self.dedup_bucket.as_secs() == 0 {
            return Err(ConfigError::Constraint(
                "dedup bucket must be at least one second".into(),
            ));
        }
        if self.batch_limit == 0 {
            return Err(ConfigError::Constraint("batch limit must be at least 1".into()));
        }
        if self.refresh_interval.is_zero() {
            return Err(ConfigError::Constraint("refresh interval must be positive".into()));
        }
        if self.send_timeout.is_zero() {
            return Err(ConfigError::Constraint("send timeout must be positive".into()));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(ConfigError::Constraint(
                "retry cap must not be below the base delay".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::Constraint("jitter must be in [0, 1)".into()));
        }
        Ok(())
    }
}

/// Settings for the standalone worker process.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerConfig {
    pub engine: EngineConfig,
    /// Durable job store.
    pub jobs_database_url: String,
    /// The CRUD service's database, read for re-validation.
    #[serde(skip)]
    pub tasks_database_url: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            jobs_database_url: "sqlite://tactix-jobs.db".to_string(),
            tasks_database_url: None,
        }
    }
}

impl WorkerConfig {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let engine = EngineConfig::from_lookup(&lookup)?;
        let defaults = Self::default();
        Ok(Self {
            engine,
            jobs_database_url: non_empty(&lookup, "TACTIX_JOBS_DATABASE_URL")
                .unwrap_or(defaults.jobs_database_url),
            tasks_database_url: non_empty(&lookup, "TACTIX_TASKS_DATABASE_URL"),
        })
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = non_empty(lookup, key) else {
        return Ok(None);
    };
    raw.parse().map(Some).map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: raw.clone(),
        reason: e.to_string(),
    })
}
