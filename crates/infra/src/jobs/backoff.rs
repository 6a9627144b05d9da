//! Retry/backoff decisions.
//!
//! Everything here is a pure function of its inputs: the dispatcher passes in
//! the current instant and a per-job seed, so the same failure always yields
//! the same `RetryAt`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use tactix_core::JobId;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// How an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The send did not finish within the per-attempt timeout.
    Timeout,
    /// Provider error worth retrying (5xx-equivalent, lookup failure).
    Transient,
    /// Invalid recipient or permanent rejection. Never retried.
    Permanent,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::Permanent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAt(DateTime<Utc>),
    GiveUp,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor in [0, 1): delays grow by up to this fraction
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60 * 60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays and no jitter.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.2,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Un-jittered delay for a given attempt number (1-indexed).
    fn step(&self, attempt: u32) -> f64 {
        let base_ms = self.base_delay.as_millis() as f64;
        match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                // 2^62 ms is far past any sane cap.
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                base_ms * exp
            }
            BackoffStrategy::Linear => base_ms * attempt as f64,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    ///
    /// The jitter draw is seeded, so one `(attempt, seed)` pair always maps
    /// to the same delay. Delays never decrease from one attempt to the next,
    /// whatever the strategy.
    pub fn delay_for_attempt(&self, attempt: u32, seed: u64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let max_ms = self.max_delay.as_millis() as f64;
        let mut delay_ms = self.step(attempt);

        let jitter = self.jitter.clamp(0.0, 0.999);
        if jitter > 0.0 {
            let mut rng = StdRng::seed_from_u64(seed ^ u64::from(attempt));
            delay_ms *= 1.0 + rng.gen_range(0.0..jitter);
            // Never below the previous attempt's largest possible delay.
            if attempt > 1 {
                delay_ms = delay_ms.max(self.step(attempt - 1) * (1.0 + jitter));
            }
        }

        Duration::from_millis(delay_ms.min(max_ms).max(0.0) as u64)
    }

    /// Check if more attempts are allowed after `attempt` ones.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Decide what happens after attempt number `attempt` failed with `failure`.
    pub fn decide(
        &self,
        attempt: u32,
        failure: FailureKind,
        now: DateTime<Utc>,
        seed: u64,
    ) -> RetryDecision {
        if !failure.is_retryable() || !self.should_retry(attempt) {
            return RetryDecision::GiveUp;
        }
        let delay = self.delay_for_attempt(attempt, seed);
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        match now.checked_add_signed(delay) {
            Some(at) => RetryDecision::RetryAt(at),
            None => RetryDecision::GiveUp,
        }
    }
}

/// Seed for a job's jitter draws.
pub fn jitter_seed(id: &JobId) -> u64 {
    let raw = id.as_uuid().as_u128();
    (raw as u64) ^ ((raw >> 64) as u64)
}
