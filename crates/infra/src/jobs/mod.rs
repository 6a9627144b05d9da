//! Deadline-aware job scheduling and notification dispatch.
//!
//! ## Design
//!
//! - The job store is the single source of truth; every state transition is
//!   an atomic store operation
//! - One idempotency key per `(subject, kind, anchor bucket)`; upserts merge
//! - The priority scheduler is a rebuildable index over the due window
//! - A bounded pool of workers claims, re-validates and delivers
//! - Failures go through the retry policy, never through inline retries
//!
//! ## Components
//!
//! - `Job`: scheduled unit of work and its lifecycle
//! - `JobStore`: persistence (in-memory or SQLite)
//! - `PriorityScheduler`: decides what runs next and when to wake
//! - `Dispatcher`: runs one attempt of one job
//! - `NotificationEngine`: control loop tying the above together
//! - `RetryPolicy`: backoff decisions

pub mod backoff;
pub mod dispatcher;
pub mod engine;
pub mod scheduler;
pub mod sqlite;
pub mod store;
pub mod types;

pub use backoff::{BackoffStrategy, FailureKind, RetryDecision, RetryPolicy};
pub use dispatcher::{DispatchError, DispatchReport, DispatchStats, Dispatcher, DispatcherConfig};
pub use engine::{EngineError, EngineHandle, EngineParts, NotificationEngine};
pub use scheduler::{PriorityScheduler, SchedulerConfig};
pub use sqlite::SqliteJobStore;
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{IdempotencyKey, Job, JobKind, JobOutcome, JobState, Priority};

/// Convert a config duration for timestamp arithmetic, saturating at a
/// century.
pub(crate) fn chrono_duration(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d)
        .unwrap_or_else(|_| chrono::Duration::days(36_500))
        .min(chrono::Duration::days(36_500))
}
