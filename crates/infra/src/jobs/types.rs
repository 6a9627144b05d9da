//! Core job types.

use core::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use tactix_core::{DomainError, JobId, SubjectRef};
use tactix_tasks::TaskPriority;

/// Job kind, used for idempotency keys and re-validation rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Fires at the subject's deadline.
    DeadlineReminder,
    /// Fires a configured lead time before the deadline.
    DueSoonReminder,
    /// Fires every `interval_secs`; schedules its own successor.
    RecurringDigest,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::DeadlineReminder => "deadline_reminder",
            JobKind::DueSoonReminder => "due_soon_reminder",
            JobKind::RecurringDigest => "recurring_digest",
        }
    }

    /// Kinds whose validity depends on the subject's current deadline.
    pub fn tracks_deadline(&self) -> bool {
        matches!(self, JobKind::DeadlineReminder | JobKind::DueSoonReminder)
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deadline_reminder" => Ok(JobKind::DeadlineReminder),
            "due_soon_reminder" => Ok(JobKind::DueSoonReminder),
            "recurring_digest" => Ok(JobKind::RecurringDigest),
            other => Err(DomainError::unknown_variant("job kind", other)),
        }
    }
}

/// Dispatch priority. Higher wins ties between jobs due at the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl Priority {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn from_i64(value: i64) -> Result<Self, DomainError> {
        match value {
            0 => Ok(Priority::Low),
            1 => Ok(Priority::Normal),
            2 => Ok(Priority::High),
            3 => Ok(Priority::Urgent),
            other => Err(DomainError::unknown_variant("priority", other.to_string())),
        }
    }
}

impl From<TaskPriority> for Priority {
    fn from(value: TaskPriority) -> Self {
        match value {
            TaskPriority::Low => Priority::Low,
            TaskPriority::Medium => Priority::Normal,
            TaskPriority::High => Priority::High,
            TaskPriority::Urgent => Priority::Urgent,
        }
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for `due_at`.
    Scheduled,
    /// Claimed by a worker.
    Running,
    /// Delivered.
    Succeeded,
    /// Gave up; kept for inspection.
    Failed,
    /// No longer applicable.
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(JobState::Scheduled),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(DomainError::unknown_variant("job state", other)),
        }
    }
}

/// Deterministic dedup key: `{kind}:{subject}:{bucket}`.
///
/// The bucket is derived from the job's anchor instant, never from its
/// (retry-adjusted) `due_at`, so rescheduling a retry keeps the key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn derive(subject: &SubjectRef, kind: JobKind, anchor_at: DateTime<Utc>, bucket: Duration) -> Self {
        Self(format!(
            "{}:{}:{}",
            kind.as_str(),
            subject,
            bucket_of(anchor_at, bucket)
        ))
    }

    /// Rehydrate a stored key.
    pub fn from_stored(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Index of the dedup bucket `at` falls into.
pub fn bucket_of(at: DateTime<Utc>, bucket: Duration) -> i64 {
    let width = bucket.num_seconds().max(1);
    at.timestamp().div_euclid(width)
}

/// A scheduled unit of deadline/notification work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub subject: SubjectRef,
    pub kind: JobKind,
    pub idempotency_key: IdempotencyKey,
    /// The logical instant the job is about (deadline, digest slot).
    pub anchor_at: DateTime<Utc>,
    /// When the job becomes eligible to run.
    pub due_at: DateTime<Utc>,
    pub priority: Priority,
    pub state: JobState,
    /// Execution attempts so far (incremented on claim).
    pub attempt: u32,
    pub max_attempts: u32,
    /// Recurrence interval, recurring kinds only.
    pub interval_secs: Option<u64>,
    /// Set when a cancel arrived while the job was running.
    pub cancel_requested: bool,
    /// Present only when `state == Failed`.
    pub last_error: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new scheduled job due at `anchor_at`.
    pub fn new(
        subject: SubjectRef,
        kind: JobKind,
        anchor_at: DateTime<Utc>,
        bucket: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            idempotency_key: IdempotencyKey::derive(&subject, kind, anchor_at, bucket),
            subject,
            kind,
            anchor_at,
            due_at: anchor_at,
            priority: Priority::default(),
            state: JobState::Scheduled,
            attempt: 0,
            max_attempts: 5,
            interval_secs: None,
            cancel_requested: false,
            last_error: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Become eligible at `at` instead of at the anchor.
    pub fn due_at(mut self, at: DateTime<Utc>) -> Self {
        self.due_at = at;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn every(mut self, interval_secs: u64) -> Self {
        self.interval_secs = Some(interval_secs);
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Scheduled && self.due_at <= now
    }

    /// Scheduled → Running. Callers check the current state first.
    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Running;
        self.attempt += 1;
        self.claimed_at = Some(now);
        self.updated_at = now;
    }

    /// Apply a worker's outcome to a running job.
    pub fn apply_outcome(&mut self, outcome: JobOutcome, now: DateTime<Utc>) {
        self.claimed_at = None;
        self.updated_at = now;
        match outcome {
            JobOutcome::Delivered => {
                self.state = JobState::Succeeded;
                self.last_error = None;
            }
            JobOutcome::RetryAt { .. } if self.cancel_requested => {
                self.state = JobState::Cancelled;
                self.last_error = None;
            }
            JobOutcome::RetryAt { at, .. } => {
                self.state = JobState::Scheduled;
                self.due_at = at;
                self.last_error = None;
            }
            JobOutcome::Failed { error } => {
                self.state = JobState::Failed;
                self.last_error = Some(error);
            }
            JobOutcome::Stale { .. } => {
                self.state = JobState::Cancelled;
                self.last_error = None;
            }
        }
    }

    /// Running job abandoned by a crashed worker → back to the queue.
    pub fn mark_recovered(&mut self, now: DateTime<Utc>) {
        self.state = if self.cancel_requested {
            JobState::Cancelled
        } else {
            JobState::Scheduled
        };
        self.claimed_at = None;
        self.updated_at = now;
    }

    /// Stop the job. Scheduled jobs are cancelled at once; running jobs finish
    /// their attempt and are not retried. Returns whether anything changed.
    pub fn request_cancel(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Scheduled => {
                self.state = JobState::Cancelled;
                self.updated_at = now;
                true
            }
            JobState::Running if !self.cancel_requested => {
                self.cancel_requested = true;
                self.updated_at = now;
                true
            }
            _ => false,
        }
    }

    /// Claim refused because the attempt budget is spent.
    pub fn mark_exhausted(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Failed;
        self.last_error = Some(format!("attempt limit of {} reached", self.max_attempts));
        self.claimed_at = None;
        self.updated_at = now;
    }

    /// Merge a newer write for the same idempotency key.
    ///
    /// Only scheduled jobs move: the later `due_at` wins and the incoming
    /// priority replaces the stored one. Identity and history stay.
    pub fn merge_from(&mut self, incoming: &Job, now: DateTime<Utc>) -> bool {
        if self.state != JobState::Scheduled {
            return false;
        }
        let due_at = self.due_at.max(incoming.due_at);
        if due_at == self.due_at && incoming.priority == self.priority {
            return false;
        }
        self.due_at = due_at;
        self.priority = incoming.priority;
        self.updated_at = now;
        true
    }
}

/// Result of one execution attempt, as recorded in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Notification delivered.
    Delivered,
    /// Retryable failure; run again at `at`.
    RetryAt { at: DateTime<Utc>, error: String },
    /// Terminal failure.
    Failed { error: String },
    /// Subject no longer warrants this job.
    Stale { reason: String },
}

impl JobOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Delivered => "delivered",
            JobOutcome::RetryAt { .. } => "retry",
            JobOutcome::Failed { .. } => "failed",
            JobOutcome::Stale { .. } => "stale",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap()
    }

    fn reminder(at: DateTime<Utc>) -> Job {
        Job::new(
            SubjectRef::task(1),
            JobKind::DeadlineReminder,
            at,
            Duration::seconds(60),
            t0(),
        )
    }

    #[test]
    fn key_is_stable_within_a_bucket() {
        let a = reminder(t0());
        let b = reminder(t0() + Duration::seconds(59));
        let c = reminder(t0() + Duration::seconds(60));

        assert_eq!(a.idempotency_key, b.idempotency_key);
        assert_ne!(a.idempotency_key, c.idempotency_key);
        assert!(a.idempotency_key.as_str().starts_with("deadline_reminder:task:1:"));
    }

    #[test]
    fn key_differs_per_kind_and_subject() {
        let base = reminder(t0());
        let other_subject = Job::new(
            SubjectRef::task(2),
            JobKind::DeadlineReminder,
            t0(),
            Duration::seconds(60),
            t0(),
        );
        let other_kind = Job::new(
            SubjectRef::task(1),
            JobKind::DueSoonReminder,
            t0(),
            Duration::seconds(60),
            t0(),
        );
        assert_ne!(base.idempotency_key, other_subject.idempotency_key);
        assert_ne!(base.idempotency_key, other_kind.idempotency_key);
    }

    #[test]
    fn retry_keeps_key_and_moves_due_at() {
        let mut job = reminder(t0());
        let key = job.idempotency_key.clone();
        job.mark_running(t0());
        assert_eq!(job.attempt, 1);

        let at = t0() + Duration::seconds(30);
        job.apply_outcome(
            JobOutcome::RetryAt {
                at,
                error: "timeout".into(),
            },
            t0(),
        );
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(job.due_at, at);
        assert_eq!(job.idempotency_key, key);
        assert!(job.last_error.is_none());
    }

    #[test]
    fn failed_keeps_last_error() {
        let mut job = reminder(t0());
        job.mark_running(t0());
        job.apply_outcome(
            JobOutcome::Failed {
                error: "invalid recipient".into(),
            },
            t0(),
        );
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.as_deref(), Some("invalid recipient"));
    }

    #[test]
    fn cancel_while_running_suppresses_retry() {
        let mut job = reminder(t0());
        job.mark_running(t0());
        assert!(job.request_cancel(t0()));
        assert_eq!(job.state, JobState::Running);

        job.apply_outcome(
            JobOutcome::RetryAt {
                at: t0() + Duration::minutes(1),
                error: "timeout".into(),
            },
            t0(),
        );
        assert_eq!(job.state, JobState::Cancelled);
    }

    #[test]
    fn cancel_while_running_still_records_delivery() {
        let mut job = reminder(t0());
        job.mark_running(t0());
        job.request_cancel(t0());
        job.apply_outcome(JobOutcome::Delivered, t0());
        assert_eq!(job.state, JobState::Succeeded);
    }

    #[test]
    fn terminal_jobs_ignore_cancel() {
        let mut job = reminder(t0());
        job.mark_running(t0());
        job.apply_outcome(JobOutcome::Delivered, t0());
        assert!(!job.request_cancel(t0()));
        assert_eq!(job.state, JobState::Succeeded);
    }

    #[test]
    fn merge_takes_later_due_at_and_incoming_priority() {
        let mut stored = reminder(t0());
        let incoming = reminder(t0() + Duration::seconds(10)).with_priority(Priority::Urgent);
        assert!(stored.merge_from(&incoming, t0()));
        assert_eq!(stored.due_at, t0() + Duration::seconds(10));
        assert_eq!(stored.priority, Priority::Urgent);

        let earlier = reminder(t0()).with_priority(Priority::Urgent);
        assert!(!stored.merge_from(&earlier, t0()));
        assert_eq!(stored.due_at, t0() + Duration::seconds(10));
    }

    #[test]
    fn merge_is_rejected_while_running() {
        let mut stored = reminder(t0());
        stored.mark_running(t0());
        let incoming = reminder(t0() + Duration::seconds(10));
        assert!(!stored.merge_from(&incoming, t0()));
        assert_eq!(stored.due_at, t0());
    }

    #[test]
    fn recovery_honours_pending_cancel() {
        let mut job = reminder(t0());
        job.mark_running(t0());
        job.mark_recovered(t0());
        assert_eq!(job.state, JobState::Scheduled);
        assert!(job.claimed_at.is_none());

        job.mark_running(t0());
        job.request_cancel(t0());
        job.mark_recovered(t0());
        assert_eq!(job.state, JobState::Cancelled);
    }

    #[test]
    fn priority_maps_from_task_priority() {
        assert_eq!(Priority::from(TaskPriority::Medium), Priority::Normal);
        assert_eq!(Priority::from(TaskPriority::Urgent), Priority::Urgent);
        assert_eq!(Priority::from_i64(2).unwrap(), Priority::High);
        assert!(Priority::from_i64(9).is_err());
    }

    #[test]
    fn state_and_kind_parse_back() {
        for state in [
            JobState::Scheduled,
            JobState::Running,
            JobState::Succeeded,
            JobState::Failed,
            JobState::Cancelled,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert_eq!(
            "recurring_digest".parse::<JobKind>().unwrap(),
            JobKind::RecurringDigest
        );
    }
}
