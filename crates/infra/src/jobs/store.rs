//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use tactix_core::{JobId, SubjectRef};

use super::types::{IdempotencyKey, Job, JobKind, JobOutcome, JobState};

/// Job store abstraction.
///
/// The store is the only shared mutable resource between workers: every
/// state transition goes through one of these operations, and each is atomic
/// with respect to concurrent callers.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job, or merge it into the existing job with the same
    /// idempotency key. Returns the canonical stored job.
    ///
    /// A cancelled job under the same key is replaced by the incoming one;
    /// succeeded and failed jobs are returned unchanged.
    async fn upsert(&self, job: Job) -> Result<Job, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Claim a scheduled, due job: Scheduled → Running, `attempt += 1`.
    async fn mark_running(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError>;

    /// Record the outcome of the attempt taken by claim number `claim_attempt`.
    async fn record_outcome(
        &self,
        id: JobId,
        claim_attempt: u32,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// Cancel non-terminal jobs for a subject, optionally of one kind.
    /// Running jobs are flagged and finish their current attempt.
    async fn cancel(
        &self,
        subject: &SubjectRef,
        kind: Option<JobKind>,
        now: DateTime<Utc>,
    ) -> Result<usize, JobStoreError>;

    /// Cancel jobs for `(subject, kind)` other than the one keyed `keep`.
    async fn cancel_superseded(
        &self,
        subject: &SubjectRef,
        kind: JobKind,
        keep: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<usize, JobStoreError>;

    /// Scheduled jobs with `due_at <= before`, by priority desc then due_at asc.
    async fn list_due_before(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Return jobs claimed at or before `older_than` to the queue.
    async fn recover_stuck_running(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, JobStoreError>;

    /// All jobs for a subject, oldest first.
    async fn list_for_subject(&self, subject: &SubjectRef) -> Result<Vec<Job>, JobStoreError>;

    /// Get job statistics.
    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already running: {0}")]
    AlreadyRunning(JobId),
    #[error("job {id} cannot be claimed in state {state}")]
    NotClaimable { id: JobId, state: JobState },
    #[error("job {id} is not due until {due_at}")]
    NotDue { id: JobId, due_at: DateTime<Utc> },
    #[error("job {0} has used all of its attempts")]
    AttemptsExhausted(JobId),
    #[error("claim {attempt} of job {id} is no longer current")]
    StaleClaim { id: JobId, attempt: u32 },
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    /// Benign races that the caller resolves by simply moving on.
    pub fn is_claim_conflict(&self) -> bool {
        matches!(
            self,
            JobStoreError::AlreadyRunning(_)
                | JobStoreError::NotClaimable { .. }
                | JobStoreError::NotDue { .. }
                | JobStoreError::StaleClaim { .. }
        )
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub scheduled: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobStats {
    pub(crate) fn count(&mut self, state: JobState, n: usize) {
        match state {
            JobState::Scheduled => self.scheduled += n,
            JobState::Running => self.running += n,
            JobState::Succeeded => self.succeeded += n,
            JobState::Failed => self.failed += n,
            JobState::Cancelled => self.cancelled += n,
        }
    }

    pub fn total(&self) -> usize {
        self.scheduled + self.running + self.succeeded + self.failed + self.cancelled
    }
}

/// Claim checks shared by the store implementations.
pub(crate) fn check_claimable(job: &Job, now: DateTime<Utc>) -> Result<(), JobStoreError> {
    match job.state {
        JobState::Scheduled => {}
        JobState::Running => return Err(JobStoreError::AlreadyRunning(job.id)),
        state => return Err(JobStoreError::NotClaimable { id: job.id, state }),
    }
    if job.due_at > now {
        return Err(JobStoreError::NotDue {
            id: job.id,
            due_at: job.due_at,
        });
    }
    if job.attempt >= job.max_attempts {
        return Err(JobStoreError::AttemptsExhausted(job.id));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    keys: HashMap<IdempotencyKey, JobId>,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_where(&self, now: DateTime<Utc>, matches: impl Fn(&Job) -> bool) -> usize {
        let mut inner = self.write();
        inner
            .jobs
            .values_mut()
            .filter(|job| matches(job))
            .map(|job| job.request_cancel(now))
            .filter(|changed| *changed)
            .count()
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    #[instrument(level = "debug", skip(self, job), fields(key = %job.idempotency_key))]
    async fn upsert(&self, job: Job) -> Result<Job, JobStoreError> {
        let mut inner = self.write();

        if let Some(id) = inner.keys.get(&job.idempotency_key).copied() {
            let stored = inner
                .jobs
                .get_mut(&id)
                .ok_or_else(|| JobStoreError::Storage(format!("key index points at missing job {id}")))?;
            if stored.state != JobState::Cancelled {
                if stored.merge_from(&job, job.updated_at) {
                    debug!(job_id = %id, due_at = %stored.due_at, "merged into existing job");
                }
                return Ok(stored.clone());
            }
            // The event is wanted again: a cancelled row gives way to a fresh job.
            inner.jobs.remove(&id);
            debug!(replaced = %id, job_id = %job.id, "replaced cancelled job");
        }

        inner.keys.insert(job.idempotency_key.clone(), job.id);
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read().jobs.get(&id).cloned())
    }

    #[instrument(level = "debug", skip(self))]
    async fn mark_running(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let mut inner = self.write();
        let job = inner.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;

        match check_claimable(job, now) {
            Ok(()) => {
                job.mark_running(now);
                Ok(job.clone())
            }
            Err(JobStoreError::AttemptsExhausted(id)) => {
                job.mark_exhausted(now);
                Err(JobStoreError::AttemptsExhausted(id))
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(level = "debug", skip(self, outcome), fields(outcome = outcome.label()))]
    async fn record_outcome(
        &self,
        id: JobId,
        claim_attempt: u32,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let mut inner = self.write();
        let job = inner.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;

        if job.state != JobState::Running || job.attempt != claim_attempt {
            return Err(JobStoreError::StaleClaim {
                id,
                attempt: claim_attempt,
            });
        }

        job.apply_outcome(outcome, now);
        Ok(job.clone())
    }

    async fn cancel(
        &self,
        subject: &SubjectRef,
        kind: Option<JobKind>,
        now: DateTime<Utc>,
    ) -> Result<usize, JobStoreError> {
        Ok(self.cancel_where(now, |job| {
            &job.subject == subject && kind.is_none_or(|k| job.kind == k)
        }))
    }

    async fn cancel_superseded(
        &self,
        subject: &SubjectRef,
        kind: JobKind,
        keep: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<usize, JobStoreError> {
        Ok(self.cancel_where(now, |job| {
            &job.subject == subject && job.kind == kind && &job.idempotency_key != keep
        }))
    }

    async fn list_due_before(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.read();
        let mut due: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| j.state == JobState::Scheduled && j.due_at <= before)
            .cloned()
            .collect();

        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.due_at.cmp(&b.due_at))
                .then(a.id.cmp(&b.id))
        });
        due.truncate(limit);
        Ok(due)
    }

    #[instrument(level = "debug", skip(self))]
    async fn recover_stuck_running(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, JobStoreError> {
        let mut inner = self.write();
        let mut recovered = 0;
        for job in inner.jobs.values_mut() {
            let stuck = job.state == JobState::Running
                && job.claimed_at.is_some_and(|at| at <= older_than);
            if stuck {
                job.mark_recovered(now);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn list_for_subject(&self, subject: &SubjectRef) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.read();
        let mut jobs: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| &j.subject == subject)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let inner = self.read();
        let mut stats = JobStats::default();
        for job in inner.jobs.values() {
            stats.count(job.state, 1);
        }
        Ok(stats)
    }
}

#[async_trait::async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn upsert(&self, job: Job) -> Result<Job, JobStoreError> {
        (**self).upsert(job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(id).await
    }

    async fn mark_running(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        (**self).mark_running(id, now).await
    }

    async fn record_outcome(
        &self,
        id: JobId,
        claim_attempt: u32,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        (**self).record_outcome(id, claim_attempt, outcome, now).await
    }

    async fn cancel(
        &self,
        subject: &SubjectRef,
        kind: Option<JobKind>,
        now: DateTime<Utc>,
    ) -> Result<usize, JobStoreError> {
        (**self).cancel(subject, kind, now).await
    }

    async fn cancel_superseded(
        &self,
        subject: &SubjectRef,
        kind: JobKind,
        keep: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<usize, JobStoreError> {
        (**self).cancel_superseded(subject, kind, keep, now).await
    }

    async fn list_due_before(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_due_before(before, limit).await
    }

    async fn recover_stuck_running(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, JobStoreError> {
        (**self).recover_stuck_running(older_than, now).await
    }

    async fn list_for_subject(&self, subject: &SubjectRef) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_for_subject(subject).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }
}
