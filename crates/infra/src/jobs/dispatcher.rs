//! Single-job dispatch: claim, re-validate, render, send, record.
//!
//! The dispatcher never retries inline. Whatever happens during an attempt
//! ends up as a [`JobOutcome`] written through `JobStore::record_outcome`, so
//! the job returns to the scheduler either rescheduled or terminal.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use tactix_core::{Clock, JobId};
use tactix_tasks::SubjectState;

use crate::directory::SubjectDirectory;
use crate::notify::{DeliveryResult, Notifier, Renderer};

use super::backoff::{FailureKind, RetryDecision, RetryPolicy, jitter_seed};
use super::chrono_duration;
use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobKind, JobOutcome, JobState, bucket_of};

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Hard limit on each external call of an attempt: the subject lookup
    /// and the `Notifier::send`.
    pub send_timeout: Duration,
    /// Width of the idempotency bucket.
    pub dedup_bucket: Duration,
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(10),
            dedup_bucket: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// Dispatch failures, by how the engine treats them.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Unknown job id. Caller bug, logged and ignored.
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// Someone else holds the claim, or the job stopped being claimable.
    #[error("job {0} is already claimed or no longer claimable")]
    AlreadyRunning(JobId),
    /// Retryable per backoff policy.
    #[error("transient failure ({kind:?}): {reason}")]
    Transient { kind: FailureKind, reason: String },
    /// Not retryable; the job fails at once.
    #[error("permanent failure: {0}")]
    Permanent(String),
    /// The subject no longer warrants the job; it is cancelled.
    #[error("stale subject: {0}")]
    StaleSubject(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Outcome of a dispatch whose result was recorded.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    /// The job as stored after recording the outcome.
    pub job: Job,
    /// Next occurrence, for recurring jobs that finished.
    pub successor: Option<Job>,
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatchStats {
    pub claimed: u64,
    pub delivered: u64,
    pub retried: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub claim_conflicts: u64,
}

/// Runs one attempt of one job at a time; share it behind an `Arc` to run
/// many concurrently.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    directory: Arc<dyn SubjectDirectory>,
    renderer: Arc<dyn Renderer>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    stats: Arc<Mutex<DispatchStats>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        directory: Arc<dyn SubjectDirectory>,
        renderer: Arc<dyn Renderer>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            directory,
            renderer,
            notifier,
            clock,
            config,
            stats: Arc::new(Mutex::new(DispatchStats::default())),
        }
    }

    /// Get current dispatcher statistics.
    pub fn stats(&self) -> DispatchStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn stats_handle(&self) -> Arc<Mutex<DispatchStats>> {
        self.stats.clone()
    }

    fn bump(&self, f: impl FnOnce(&mut DispatchStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Claim and run one attempt of job `id`.
    #[instrument(skip(self), fields(job_id = %id))]
    pub async fn dispatch(&self, id: JobId) -> Result<DispatchReport, DispatchError> {
        let job = match self.store.mark_running(id, self.clock.now()).await {
            Ok(job) => job,
            Err(JobStoreError::NotFound(id)) => {
                warn!("dispatch requested for unknown job");
                return Err(DispatchError::NotFound(id));
            }
            Err(JobStoreError::AttemptsExhausted(id)) => {
                self.bump(|s| s.failed += 1);
                error!(job_id = %id, "job failed: attempt limit reached before claim");
                if let Some(job) = self.store.get(id).await? {
                    if job.kind == JobKind::RecurringDigest {
                        self.schedule_successor(&job, self.clock.now()).await?;
                    }
                }
                return Err(JobStoreError::AttemptsExhausted(id).into());
            }
            Err(e) if e.is_claim_conflict() => {
                self.bump(|s| s.claim_conflicts += 1);
                debug!(error = %e, "claim refused");
                return Err(DispatchError::AlreadyRunning(id));
            }
            Err(e) => return Err(e.into()),
        };
        self.bump(|s| s.claimed += 1);

        debug!(
            subject = %job.subject,
            kind = %job.kind,
            attempt = job.attempt,
            "claimed job"
        );

        let result = self.attempt(&job).await;
        let finished_at = self.clock.now();
        let outcome = self.outcome_for(&job, result, finished_at);

        // Successor first, so a crash before the outcome write cannot end
        // the chain. Its idempotency key makes a repeat harmless.
        let recurs = matches!(outcome, JobOutcome::Delivered | JobOutcome::Failed { .. });
        let successor = if recurs && job.kind == JobKind::RecurringDigest {
            self.schedule_successor(&job, finished_at).await?
        } else {
            None
        };

        let recorded = match self
            .store
            .record_outcome(job.id, job.attempt, outcome, finished_at)
            .await
        {
            Ok(recorded) => recorded,
            Err(e) if e.is_claim_conflict() => {
                self.bump(|s| s.claim_conflicts += 1);
                warn!(error = %e, "claim was recovered while the attempt was in flight");
                return Err(DispatchError::AlreadyRunning(id));
            }
            Err(e) => return Err(e.into()),
        };

        self.report(&recorded);

        // Removed while this attempt ran: the chain stops here.
        if recorded.cancel_requested && successor.is_some() {
            self.store
                .cancel(&recorded.subject, Some(JobKind::RecurringDigest), finished_at)
                .await?;
        }

        Ok(DispatchReport {
            job: recorded,
            successor,
        })
    }

    /// One delivery attempt. Never touches the store.
    async fn attempt(&self, job: &Job) -> Result<(), DispatchError> {
        let state = match tokio::time::timeout(
            self.config.send_timeout,
            self.directory.subject_state(&job.subject),
        )
        .await
        {
            Err(_) => {
                return Err(DispatchError::Transient {
                    kind: FailureKind::Timeout,
                    reason: format!("subject lookup timed out after {:?}", self.config.send_timeout),
                });
            }
            Ok(lookup) => lookup.map_err(|e| DispatchError::Transient {
                kind: FailureKind::Transient,
                reason: e.to_string(),
            })?,
        };
        let subject = revalidate(job, state, self.config.dedup_bucket)?;

        let content = self.renderer.render(job, &subject);

        match tokio::time::timeout(self.config.send_timeout, self.notifier.send(job, &content)).await
        {
            Err(_) => Err(DispatchError::Transient {
                kind: FailureKind::Timeout,
                reason: format!("send timed out after {:?}", self.config.send_timeout),
            }),
            Ok(DeliveryResult::Delivered) => Ok(()),
            Ok(DeliveryResult::Rejected(reason)) => Err(DispatchError::Permanent(reason)),
            Ok(DeliveryResult::TransientFailure(reason)) => Err(DispatchError::Transient {
                kind: FailureKind::Transient,
                reason,
            }),
        }
    }

    fn outcome_for(
        &self,
        job: &Job,
        result: Result<(), DispatchError>,
        now: DateTime<Utc>,
    ) -> JobOutcome {
        let (failure, reason) = match result {
            Ok(()) => return JobOutcome::Delivered,
            Err(DispatchError::StaleSubject(reason)) => return JobOutcome::Stale { reason },
            Err(DispatchError::Transient { kind, reason }) => (kind, reason),
            Err(DispatchError::Permanent(reason)) => (FailureKind::Permanent, reason),
            Err(other) => (FailureKind::Transient, other.to_string()),
        };

        let policy = RetryPolicy {
            max_attempts: job.max_attempts,
            ..self.config.retry.clone()
        };
        match policy.decide(job.attempt, failure, now, jitter_seed(&job.id)) {
            RetryDecision::RetryAt(at) => JobOutcome::RetryAt { at, error: reason },
            RetryDecision::GiveUp if failure.is_retryable() => JobOutcome::Failed {
                error: format!("{reason} (gave up after {} attempts)", job.attempt),
            },
            RetryDecision::GiveUp => JobOutcome::Failed { error: reason },
        }
    }

    fn report(&self, job: &Job) {
        match job.state {
            JobState::Succeeded => {
                self.bump(|s| s.delivered += 1);
                info!(
                    subject = %job.subject,
                    kind = %job.kind,
                    attempt = job.attempt,
                    key = %job.idempotency_key,
                    "notification delivered"
                );
            }
            JobState::Scheduled => {
                self.bump(|s| s.retried += 1);
                info!(
                    subject = %job.subject,
                    attempt = job.attempt,
                    retry_at = %job.due_at,
                    "delivery failed, retry scheduled"
                );
            }
            JobState::Failed => {
                self.bump(|s| s.failed += 1);
                error!(
                    job_id = %job.id,
                    subject = %job.subject,
                    kind = %job.kind,
                    attempt = job.attempt,
                    error = job.last_error.as_deref().unwrap_or_default(),
                    "job failed permanently"
                );
            }
            JobState::Cancelled => {
                self.bump(|s| s.cancelled += 1);
                info!(subject = %job.subject, kind = %job.kind, "job cancelled");
            }
            JobState::Running => {}
        }
    }

    /// Upsert the next occurrence of a finished recurring job: the first slot
    /// `anchor + k * interval` strictly after `now`.
    async fn schedule_successor(
        &self,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, DispatchError> {
        let Some(interval) = job.interval_secs.filter(|s| *s > 0) else {
            warn!(subject = %job.subject, "recurring job has no interval, not rescheduling");
            return Ok(None);
        };

        let Some(next_at) = next_slot(job.anchor_at, interval, now) else {
            warn!(subject = %job.subject, "next occurrence is out of range");
            return Ok(None);
        };

        let next = Job::new(
            job.subject.clone(),
            job.kind,
            next_at,
            chrono_duration(self.config.dedup_bucket),
            now,
        )
        .with_priority(job.priority)
        .with_max_attempts(self.config.retry.max_attempts)
        .every(interval);

        let stored = self.store.upsert(next).await?;
        debug!(successor = %stored.id, due_at = %stored.due_at, "scheduled next occurrence");
        Ok(Some(stored))
    }
}

/// Check a job against the subject's current state.
fn revalidate(
    job: &Job,
    state: Option<SubjectState>,
    bucket: Duration,
) -> Result<SubjectState, DispatchError> {
    let Some(state) = state else {
        return Err(DispatchError::StaleSubject("subject no longer exists".into()));
    };
    if !state.active {
        return Err(DispatchError::StaleSubject("subject is no longer active".into()));
    }
    if job.kind.tracks_deadline() {
        let bucket = chrono_duration(bucket);
        match state.deadline {
            None => return Err(DispatchError::StaleSubject("deadline was cleared".into())),
            Some(deadline) if bucket_of(deadline, bucket) != bucket_of(job.anchor_at, bucket) => {
                return Err(DispatchError::StaleSubject(format!(
                    "deadline moved to {deadline}"
                )));
            }
            Some(_) => {}
        }
    }
    Ok(state)
}

fn next_slot(anchor: DateTime<Utc>, interval_secs: u64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let interval = i64::try_from(interval_secs).ok()?;
    let elapsed = (now - anchor).num_seconds().max(0);
    let k = elapsed / interval + 1;
    anchor.checked_add_signed(chrono::Duration::seconds(k.checked_mul(interval)?))
}
