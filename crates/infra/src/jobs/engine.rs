//! Scheduler control loop and dispatcher pool.
//!
//! One control loop sleeps until the scheduler's next wake time, pops due
//! jobs up to the pool's free capacity, and hands each to a worker task.
//! It never awaits a delivery itself. Workers report back only through the
//! job store, then nudge the loop so it refreshes its index.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use tactix_core::{Clock, JobId, SubjectRef};
use tactix_tasks::{SchedulingIntent, TaskPriority};

use crate::config::EngineConfig;
use crate::directory::SubjectDirectory;
use crate::notify::{Notifier, Renderer};

use super::chrono_duration;
use super::dispatcher::{DispatchError, DispatchStats, Dispatcher};
use super::scheduler::PriorityScheduler;
use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{Job, JobKind, Priority};

/// Floor for the control loop's sleep, so a wake time in the past cannot spin.
const MIN_SLEEP: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("invalid scheduling intent: {0}")]
    InvalidIntent(String),
    #[error("engine task failed: {0}")]
    Join(String),
}

/// Collaborators the engine is wired from.
pub struct EngineParts {
    pub store: Arc<dyn JobStore>,
    pub directory: Arc<dyn SubjectDirectory>,
    pub renderer: Arc<dyn Renderer>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

/// Deadline reminder engine.
pub struct NotificationEngine {
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<Dispatcher>,
    scheduler: tokio::sync::Mutex<PriorityScheduler>,
    permits: Arc<Semaphore>,
    workers: tokio::sync::Mutex<JoinSet<()>>,
    in_flight: Arc<Mutex<HashSet<JobId>>>,
    wake: Arc<Notify>,
    dirty: Arc<AtomicBool>,
}

impl NotificationEngine {
    pub fn new(config: EngineConfig, parts: EngineParts) -> Self {
        let dispatcher = Dispatcher::new(
            parts.store.clone(),
            parts.directory,
            parts.renderer,
            parts.notifier,
            parts.clock.clone(),
            config.dispatcher(),
        );
        Self {
            scheduler: tokio::sync::Mutex::new(PriorityScheduler::new(
                parts.clock.clone(),
                config.scheduler(),
            )),
            permits: Arc::new(Semaphore::new(config.pool_size)),
            store: parts.store,
            clock: parts.clock,
            dispatcher: Arc::new(dispatcher),
            workers: tokio::sync::Mutex::new(JoinSet::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            wake: Arc::new(Notify::new()),
            dirty: Arc::new(AtomicBool::new(true)),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Get current dispatch statistics.
    pub fn stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    pub async fn job_stats(&self) -> Result<JobStats, EngineError> {
        Ok(self.store.stats().await?)
    }

    fn bucket(&self) -> chrono::Duration {
        chrono_duration(self.config.dedup_bucket)
    }

    fn nudge(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    fn new_job(&self, subject: &SubjectRef, kind: JobKind, anchor_at: DateTime<Utc>) -> Job {
        Job::new(subject.clone(), kind, anchor_at, self.bucket(), self.clock.now())
            .with_max_attempts(self.config.retry.max_attempts)
    }

    /// A subject's deadline or priority changed. `None` clears the deadline
    /// and cancels its reminders. Returns the stored reminder jobs.
    pub async fn on_deadline_changed(
        &self,
        subject: &SubjectRef,
        deadline: Option<DateTime<Utc>>,
        priority: TaskPriority,
    ) -> Result<Vec<Job>, EngineError> {
        let now = self.clock.now();
        let Some(deadline) = deadline else {
            let mut cancelled = 0;
            for kind in [JobKind::DeadlineReminder, JobKind::DueSoonReminder] {
                cancelled += self.store.cancel(subject, Some(kind), now).await?;
            }
            debug!(subject = %subject, cancelled, "deadline cleared");
            self.nudge();
            return Ok(Vec::new());
        };

        let priority = Priority::from(priority);
        let mut stored = Vec::with_capacity(2);

        let reminder = self
            .new_job(subject, JobKind::DeadlineReminder, deadline)
            .with_priority(priority);
        let reminder = self.store.upsert(reminder).await?;
        self.store
            .cancel_superseded(subject, JobKind::DeadlineReminder, &reminder.idempotency_key, now)
            .await?;
        stored.push(reminder);

        let remind_at = self
            .config
            .due_soon_lead
            .map(|lead| deadline - chrono_duration(lead))
            .filter(|at| *at > now);
        match remind_at {
            Some(at) => {
                let soon = self
                    .new_job(subject, JobKind::DueSoonReminder, deadline)
                    .with_priority(priority)
                    .due_at(at);
                let soon = self.store.upsert(soon).await?;
                self.store
                    .cancel_superseded(subject, JobKind::DueSoonReminder, &soon.idempotency_key, now)
                    .await?;
                stored.push(soon);
            }
            None => {
                self.store
                    .cancel(subject, Some(JobKind::DueSoonReminder), now)
                    .await?;
            }
        }

        debug!(subject = %subject, deadline = %deadline, jobs = stored.len(), "deadline scheduled");
        self.nudge();
        Ok(stored)
    }

    /// The subject is gone: cancel everything scheduled for it.
    pub async fn on_subject_removed(&self, subject: &SubjectRef) -> Result<usize, EngineError> {
        let cancelled = self.store.cancel(subject, None, self.clock.now()).await?;
        debug!(subject = %subject, cancelled, "subject removed");
        self.nudge();
        Ok(cancelled)
    }

    /// Start a recurring digest at `first_at`, repeating every `every`.
    pub async fn schedule_digest(
        &self,
        subject: &SubjectRef,
        first_at: DateTime<Utc>,
        every: Duration,
        priority: TaskPriority,
    ) -> Result<Job, EngineError> {
        if every < self.config.dedup_bucket || every.as_secs() == 0 {
            return Err(EngineError::InvalidIntent(format!(
                "digest interval {:?} is shorter than the dedup bucket {:?}",
                every, self.config.dedup_bucket
            )));
        }
        let digest = self
            .new_job(subject, JobKind::RecurringDigest, first_at)
            .with_priority(priority.into())
            .every(every.as_secs());
        let digest = self.store.upsert(digest).await?;
        self.nudge();
        Ok(digest)
    }

    /// Apply an intent emitted by the task service.
    pub async fn apply(&self, intent: SchedulingIntent) -> Result<(), EngineError> {
        debug!(subject = %intent.subject(), "applying intent");
        match intent {
            SchedulingIntent::DeadlineChanged(i) => {
                self.on_deadline_changed(&i.subject, i.deadline, i.priority)
                    .await?;
            }
            SchedulingIntent::SubjectRemoved(i) => {
                self.on_subject_removed(&i.subject).await?;
            }
            SchedulingIntent::DigestRequested(i) => {
                self.schedule_digest(
                    &i.subject,
                    i.first_at,
                    Duration::from_secs(i.every_secs),
                    i.priority,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Return abandoned claims to the queue.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let now = self.clock.now();
        let older_than = now - chrono_duration(self.config.stale_after);
        let recovered = self.store.recover_stuck_running(older_than, now).await?;
        if recovered > 0 {
            warn!(recovered, "recovered jobs abandoned mid-dispatch");
            self.nudge();
        }
        Ok(recovered)
    }

    /// One wake cycle: refresh the index if needed, then hand due jobs to
    /// free workers. Returns how many jobs were handed out.
    pub async fn tick(&self) -> Result<usize, EngineError> {
        self.reap().await;

        let mut scheduler = self.scheduler.lock().await;
        if self.dirty.swap(false, Ordering::SeqCst) {
            scheduler.invalidate();
        }
        if scheduler.needs_refresh() {
            let limit = scheduler.config().batch_limit;
            // Overdue jobs go first so later high-priority ones in the window
            // cannot crowd them out of the batch.
            let mut due = self.store.list_due_before(self.clock.now(), limit).await?;
            if due.len() < limit {
                due.extend(self.store.list_due_before(scheduler.window_end(), limit).await?);
            }
            let mut seen = HashSet::new();
            let in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            scheduler.refill(
                due.into_iter()
                    .filter(|job| !in_flight.contains(&job.id) && seen.insert(job.id)),
            );
        }

        let mut handed = 0;
        let mut workers = self.workers.lock().await;
        while let Ok(permit) = self.permits.clone().try_acquire_owned() {
            let Some(job) = scheduler.pop() else {
                break;
            };
            self.in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(job.id);

            let id = job.id;
            let dispatcher = self.dispatcher.clone();
            let in_flight = self.in_flight.clone();
            let dirty = self.dirty.clone();
            let wake = self.wake.clone();
            workers.spawn(async move {
                let _permit = permit;
                match dispatcher.dispatch(id).await {
                    Ok(report) => {
                        debug!(job_id = %id, state = %report.job.state, "dispatch finished")
                    }
                    Err(DispatchError::AlreadyRunning(_)) => {
                        debug!(job_id = %id, "dispatch skipped, claimed elsewhere")
                    }
                    Err(e) => warn!(job_id = %id, error = %e, "dispatch failed"),
                }
                in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                dirty.store(true, Ordering::SeqCst);
                wake.notify_one();
            });
            handed += 1;
        }

        if handed > 0 {
            debug!(handed, queued = scheduler.len(), "handed jobs to workers");
        }
        Ok(handed)
    }

    /// Collect finished workers without waiting.
    async fn reap(&self) -> usize {
        let mut workers = self.workers.lock().await;
        let mut reaped = 0;
        while let Some(result) = workers.try_join_next() {
            log_join(result);
            reaped += 1;
        }
        reaped
    }

    /// Wait for every in-flight worker.
    pub async fn drain(&self) -> usize {
        let mut workers = self.workers.lock().await;
        let mut drained = 0;
        while let Some(result) = workers.join_next().await {
            log_join(result);
            drained += 1;
        }
        drained
    }

    /// Tick and drain until nothing is due at the current clock reading.
    pub async fn run_until_idle(&self) -> Result<(), EngineError> {
        loop {
            let handed = self.tick().await?;
            let drained = self.drain().await;
            if handed == 0 && drained == 0 {
                return Ok(());
            }
        }
    }

    /// Start the control loop on the current runtime.
    pub fn spawn(self: Arc<Self>) -> EngineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.dispatcher.stats_handle();
        let join = tokio::spawn(self.control_loop(shutdown_rx));
        EngineHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }

    async fn control_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            pool_size = self.config.pool_size,
            window_secs = self.config.due_window.as_secs(),
            "notification engine started"
        );
        let recovery_every = chrono_duration(self.config.recovery_interval);
        let mut next_recovery = self.clock.now() + recovery_every;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.clock.now() >= next_recovery {
                if let Err(e) = self.recover().await {
                    error!(error = %e, "crash recovery failed");
                }
                next_recovery = self.clock.now() + recovery_every;
            }

            if let Err(e) = self.tick().await {
                error!(error = %e, "scheduler tick failed");
            }

            let sleep_for = self.sleep_duration(next_recovery).await;
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("notification engine stopping, draining workers");
        let drained = self.drain().await;
        info!(drained, "notification engine stopped");
    }

    async fn sleep_duration(&self, next_recovery: DateTime<Utc>) -> Duration {
        let refresh = self.config.refresh_interval;
        // Pool saturated: a finishing worker wakes the loop.
        if self.permits.available_permits() == 0 {
            return refresh;
        }
        let now = self.clock.now();
        let wake_at = self
            .scheduler
            .lock()
            .await
            .peek_next_wake()
            .unwrap_or(now)
            .min(next_recovery);
        (wake_at - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .clamp(MIN_SLEEP, refresh.max(MIN_SLEEP))
    }
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "dispatch worker panicked");
    }
}

/// Handle to control a running engine.
#[derive(Debug)]
pub struct EngineHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<DispatchStats>>,
}

impl EngineHandle {
    /// Request graceful shutdown and wait for in-flight dispatches.
    pub async fn shutdown(mut self) -> Result<(), EngineError> {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            join.await.map_err(|e| EngineError::Join(e.to_string()))?;
        }
        Ok(())
    }

    /// Get current dispatch statistics.
    pub fn stats(&self) -> DispatchStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
