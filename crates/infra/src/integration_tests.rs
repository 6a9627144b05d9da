//! Integration tests for the full reminder pipeline.
//!
//! Tests: Intent → JobStore → PriorityScheduler → Dispatcher → Notifier → JobStore
//!
//! Verifies:
//! - A deadline produces exactly one delivery at the deadline
//! - Removed subjects produce no deliveries
//! - Transient failures are retried with backoff until delivered or exhausted
//! - Restarting against the same store neither loses nor replays reminders

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};

    use tactix_core::{Clock, ManualClock, SubjectRef};
    use tactix_tasks::{SchedulingIntent, SubjectState, TaskPriority};

    use crate::config::EngineConfig;
    use crate::directory::InMemorySubjectDirectory;
    use crate::jobs::{
        EngineParts, InMemoryJobStore, JobState, JobStore, NotificationEngine, RetryPolicy,
    };
    use crate::notify::{DeliveryResult, InMemoryNotifier, PlainRenderer};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap()
    }

    struct Harness {
        engine: NotificationEngine,
        store: Arc<InMemoryJobStore>,
        directory: Arc<InMemorySubjectDirectory>,
        notifier: Arc<InMemoryNotifier>,
        clock: Arc<ManualClock>,
    }

    impl Harness {
        fn new(config: EngineConfig, notifier: InMemoryNotifier) -> Self {
            Self::with_store(
                config,
                notifier,
                InMemoryJobStore::arc(),
                Arc::new(ManualClock::new(t0())),
            )
        }

        fn with_store(
            config: EngineConfig,
            notifier: InMemoryNotifier,
            store: Arc<InMemoryJobStore>,
            clock: Arc<ManualClock>,
        ) -> Self {
            let directory = Arc::new(InMemorySubjectDirectory::new());
            let notifier = Arc::new(notifier);
            let engine = NotificationEngine::new(
                config,
                EngineParts {
                    store: store.clone(),
                    directory: directory.clone(),
                    renderer: Arc::new(PlainRenderer),
                    notifier: notifier.clone(),
                    clock: clock.clone(),
                },
            );
            Self {
                engine,
                store,
                directory,
                notifier,
                clock,
            }
        }

        /// Create a task with a deadline in the directory and tell the engine.
        async fn task_with_deadline(&self, id: i64, deadline: DateTime<Utc>, priority: TaskPriority) -> SubjectRef {
            let subject = SubjectRef::task(id);
            self.directory.insert(
                subject.clone(),
                SubjectState::active(Some(deadline))
                    .with_assignee(format!("user:{id}"))
                    .with_priority(priority),
            );
            self.engine
                .apply(SchedulingIntent::deadline_changed(
                    subject.clone(),
                    Some(deadline),
                    priority,
                ))
                .await
                .unwrap();
            subject
        }

        async fn advance(&self, by: chrono::Duration) {
            self.clock.advance(by);
            self.engine.run_until_idle().await.unwrap();
        }
    }

    fn config(max_attempts: u32) -> EngineConfig {
        EngineConfig::default()
            .with_retry(RetryPolicy::exponential(
                max_attempts,
                Duration::from_secs(30),
                Duration::from_secs(3600),
            ))
            .with_send_timeout(Duration::from_millis(500))
    }

    #[tokio::test]
    async fn deadline_reminder_is_delivered_exactly_once() {
        let h = Harness::new(config(5), InMemoryNotifier::new());
        let deadline = t0() + chrono::Duration::hours(1);
        let subject = h.task_with_deadline(1, deadline, TaskPriority::High).await;

        let jobs = h.store.list_for_subject(&subject).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].state, JobState::Scheduled);
        let key = jobs[0].idempotency_key.clone();

        h.advance(chrono::Duration::minutes(59)).await;
        assert_eq!(h.notifier.call_count(), 0);

        h.advance(chrono::Duration::minutes(1)).await;
        assert_eq!(h.notifier.call_count(), 1);
        assert_eq!(h.notifier.delivered_with_key(&key), 1);
        assert_eq!(
            h.notifier.delivered()[0].content.recipients,
            vec!["user:1".to_string()]
        );

        // Nothing more, however far time moves.
        h.advance(chrono::Duration::days(2)).await;
        assert_eq!(h.notifier.call_count(), 1);
        let job = h.store.get(jobs[0].id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.attempt, 1);
    }

    #[tokio::test]
    async fn deleted_task_is_never_reminded() {
        let h = Harness::new(config(5), InMemoryNotifier::new());
        let subject = h
            .task_with_deadline(1, t0() + chrono::Duration::hours(1), TaskPriority::Medium)
            .await;

        h.advance(chrono::Duration::minutes(30)).await;
        h.directory.remove(&subject);
        h.engine
            .apply(SchedulingIntent::subject_removed(subject.clone()))
            .await
            .unwrap();

        let jobs = h.store.list_for_subject(&subject).await.unwrap();
        assert!(jobs.iter().all(|j| j.state == JobState::Cancelled));

        h.advance(chrono::Duration::hours(2)).await;
        assert_eq!(h.notifier.call_count(), 0);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_delivered() {
        let notifier = InMemoryNotifier::new().script([
            DeliveryResult::TransientFailure("provider 503".into()),
            DeliveryResult::TransientFailure("provider 503".into()),
        ]);
        let h = Harness::new(config(5), notifier);
        let subject = h.task_with_deadline(1, t0(), TaskPriority::Medium).await;

        // First attempt fails immediately.
        h.engine.run_until_idle().await.unwrap();
        assert_eq!(h.notifier.call_count(), 1);

        // Backoff: 30s (+ up to 20% jitter), then 60s (+ jitter).
        h.advance(chrono::Duration::seconds(36)).await;
        assert_eq!(h.notifier.call_count(), 2);
        h.advance(chrono::Duration::seconds(72)).await;
        assert_eq!(h.notifier.call_count(), 3);

        h.advance(chrono::Duration::hours(2)).await;
        assert_eq!(h.notifier.call_count(), 3);

        let job = &h.store.list_for_subject(&subject).await.unwrap()[0];
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.attempt, 3);
        assert_eq!(h.notifier.delivered_with_key(&job.idempotency_key), 1);
        assert_eq!(h.engine.stats().retried, 2);
    }

    #[tokio::test]
    async fn persistent_failure_stops_at_max_attempts() {
        let notifier =
            InMemoryNotifier::new().always(DeliveryResult::TransientFailure("provider down".into()));
        let h = Harness::new(config(3), notifier);
        let subject = h.task_with_deadline(1, t0(), TaskPriority::Medium).await;

        h.engine.run_until_idle().await.unwrap();
        for _ in 0..10 {
            h.advance(chrono::Duration::minutes(10)).await;
        }

        assert_eq!(h.notifier.call_count(), 3);
        let job = &h.store.list_for_subject(&subject).await.unwrap()[0];
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempt, 3);
        assert!(job.last_error.as_deref().unwrap().contains("provider down"));
        assert_eq!(h.engine.stats().failed, 1);
    }

    #[tokio::test]
    async fn same_instant_deadlines_dispatch_by_priority() {
        let h = Harness::new(config(5).with_pool_size(1), InMemoryNotifier::new());
        let at = t0() + chrono::Duration::minutes(1);
        h.task_with_deadline(1, at, TaskPriority::Low).await;
        h.task_with_deadline(2, at, TaskPriority::Urgent).await;
        h.task_with_deadline(3, at, TaskPriority::Medium).await;

        h.advance(chrono::Duration::minutes(1)).await;

        let order: Vec<_> = h
            .notifier
            .sends()
            .into_iter()
            .map(|d| d.content.recipients[0].clone())
            .collect();
        assert_eq!(order, vec!["user:2", "user:3", "user:1"]);
    }

    #[tokio::test]
    async fn rescheduled_deadline_reminds_only_for_the_new_time() {
        let h = Harness::new(config(5), InMemoryNotifier::new());
        let first = t0() + chrono::Duration::hours(1);
        let moved = t0() + chrono::Duration::hours(3);
        h.task_with_deadline(1, first, TaskPriority::Medium).await;
        h.task_with_deadline(1, moved, TaskPriority::Medium).await;

        h.advance(chrono::Duration::hours(2)).await;
        assert_eq!(h.notifier.call_count(), 0);

        h.advance(chrono::Duration::hours(1)).await;
        assert_eq!(h.notifier.call_count(), 1);
    }

    #[tokio::test]
    async fn completed_task_reminder_is_cancelled_not_failed() {
        let h = Harness::new(config(5), InMemoryNotifier::new());
        let subject = h
            .task_with_deadline(1, t0() + chrono::Duration::minutes(5), TaskPriority::Medium)
            .await;

        // Completed in the CRUD store without an intent reaching the engine.
        let mut done = SubjectState::active(Some(t0() + chrono::Duration::minutes(5)));
        done.active = false;
        h.directory.insert(subject.clone(), done);

        h.advance(chrono::Duration::minutes(5)).await;
        assert_eq!(h.notifier.call_count(), 0);
        let job = &h.store.list_for_subject(&subject).await.unwrap()[0];
        assert_eq!(job.state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn restart_recovers_abandoned_claim_without_replaying_deliveries() {
        let store = InMemoryJobStore::arc();
        let clock = Arc::new(ManualClock::new(t0()));

        let before = Harness::with_store(config(5), InMemoryNotifier::new(), store.clone(), clock.clone());
        before.task_with_deadline(1, t0(), TaskPriority::Medium).await;
        before.engine.run_until_idle().await.unwrap();
        assert_eq!(before.notifier.call_count(), 1);

        // The worker dies right after claiming task 2's reminder.
        let crashed = before
            .task_with_deadline(2, t0() + chrono::Duration::minutes(1), TaskPriority::Medium)
            .await;
        let orphan = store.list_for_subject(&crashed).await.unwrap().remove(0);
        clock.advance(chrono::Duration::minutes(1));
        store.mark_running(orphan.id, clock.now()).await.unwrap();
        drop(before);

        let after = Harness::with_store(config(5), InMemoryNotifier::new(), store.clone(), clock.clone());
        after.directory.insert(
            crashed.clone(),
            SubjectState::active(Some(t0() + chrono::Duration::minutes(1))),
        );

        // Too early: the claim is not stale yet.
        assert_eq!(after.engine.recover().await.unwrap(), 0);

        clock.advance(chrono::Duration::minutes(6));
        assert_eq!(after.engine.recover().await.unwrap(), 1);
        assert_eq!(after.engine.recover().await.unwrap(), 0);
        after.engine.run_until_idle().await.unwrap();

        // Only the orphaned job is sent; task 1 is not replayed.
        assert_eq!(after.notifier.call_count(), 1);
        assert_eq!(after.notifier.sends()[0].job_id, orphan.id);
        let orphan = store.get(orphan.id).await.unwrap().unwrap();
        assert_eq!(orphan.state, JobState::Succeeded);
        assert_eq!(orphan.attempt, 2);
    }

    #[tokio::test]
    async fn recurring_digest_keeps_running_on_its_interval() {
        let h = Harness::new(config(5), InMemoryNotifier::new());
        let subject = SubjectRef::task(9);
        h.directory.insert(subject.clone(), SubjectState::active(None));
        h.engine
            .apply(SchedulingIntent::DigestRequested(tactix_tasks::intent::DigestRequested {
                subject: subject.clone(),
                first_at: t0() + chrono::Duration::hours(1),
                every_secs: 3600,
                priority: TaskPriority::Low,
            }))
            .await
            .unwrap();

        for _ in 0..3 {
            h.advance(chrono::Duration::hours(1)).await;
        }
        assert_eq!(h.notifier.call_count(), 3);

        // Removing the subject stops the chain.
        h.engine.on_subject_removed(&subject).await.unwrap();
        h.advance(chrono::Duration::hours(3)).await;
        assert_eq!(h.notifier.call_count(), 3);
    }
}
