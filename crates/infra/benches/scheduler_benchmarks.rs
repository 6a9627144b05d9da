use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tactix_core::{Clock, ManualClock, SubjectRef};
use tactix_infra::jobs::{
    InMemoryJobStore, Job, JobKind, JobStore, Priority, PriorityScheduler, SchedulerConfig,
};

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap(),
    ))
}

/// `count` reminders spread over the last minute, cycling through priorities.
fn due_jobs(clock: &ManualClock, count: usize) -> Vec<Job> {
    let now = clock.now();
    (0..count)
        .map(|i| {
            let at = now - chrono::Duration::milliseconds((i % 60_000) as i64);
            let priority = Priority::from_i64((i % 4) as i64).unwrap();
            Job::new(
                SubjectRef::task(i as i64),
                JobKind::DeadlineReminder,
                at,
                chrono::Duration::seconds(60),
                now,
            )
            .with_priority(priority)
        })
        .collect()
}

fn config(batch_limit: usize) -> SchedulerConfig {
    SchedulerConfig {
        due_window: Duration::from_secs(300),
        refresh_interval: Duration::from_secs(30),
        batch_limit,
    }
}

fn bench_refill_and_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_refill_and_drain");

    for size in [64usize, 256, 1024, 4096].iter() {
        let clock = clock();
        let jobs = due_jobs(&clock, *size);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let mut scheduler = PriorityScheduler::new(clock.clone(), config(size));
                scheduler.refill(jobs.iter().cloned());
                let mut popped = 0;
                while let Some(job) = scheduler.pop() {
                    black_box(job);
                    popped += 1;
                }
                black_box(popped)
            });
        });
    }

    group.finish();
}

fn bench_peek_next_wake(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_peek_next_wake");
    let clock = clock();
    let mut scheduler = PriorityScheduler::new(clock.clone(), config(4096));
    scheduler.refill(due_jobs(&clock, 4096));

    group.bench_function("peek_4096", |b| {
        b.iter(|| black_box(scheduler.peek_next_wake()));
    });

    group.finish();
}

fn bench_store_due_listing(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_list_due_before");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();

    for size in [256usize, 4096].iter() {
        let clock = clock();
        let store = InMemoryJobStore::new();
        runtime.block_on(async {
            for job in due_jobs(&clock, *size) {
                store.upsert(job).await.unwrap();
            }
        });

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let due = runtime
                    .block_on(store.list_due_before(clock.now(), 256))
                    .unwrap();
                black_box(due)
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_refill_and_drain,
    bench_peek_next_wake,
    bench_store_due_listing
);
criterion_main!(benches);
