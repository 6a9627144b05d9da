//! In-memory priority index over the due window.
//!
//! The scheduler never owns job state: it holds a snapshot of the jobs due
//! within the look-ahead window, rebuilt from `JobStore::list_due_before` on
//! every refresh. Losing it is harmless; the next refill recreates it.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use tactix_core::{Clock, JobId};

use super::chrono_duration;
use super::types::{Job, Priority};

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How far ahead of now the index reaches.
    pub due_window: Duration,
    /// Maximum time between two refills from the store.
    pub refresh_interval: Duration,
    /// Maximum jobs held in the index.
    pub batch_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            due_window: Duration::from_secs(5 * 60),
            refresh_interval: Duration::from_secs(30),
            batch_limit: 256,
        }
    }
}

/// Heap entry. Orders by `(due_at asc, priority desc, id asc)`; the smallest
/// entry runs first.
#[derive(Debug, Clone)]
struct QueueEntry {
    due_at: DateTime<Utc>,
    priority: Priority,
    id: JobId,
    job: Job,
}

impl QueueEntry {
    fn key(&self) -> (DateTime<Utc>, Reverse<Priority>, JobId) {
        (self.due_at, Reverse(self.priority), self.id)
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Decides what runs next and when the engine should wake.
#[derive(Debug)]
pub struct PriorityScheduler {
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    queue: BinaryHeap<Reverse<QueueEntry>>,
    next_refresh: Option<DateTime<Utc>>,
}

impl PriorityScheduler {
    pub fn new(clock: Arc<dyn Clock>, config: SchedulerConfig) -> Self {
        Self {
            clock,
            config,
            queue: BinaryHeap::new(),
            next_refresh: None,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Upper bound for the store query that feeds [`refill`](Self::refill).
    pub fn window_end(&self) -> DateTime<Utc> {
        self.clock.now() + chrono_duration(self.config.due_window)
    }

    /// Replace the index with a fresh read from the store.
    pub fn refill(&mut self, jobs: impl IntoIterator<Item = Job>) {
        self.queue = jobs
            .into_iter()
            .take(self.config.batch_limit)
            .map(|job| {
                Reverse(QueueEntry {
                    due_at: job.due_at,
                    priority: job.priority,
                    id: job.id,
                    job,
                })
            })
            .collect();
        self.next_refresh = Some(self.clock.now() + chrono_duration(self.config.refresh_interval));
    }

    /// Whether the index should be rebuilt before the next pop.
    pub fn needs_refresh(&self) -> bool {
        self.next_refresh.is_none_or(|at| self.clock.now() >= at)
    }

    /// Force a refill on the next cycle (new intents, finished attempts).
    pub fn invalidate(&mut self) {
        self.next_refresh = None;
    }

    /// When the engine should next act: the earlier of the head job's due
    /// time and the refresh boundary. Reports now while a refresh is pending.
    pub fn peek_next_wake(&self) -> Option<DateTime<Utc>> {
        let refresh = self.next_refresh.unwrap_or_else(|| self.clock.now());
        let head = self.queue.peek().map(|Reverse(entry)| entry.due_at);
        Some(head.map_or(refresh, |due| due.min(refresh)))
    }

    /// Remove and return the next job if it is due now.
    pub fn pop(&mut self) -> Option<Job> {
        let now = self.clock.now();
        match self.queue.peek() {
            Some(Reverse(entry)) if entry.due_at <= now => {
                self.queue.pop().map(|Reverse(entry)| entry.job)
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
