use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tactix_core::JobId;

use crate::jobs::{IdempotencyKey, Job};

use super::{DeliveryResult, Notifier, RenderedContent};

/// One call to [`InMemoryNotifier::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job_id: JobId,
    pub attempt: u32,
    pub content: RenderedContent,
    pub result: DeliveryResult,
}

#[derive(Debug, Default)]
struct State {
    script: VecDeque<DeliveryResult>,
    fallback: Option<DeliveryResult>,
    latency: Option<Duration>,
    sends: Vec<Delivery>,
}

/// Notifier for tests and local runs.
///
/// Responses are taken from a script, one per call; once the script runs out
/// the fallback response (default `Delivered`) is used. Every call is
/// recorded.
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    state: Mutex<State>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond with `results` to the next calls, in order.
    pub fn script(self, results: impl IntoIterator<Item = DeliveryResult>) -> Self {
        self.lock().script.extend(results);
        self
    }

    /// Respond with `result` once the script is exhausted.
    pub fn always(self, result: DeliveryResult) -> Self {
        self.lock().fallback = Some(result);
        self
    }

    /// Sleep this long inside every call.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every call made so far, in call order.
    pub fn sends(&self) -> Vec<Delivery> {
        self.lock().sends.clone()
    }

    /// Successful deliveries only.
    pub fn delivered(&self) -> Vec<Delivery> {
        self.lock()
            .sends
            .iter()
            .filter(|d| d.result == DeliveryResult::Delivered)
            .cloned()
            .collect()
    }

    pub fn delivered_with_key(&self, key: &IdempotencyKey) -> usize {
        self.lock()
            .sends
            .iter()
            .filter(|d| d.result == DeliveryResult::Delivered && &d.content.idempotency_key == key)
            .count()
    }

    pub fn call_count(&self) -> usize {
        self.lock().sends.len()
    }
}

#[async_trait::async_trait]
impl Notifier for InMemoryNotifier {
    async fn send(&self, job: &Job, content: &RenderedContent) -> DeliveryResult {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        let result = state
            .script
            .pop_front()
            .or_else(|| state.fallback.clone())
            .unwrap_or(DeliveryResult::Delivered);

        state.sends.push(Delivery {
            job_id: job.id,
            attempt: job.attempt,
            content: content.clone(),
            result: result.clone(),
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobKind;
    use crate::notify::{PlainRenderer, Renderer};
    use chrono::{TimeZone, Utc};
    use tactix_core::SubjectRef;
    use tactix_tasks::SubjectState;

    #[tokio::test]
    async fn follows_script_then_fallback() {
        let at = Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap();
        let job = Job::new(
            SubjectRef::task(1),
            JobKind::DeadlineReminder,
            at,
            chrono::Duration::seconds(60),
            at,
        );
        let content = PlainRenderer.render(&job, &SubjectState::active(Some(at)));

        let notifier = InMemoryNotifier::new()
            .script([DeliveryResult::TransientFailure("503".into())])
            .always(DeliveryResult::Rejected("bad address".into()));

        assert_eq!(
            notifier.send(&job, &content).await,
            DeliveryResult::TransientFailure("503".into())
        );
        assert_eq!(
            notifier.send(&job, &content).await,
            DeliveryResult::Rejected("bad address".into())
        );
        assert_eq!(notifier.call_count(), 2);
        assert!(notifier.delivered().is_empty());
        assert_eq!(notifier.delivered_with_key(&job.idempotency_key), 0);
    }
}
