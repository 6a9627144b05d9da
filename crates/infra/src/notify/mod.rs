//! Notification rendering and delivery.
//!
//! Transports are pluggable behind [`Notifier`]. A notifier only has to make
//! one delivery attempt per call; duplicate suppression is handled upstream
//! through job state, and the idempotency key travels with the content so
//! channels that dedupe natively can use it too.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::jobs::{IdempotencyKey, Job};

mod recording;
mod render;

pub use recording::{Delivery, InMemoryNotifier};
pub use render::PlainRenderer;

use tactix_tasks::SubjectState;

/// What gets sent for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedContent {
    pub title: String,
    pub body: String,
    pub recipients: Vec<String>,
    pub idempotency_key: IdempotencyKey,
}

/// Turns a job plus the subject's current state into notification content.
pub trait Renderer: Send + Sync {
    fn render(&self, job: &Job, subject: &SubjectState) -> RenderedContent;
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryResult {
    Delivered,
    /// Permanent rejection (invalid recipient, refused content).
    Rejected(String),
    /// Worth retrying (provider outage, throttling).
    TransientFailure(String),
}

/// Delivery channel.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, job: &Job, content: &RenderedContent) -> DeliveryResult;
}

/// Notifier that writes each delivery as a structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, job: &Job, content: &RenderedContent) -> DeliveryResult {
        info!(
            job_id = %job.id,
            subject = %job.subject,
            key = %content.idempotency_key,
            recipients = ?content.recipients,
            title = %content.title,
            "notification delivered"
        );
        DeliveryResult::Delivered
    }
}
