use tactix_tasks::SubjectState;

use crate::jobs::{Job, JobKind, Priority};

use super::{RenderedContent, Renderer};

/// Plain-text renderer. Recipients are the subject's current assignees; the
/// title carries the higher of the job's and the task's current priority.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainRenderer;

impl Renderer for PlainRenderer {
    fn render(&self, job: &Job, subject: &SubjectState) -> RenderedContent {
        let deadline = subject
            .deadline
            .map(|d| d.format("%Y-%m-%d %H:%M UTC").to_string());

        let (title, body) = match job.kind {
            JobKind::DeadlineReminder => (
                format!("Deadline reached for {}", job.subject),
                format!(
                    "{} was due at {}.",
                    job.subject,
                    deadline.as_deref().unwrap_or("an unknown time")
                ),
            ),
            JobKind::DueSoonReminder => (
                format!("{} is due soon", job.subject),
                format!(
                    "{} is due at {}.",
                    job.subject,
                    deadline.as_deref().unwrap_or("an unknown time")
                ),
            ),
            JobKind::RecurringDigest => (
                format!("Digest for {}", job.subject),
                match deadline {
                    Some(d) => format!("{} is still open, due {}.", job.subject, d),
                    None => format!("{} is still open with no deadline.", job.subject),
                },
            ),
        };

        // The task may have been escalated since the job was scheduled.
        let title = match job.priority.max(subject.priority.into()) {
            Priority::Urgent => format!("[URGENT] {title}"),
            Priority::High => format!("[HIGH] {title}"),
            Priority::Normal | Priority::Low => title,
        };

        RenderedContent {
            title,
            body,
            recipients: subject.assignees.clone(),
            idempotency_key: job.idempotency_key.clone(),
        }
    }
}
