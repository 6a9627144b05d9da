//! Scheduling intents emitted by task mutations.
//!
//! The CRUD layer does not talk to the job store directly: whenever a task's
//! deadline, priority or existence changes it emits one of these, and the
//! engine translates it into job-store operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tactix_core::SubjectRef;

use crate::task::TaskPriority;

/// Deadline or priority of a subject changed. `deadline: None` means the
/// deadline was cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlineChanged {
    pub subject: SubjectRef,
    pub deadline: Option<DateTime<Utc>>,
    pub priority: TaskPriority,
}

/// The subject was deleted, or no longer warrants reminders (e.g. completed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectRemoved {
    pub subject: SubjectRef,
}

/// A recurring digest should run for the subject every `every_secs`,
/// starting at `first_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestRequested {
    pub subject: SubjectRef,
    pub first_at: DateTime<Utc>,
    pub every_secs: u64,
    pub priority: TaskPriority,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulingIntent {
    DeadlineChanged(DeadlineChanged),
    SubjectRemoved(SubjectRemoved),
    DigestRequested(DigestRequested),
}

impl SchedulingIntent {
    pub fn deadline_changed(
        subject: SubjectRef,
        deadline: Option<DateTime<Utc>>,
        priority: TaskPriority,
    ) -> Self {
        Self::DeadlineChanged(DeadlineChanged {
            subject,
            deadline,
            priority,
        })
    }

    pub fn subject_removed(subject: SubjectRef) -> Self {
        Self::SubjectRemoved(SubjectRemoved { subject })
    }

    pub fn subject(&self) -> &SubjectRef {
        match self {
            SchedulingIntent::DeadlineChanged(i) => &i.subject,
            SchedulingIntent::SubjectRemoved(i) => &i.subject,
            SchedulingIntent::DigestRequested(i) => &i.subject,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn intents_serialize_with_type_tag() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let intent =
            SchedulingIntent::deadline_changed(SubjectRef::task(9), Some(at), TaskPriority::High);

        let json = serde_json::to_value(&intent).unwrap();
        assert_eq!(json["type"], "deadline_changed");
        assert_eq!(json["subject"], "task:9");
        assert_eq!(json["priority"], "high");

        let back: SchedulingIntent = serde_json::from_value(json).unwrap();
        assert_eq!(back, intent);
    }

    #[test]
    fn subject_accessor_covers_every_variant() {
        let subject = SubjectRef::task(3);
        let removed = SchedulingIntent::subject_removed(subject.clone());
        assert_eq!(removed.subject(), &subject);
    }
}
