//! Subject lookups used to re-validate jobs right before delivery.
//!
//! The dispatcher asks the directory for the subject's *current* state; the
//! CRUD store may have completed, deleted or rescheduled the task since the
//! job was written.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tactix_core::SubjectRef;
use tactix_tasks::SubjectState;

pub mod postgres;

pub use postgres::PgTaskDirectory;

/// Read-only view of the external task store.
#[async_trait::async_trait]
pub trait SubjectDirectory: Send + Sync {
    /// Current state of `subject`, or `None` when it no longer exists.
    async fn subject_state(
        &self,
        subject: &SubjectRef,
    ) -> Result<Option<SubjectState>, DirectoryError>;
}

/// Directory lookup error. Always treated as retryable by the dispatcher.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DirectoryError {
    #[error("subject lookup failed: {0}")]
    Unavailable(String),
    #[error("subject {subject} has unreadable state: {reason}")]
    Corrupt { subject: SubjectRef, reason: String },
}

/// In-memory directory for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySubjectDirectory {
    subjects: RwLock<HashMap<SubjectRef, SubjectState>>,
}

impl InMemorySubjectDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, subject: SubjectRef, state: SubjectState) {
        self.subjects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subject, state);
    }

    pub fn remove(&self, subject: &SubjectRef) -> Option<SubjectState> {
        self.subjects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(subject)
    }
}

#[async_trait::async_trait]
impl SubjectDirectory for InMemorySubjectDirectory {
    async fn subject_state(
        &self,
        subject: &SubjectRef,
    ) -> Result<Option<SubjectState>, DirectoryError> {
        Ok(self
            .subjects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subject)
            .cloned())
    }
}
