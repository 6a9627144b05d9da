//! `tactix-tasks`: task-side vocabulary consumed by the scheduling engine.
//!
//! The CRUD service owns tasks; this crate only models what the engine needs
//! to know about them: priority and status enums, the snapshot used to
//! re-validate a job before delivery, and the scheduling intents that task
//! mutations emit.

pub mod intent;
pub mod task;

pub use intent::SchedulingIntent;
pub use task::{SubjectState, TaskPriority, TaskStatus};
