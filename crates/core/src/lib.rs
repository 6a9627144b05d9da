//! `tactix-core`: shared building blocks for the scheduling engine.
//!
//! This crate contains **pure** primitives (no infrastructure concerns):
//! identifiers, the domain error model and the clock abstraction every timing
//! decision reads from.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::DomainError;
pub use id::{JobId, SubjectRef};
