//! Infrastructure layer: job store, scheduling, dispatch and delivery.

pub mod config;
pub mod directory;
pub mod jobs;
pub mod notify;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, EngineConfig, WorkerConfig};
pub use jobs::{EngineHandle, EngineParts, NotificationEngine};
