//! Standalone reminder worker: wires the durable job store, the task
//! directory and a notifier into a running engine.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use tactix_core::SystemClock;
use tactix_infra::WorkerConfig;
use tactix_infra::directory::{PgTaskDirectory, SubjectDirectory};
use tactix_infra::jobs::{EngineParts, NotificationEngine, SqliteJobStore};
use tactix_infra::notify::{LogNotifier, PlainRenderer};

/// Connect every backend named in `config` and build the engine.
///
/// A worker without a tasks database cannot re-validate anything, so that
/// URL is required here.
pub async fn build_engine(config: &WorkerConfig) -> Result<NotificationEngine> {
    let store = SqliteJobStore::connect(&config.jobs_database_url)
        .await
        .with_context(|| format!("opening job store at {}", config.jobs_database_url))?;

    let tasks_url = config
        .tasks_database_url
        .as_deref()
        .context("TACTIX_TASKS_DATABASE_URL must be set")?;
    let directory: Arc<dyn SubjectDirectory> = Arc::new(
        PgTaskDirectory::connect(tasks_url)
            .await
            .context("connecting to the tasks database")?,
    );

    Ok(engine_with(config, Arc::new(store), directory))
}

/// Assemble an engine over already-connected backends.
pub fn engine_with(
    config: &WorkerConfig,
    store: Arc<SqliteJobStore>,
    directory: Arc<dyn SubjectDirectory>,
) -> NotificationEngine {
    NotificationEngine::new(
        config.engine.clone(),
        EngineParts {
            store,
            directory,
            renderer: Arc::new(PlainRenderer),
            notifier: Arc::new(LogNotifier),
            clock: Arc::new(SystemClock),
        },
    )
}

/// Recover abandoned claims, then run until `shutdown` resolves.
pub async fn run(
    engine: NotificationEngine,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    let recovered = engine.recover().await.context("startup recovery")?;
    info!(recovered, "startup recovery complete");

    let handle = Arc::new(engine).spawn();
    shutdown.await;

    info!("shutdown requested");
    let stats = handle.stats();
    handle.shutdown().await.context("stopping engine")?;
    info!(
        delivered = stats.delivered,
        retried = stats.retried,
        failed = stats.failed,
        cancelled = stats.cancelled,
        "worker stopped"
    );
    Ok(())
}
