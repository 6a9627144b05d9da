use anyhow::Result;

use tactix_infra::WorkerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tactix_observability::init();

    let config = WorkerConfig::from_env()?;
    tracing::info!(config = %serde_json::to_string(&config)?, "starting tactix worker");

    let engine = tactix_worker::build_engine(&config).await?;
    tactix_worker::run(engine, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
        }
    })
    .await
}
