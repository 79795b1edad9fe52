use std::sync::Arc;

use anyhow::Context;

use waypost_infra::{EngineConfig, LoggingProvider};
use waypost_worker::app::audit_pipeline;
use waypost_worker::{build_engine, build_scheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    waypost_observability::init();

    let config = EngineConfig::from_env();
    let provider = Arc::new(LoggingProvider::new(config.billing.provider_name.clone()));
    let (audit, audit_consumer) = audit_pipeline();

    let engine = build_engine(config, provider, audit).await?;
    let scheduler = build_scheduler(&engine)?.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!(status = ?scheduler.status(), "shutdown requested");

    scheduler.shutdown().await;
    drop(engine);
    if audit_consumer.join().is_err() {
        tracing::warn!("audit consumer panicked");
    }
    Ok(())
}
