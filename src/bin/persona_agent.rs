use anyhow::{Context, Result};
use persona_agent::config::AgentConfig;
use persona_agent::runtime::AgentRuntime;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,persona_agent=debug")),
        )
        .init();

    let config = AgentConfig::load();
    let runtime = AgentRuntime::bootstrap(config)
        .await
        .context("failed to bootstrap agent runtime")?;

    tracing::info!(
        "Session worker {} running orphan recovery every {}s (stale after {}s); Ctrl-C to stop",
        runtime.config.server_id,
        runtime.config.recovery_sweep_interval().as_secs(),
        runtime.config.stale_after().as_secs()
    );

    let sweep = runtime.spawn_recovery_sweep();
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("Shutting down");
    sweep.stop().await;
    Ok(())
}
