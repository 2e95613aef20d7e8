use anyhow::Context;
use sw_controller::{service, ServiceConfig};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args_os().nth(1).map(std::path::PathBuf::from);
    let config = ServiceConfig::load(path.as_deref()).context("loading sweeper configuration")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    service::run(config, shutdown_rx).await?;
    Ok(())
}
