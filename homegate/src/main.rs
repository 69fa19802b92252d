use std::path::PathBuf;

use tracing::info;

use homegate::{Coordinator, HomegateConfig};

const DEFAULT_CONFIG_PATH: &str = "/etc/homegate/config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,homegate=debug".parse().unwrap()),
        )
        .init();

    info!("homegate starting...");

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = HomegateConfig::load(&config_path)?;

    let coordinator = Coordinator::new(&config)?;
    coordinator.start().await;

    info!("homegate started successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    coordinator.stop().await;

    Ok(())
}
