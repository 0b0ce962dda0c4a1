//! Beacon server binary.

use beacon_server::{load_config, log_signals, start_emitter, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = load_config(&path)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.server.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(config = %path, "Starting beacon server");

    let emitter = start_emitter(&config);
    let signals = tokio::spawn(log_signals(emitter.subscribe()));

    tokio::signal::ctrl_c().await?;

    tracing::info!(buffered = emitter.buffered_len(), "Shutting down");
    emitter.shutdown().await;
    signals.abort();

    Ok(())
}
