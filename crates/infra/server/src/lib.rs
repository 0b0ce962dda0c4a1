//! # Beacon Server
//!
//! Host process for the analytics pipeline: loads the configuration file,
//! starts the emitter, and logs its operational signals.

mod config;

pub use config::{load_config, parse_config, BeaconConfig, ConfigError, ServerConfig};

use std::sync::Arc;

use beacon_analytics::{AnalyticsEmitter, AnalyticsSignal, StaticTokenProvider};
use tokio::sync::broadcast;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "BEACON_CONFIG";
/// Configuration file used when the variable is unset.
pub const DEFAULT_CONFIG_PATH: &str = "beacon.toml";

/// Starts the analytics emitter described by the configuration.
///
/// Configuration problems never stop the host: they are logged and a
/// disabled emitter is returned.
pub fn start_emitter(config: &BeaconConfig) -> AnalyticsEmitter {
    let analytics = match config.analytics.clone().with_env() {
        Ok(analytics) => analytics,
        Err(err) => {
            tracing::error!("Analytics configuration error: {}", err);
            return AnalyticsEmitter::disabled();
        }
    };

    let mut builder = AnalyticsEmitter::builder(analytics);
    if let Some(token) = &config.server.access_token {
        builder = builder.token_provider(Arc::new(StaticTokenProvider::new(token.clone())));
    }

    builder.build().unwrap_or_else(|_| AnalyticsEmitter::disabled())
}

/// Logs signals until the channel closes.
pub async fn log_signals(mut signals: broadcast::Receiver<AnalyticsSignal>) {
    loop {
        match signals.recv().await {
            // Errors are already logged by the pipeline.
            Ok(AnalyticsSignal::Error(_)) => {}
            Ok(signal) => tracing::info!(?signal, "Analytics signal"),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Analytics signal subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_proxy_without_token_falls_back_to_disabled() {
        let config = parse_config(
            r#"
            [analytics.proxy]
            app_id = "app-1"
            server_url = "https://auth.example.net"
            "#,
        )
        .unwrap();

        let emitter = start_emitter(&config);
        assert!(!emitter.is_enabled());
    }

    #[tokio::test]
    async fn test_local_mode_starts() {
        let config = parse_config("[analytics]\nlocal_mode = true").unwrap();

        let emitter = start_emitter(&config);
        assert!(emitter.is_enabled());
        emitter.shutdown().await;
    }
}
