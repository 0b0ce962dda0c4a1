//! Host configuration.

use std::path::Path;

use beacon_analytics::AnalyticsConfig;
use serde::{Deserialize, Serialize};

/// Host-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Log level, used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Bearer token handed to the analytics proxy.
    pub access_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            access_token: None,
        }
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    /// `[server]` table.
    pub server: ServerConfig,
    /// `[analytics]` table.
    pub analytics: AnalyticsConfig,
}

/// Parses configuration from TOML.
pub fn parse_config(content: &str) -> Result<BeaconConfig, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Loads configuration from a TOML file. A missing file yields the defaults.
pub fn load_config(path: impl AsRef<Path>) -> Result<BeaconConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(BeaconConfig::default());
    }

    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
    parse_config(&content)
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BeaconConfig::default();
        assert_eq!(config.server.log_level, "info");
        assert!(config.analytics.enabled);
    }

    #[test]
    fn test_parse_tables() {
        let config = parse_config(
            r#"
            [server]
            log_level = "debug"

            [analytics]
            local_mode = true
            report_event_interval_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.server.log_level, "debug");
        assert!(config.analytics.local_mode);
        assert_eq!(config.analytics.report_event_interval_ms, 500);
        assert_eq!(config.analytics.min_batch, 10);
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            parse_config("[server]\nlog_level = 3"),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = load_config("/nonexistent/beacon.toml").unwrap();
        assert_eq!(config.server.log_level, "info");
    }
}
