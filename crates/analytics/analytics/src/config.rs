//! Pipeline configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::DEFAULT_MIN_BATCH;
use crate::error::{AnalyticsError, AnalyticsResult};
use crate::transport::{DirectCredentials, ProxySettings, TransportMode};

/// Set to `no` to disable the pipeline.
pub const ENV_ENABLE: &str = "ENABLE_ANALYTICS_SDK";
/// When set, lifecycle signals are sent to subscribers.
pub const ENV_INTERNAL_SIGNALS: &str = "TESTONLY_EMIT_INTERNAL_EVENTS";
/// Replaces the derived proxy URL.
pub const ENV_PROXY_URL_OVERRIDE: &str = "ANALYTICS_PROXY_URL_OVERRIDE";
/// Cloud service bindings, searched for direct index credentials.
pub const ENV_VCAP_SERVICES: &str = "VCAP_SERVICES";

/// Analytics pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Whether events are collected at all.
    pub enabled: bool,
    /// Use the in-process fake backend.
    pub local_mode: bool,
    /// Flush timer period.
    pub report_event_interval_ms: u64,
    /// Delay between failed event type loads.
    pub schema_retry_ms: u64,
    /// Below this many events a flush may be deferred once.
    pub min_batch: usize,
    /// Added to network transaction events as `serviceName`.
    pub service_name: Option<String>,
    /// Send lifecycle signals to subscribers.
    pub emit_internal_signals: bool,
    /// Proxy mode settings.
    pub proxy: Option<ProxySettings>,
    /// Direct index credentials.
    pub direct: Option<DirectCredentials>,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            local_mode: false,
            report_event_interval_ms: 2500,
            schema_retry_ms: 2000,
            min_batch: DEFAULT_MIN_BATCH,
            service_name: None,
            emit_internal_signals: false,
            proxy: None,
            direct: None,
        }
    }
}

impl AnalyticsConfig {
    /// Creates a configuration for the in-process backend.
    pub fn local() -> Self {
        Self {
            local_mode: true,
            ..Default::default()
        }
    }

    /// Parses a TOML document.
    pub fn from_toml(source: &str) -> AnalyticsResult<Self> {
        toml::from_str(source).map_err(|e| AnalyticsError::Config(format!("Invalid analytics configuration: {}", e)))
    }

    /// Applies the process environment on top of the file settings.
    pub fn with_env(self) -> AnalyticsResult<Self> {
        self.with_env_from(|name| std::env::var(name).ok())
    }

    /// Applies environment settings read through `lookup`.
    pub fn with_env_from<F>(mut self, lookup: F) -> AnalyticsResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if lookup(ENV_ENABLE).is_some_and(|value| value == "no") {
            self.enabled = false;
        }

        if lookup(ENV_INTERNAL_SIGNALS).is_some_and(|value| !value.is_empty()) {
            self.emit_internal_signals = true;
        }

        if let (Some(proxy), Some(url)) = (self.proxy.as_mut(), lookup(ENV_PROXY_URL_OVERRIDE)) {
            if !url.is_empty() {
                proxy.proxy_url_override = Some(url);
            }
        }

        if self.direct.is_none() && !self.local_mode {
            if let Some(vcap) = lookup(ENV_VCAP_SERVICES) {
                self.direct = DirectCredentials::from_vcap_services(&vcap)?;
            }
        }

        Ok(self)
    }

    /// Picks the backend personality.
    ///
    /// Local mode wins, then direct credentials; proxy mode is the fallback
    /// and requires proxy settings.
    pub fn mode(&self) -> AnalyticsResult<TransportMode> {
        if self.local_mode {
            Ok(TransportMode::Local)
        } else if self.direct.is_some() {
            Ok(TransportMode::Direct)
        } else if self.proxy.is_some() {
            Ok(TransportMode::Proxy)
        } else {
            Err(AnalyticsError::Config(
                "Missing required setting: proxy.app_id".to_string(),
            ))
        }
    }

    /// Returns the flush timer period.
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_event_interval_ms)
    }

    /// Returns the delay between failed event type loads.
    pub fn schema_retry(&self) -> Duration {
        Duration::from_millis(self.schema_retry_ms)
    }
}
