//! Timing of proxied network transactions.
//!
//! A [`NetworkContext`] follows one inbound request through the service:
//! inbound request, optional outbound call to a backend, the backend's
//! response, and the outbound response. Once complete it becomes one
//! `MobileServerNetworkTransactions` event.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AnalyticsError, AnalyticsResult};
use crate::event::json_kind;

/// Event type of a reported network transaction.
pub const NETWORK_EVENT_TYPE: &str = "MobileServerNetworkTransactions";

/// Timing and metadata of one network transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkContext {
    /// Application the request came from. Required for reporting.
    pub app_id: Option<String>,
    /// Correlation id across services.
    pub global_tracking_id: Option<String>,
    /// URL of the inbound request.
    #[serde(rename = "inboundRequestURL")]
    pub inbound_request_url: String,
    /// URL of the backend call, if one was made.
    #[serde(rename = "outboundRequestURL")]
    pub outbound_request_url: Option<String>,
    /// When the inbound request arrived.
    pub inbound_timestamp: Option<i64>,
    /// When the backend call was sent.
    pub outbound_backend_timestamp: Option<i64>,
    /// When the backend answered.
    pub inbound_backend_timestamp: Option<i64>,
    /// When the response left the service.
    pub outbound_timestamp: Option<i64>,
    /// Device id.
    pub device_id: Option<String>,
    /// Device operating system.
    #[serde(rename = "deviceOS")]
    pub device_os: Option<String>,
    /// Device operating system version.
    #[serde(rename = "deviceOSVersion")]
    pub device_os_version: Option<String>,
    /// Device model.
    pub device_model: Option<String>,
    /// Client application name.
    pub device_app_name: Option<String>,
    /// Client application version.
    pub device_app_version: Option<String>,
}

impl NetworkContext {
    /// Creates a context for an inbound request URL.
    pub fn new(inbound_request_url: impl Into<String>) -> Self {
        Self {
            inbound_request_url: inbound_request_url.into(),
            ..Default::default()
        }
    }

    /// Sets the application id.
    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    /// Sets the global tracking id.
    pub fn with_global_tracking_id(mut self, id: impl Into<String>) -> Self {
        self.global_tracking_id = Some(id.into());
        self
    }

    /// Builds a context from a JSON object with camelCase attributes.
    pub fn from_value(value: Value) -> AnalyticsResult<Self> {
        if !value.is_object() {
            return Err(AnalyticsError::InvalidContext(format!(
                "The type of the context object must be object, it was: {}",
                json_kind(&value)
            )));
        }

        serde_json::from_value(value)
            .map_err(|e| AnalyticsError::InvalidContext(format!("Malformed network context: {}", e)))
    }

    /// Checks the attributes every step needs.
    pub fn validate(&self) -> AnalyticsResult<()> {
        if let Some(id) = &self.global_tracking_id {
            if id.is_empty() {
                return Err(AnalyticsError::InvalidContext(
                    "Missing global tracking id non-zero length string, context.globalTrackingId passed was: "
                        .to_string(),
                ));
            }
        }

        if self.inbound_request_url.is_empty() {
            return Err(AnalyticsError::InvalidContext(
                "Missing inbound request URL non-zero length string, context.inboundRequestURL passed was: "
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Starts a transaction, forgetting any earlier timing.
    pub fn record_inbound_request(&mut self, now: i64) -> AnalyticsResult<()> {
        self.outbound_request_url = None;
        self.inbound_timestamp = Some(now);
        self.outbound_backend_timestamp = None;
        self.inbound_backend_timestamp = None;
        self.outbound_timestamp = None;
        self.validate()
    }

    /// Records the call to a backend.
    pub fn record_outbound_request(&mut self, url: &str, now: i64) -> AnalyticsResult<()> {
        self.validate()?;

        if url.is_empty() {
            return Err(AnalyticsError::InvalidContext(
                "Missing outbound request URL non-zero string, url passed was: ".to_string(),
            ));
        }

        self.outbound_request_url = Some(url.to_string());
        self.outbound_backend_timestamp = Some(now);
        Ok(())
    }

    /// Records the backend's answer.
    pub fn record_inbound_response(&mut self, now: i64) -> AnalyticsResult<()> {
        self.validate()?;
        self.inbound_backend_timestamp = Some(now);
        Ok(())
    }

    /// Records the response leaving the service.
    pub fn record_outbound_response(&mut self, now: i64) -> AnalyticsResult<()> {
        self.validate()?;
        self.outbound_timestamp = Some(now);
        Ok(())
    }

    /// Builds the transaction event.
    ///
    /// Processing times are only present for the legs that were recorded;
    /// device attributes only when non-empty.
    pub fn to_event(&self, service_name: Option<&str>) -> AnalyticsResult<Value> {
        self.validate()?;

        let app_id = self
            .app_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| missing_attribute("appId"))?;
        let inbound = self.inbound_timestamp.ok_or_else(|| missing_attribute("inboundTimestamp"))?;
        let outbound = self
            .outbound_timestamp
            .ok_or_else(|| missing_attribute("outboundTimestamp"))?;

        let mut event = Map::new();
        event.insert("appId".to_string(), app_id.into());
        event.insert(
            "globalTrackingId".to_string(),
            self.global_tracking_id.clone().map_or(Value::Null, Value::String),
        );
        event.insert("inboundRequestURL".to_string(), self.inbound_request_url.clone().into());
        event.insert("inboundTimestamp".to_string(), inbound.into());
        event.insert("outboundTimestamp".to_string(), outbound.into());

        if let Some(url) = self.outbound_request_url.as_deref().filter(|url| !url.is_empty()) {
            event.insert("outboundRequestURL".to_string(), url.into());
        }
        if let Some(sent) = self.outbound_backend_timestamp {
            event.insert("requestProcessingTime".to_string(), sent.saturating_sub(inbound).into());
        }
        if let Some(answered) = self.inbound_backend_timestamp {
            event.insert("responseProcessingTime".to_string(), outbound.saturating_sub(answered).into());
        }

        let device = [
            ("deviceId", &self.device_id),
            ("deviceOS", &self.device_os),
            ("deviceOSVersion", &self.device_os_version),
            ("deviceModel", &self.device_model),
            ("deviceAppName", &self.device_app_name),
            ("deviceAppVersion", &self.device_app_version),
        ];
        for (name, value) in device {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                event.insert(name.to_string(), value.into());
            }
        }

        event.insert("duration".to_string(), outbound.saturating_sub(inbound).into());

        if let Some(service) = service_name {
            event.insert("serviceName".to_string(), service.into());
        }

        Ok(Value::Object(event))
    }
}

fn missing_attribute(name: &str) -> AnalyticsError {
    AnalyticsError::InvalidContext(format!(
        "The AnalyticNetworkContext parameter is missing required attribute: {}",
        name
    ))
}
