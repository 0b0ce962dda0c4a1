//! Backend transports.
//!
//! The pipeline talks to the search index through one of three transports,
//! chosen once at construction:
//! - [`DirectTransport`]: basic auth, every path under a fixed index prefix
//! - [`ProxyTransport`]: bearer token from a [`TokenProvider`](crate::TokenProvider),
//!   refreshed after a 401
//! - [`LocalTransport`]: an in-memory fake backend that records requests

mod direct;
mod http;
mod local;
mod proxy;

pub use direct::{DirectCredentials, DirectTransport};
pub use local::{fixture_event_types, LocalTransport, RecordedRequest};
pub use proxy::{ProxySettings, ProxyTransport, DEFAULT_PROXY_PATH_PREFIX, DEFAULT_TOKEN_TIMEOUT};
pub use reqwest::Method;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dispatch::Dispatch;
use crate::error::{AnalyticsError, AnalyticsResult};

/// Backend personality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Straight to the index with static credentials.
    Direct,
    /// Through the analytics proxy with a bearer token.
    Proxy,
    /// In-process fake backend.
    Local,
}

/// How a request authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    /// No credentials.
    None,
    /// HTTP basic auth.
    Basic {
        /// User id.
        userid: String,
        /// Password.
        password: String,
    },
    /// Opaque token sent verbatim in the `Authorization` header.
    Token(String),
}

/// A fully resolved request target.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Path component, as requested by the caller after any prefixing.
    pub path: String,
    /// Credentials.
    pub auth: Auth,
    /// Extra headers.
    pub headers: Vec<(String, String)>,
}

impl RequestOptions {
    /// Creates options for an origin and a path.
    pub fn new(method: Method, origin: &str, path: impl Into<String>, auth: Auth) -> Self {
        let path = path.into();
        Self {
            method,
            url: format!("{}{}", origin, path),
            path,
            auth,
            headers: Vec::new(),
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the `Content-Type` header.
    pub fn with_content_type(self, content_type: &str) -> Self {
        self.with_header("Content-Type", content_type)
    }

    /// Gets a header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Status and body of a completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: String,
}

impl TransportResponse {
    /// Creates a response.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Returns the body if the status is `ok` or `alternate`, otherwise a
    /// status error carrying the body.
    pub fn expect(&self, ok: u16, alternate: Option<u16>, description: &str) -> AnalyticsResult<&str> {
        if self.status == ok || Some(self.status) == alternate {
            Ok(&self.body)
        } else {
            Err(AnalyticsError::Status {
                code: self.status,
                description: description.to_string(),
                body: self.body.clone(),
            })
        }
    }

    /// Parses the body as a JSON object.
    pub fn json_object(&self, what: &str) -> AnalyticsResult<Map<String, Value>> {
        match serde_json::from_str::<Value>(&self.body) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(AnalyticsError::Serialization(format!(
                "Error parsing {}: expected a JSON object",
                what
            ))),
            Err(err) => Err(AnalyticsError::Serialization(format!(
                "Error parsing {}: {}",
                what, err
            ))),
        }
    }
}

/// Uniform request interface over the backend personalities.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Returns the backend personality.
    fn mode(&self) -> TransportMode;

    /// Builds request options for a path, with the current credentials.
    ///
    /// Options capture the credential at build time; build them again after
    /// a refresh.
    fn request_options(&self, method: Method, path: &str) -> RequestOptions;

    /// Sends a request and collects the whole response.
    async fn request(&self, options: RequestOptions, body: Option<String>) -> AnalyticsResult<TransportResponse>;

    /// Sends a request without a body.
    async fn get(&self, options: RequestOptions) -> AnalyticsResult<TransportResponse> {
        self.request(options, None).await
    }

    /// Fetches the event type mapping: `{type: {properties: {..}}}`.
    async fn load_event_types(&self) -> AnalyticsResult<Map<String, Value>>;

    /// Returns the path a dispatch is posted to.
    fn events_path(&self, dispatch: &Dispatch) -> String {
        dispatch.relative_path()
    }

    /// Replaces the credential after a 401.
    ///
    /// Returns `true` if a new credential is in place and a replay is
    /// worthwhile.
    async fn refresh_credential(&self) -> AnalyticsResult<bool> {
        Ok(false)
    }

    /// Performs mode-specific startup work.
    async fn prepare(&self) -> AnalyticsResult<()> {
        Ok(())
    }

    /// Releases mode-specific resources.
    async fn shutdown(&self) {}
}
