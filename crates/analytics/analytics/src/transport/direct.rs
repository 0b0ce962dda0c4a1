use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::http::{origin, HttpClient};
use super::{Auth, Method, RequestOptions, Transport, TransportMode, TransportResponse};
use crate::error::{AnalyticsError, AnalyticsResult};

/// Credentials of a directly bound search index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectCredentials {
    /// Index URL; its path names the index, e.g. `https://host:9200/analytics`.
    pub url: String,
    /// Basic auth user id.
    pub userid: String,
    /// Basic auth password.
    pub password: String,
}

impl DirectCredentials {
    /// Finds search service credentials in a `VCAP_SERVICES` document.
    ///
    /// The first service whose key starts with `AESearch` wins; its first
    /// instance must carry a `credentials` object.
    pub fn from_vcap_services(vcap: &str) -> AnalyticsResult<Option<Self>> {
        let services: Map<String, Value> = serde_json::from_str(vcap)
            .map_err(|e| AnalyticsError::Config(format!("VCAP_SERVICES is not valid JSON: {}", e)))?;

        let Some(credentials) = services
            .iter()
            .filter(|(key, _)| key.starts_with("AESearch"))
            .find_map(|(_, instances)| instances.get(0)?.get("credentials"))
        else {
            return Ok(None);
        };

        tracing::info!("Bound to the analytics search service; using direct index mode");

        serde_json::from_value(credentials.clone())
            .map(Some)
            .map_err(|e| AnalyticsError::Config(format!("Malformed search service credentials: {}", e)))
    }
}

/// Transport posting straight to the index with basic auth.
pub struct DirectTransport {
    http: HttpClient,
    origin: String,
    index_prefix: String,
    index_name: String,
    userid: String,
    password: String,
}

impl DirectTransport {
    /// Creates a transport for the given credentials.
    pub fn new(credentials: &DirectCredentials) -> AnalyticsResult<Self> {
        let url = reqwest::Url::parse(&credentials.url).map_err(|_| {
            AnalyticsError::Config(format!("Index URL is not valid: {}", credentials.url))
        })?;

        if url.host_str().is_none() {
            return Err(AnalyticsError::Config(format!(
                "Index URL is not valid: {}",
                credentials.url
            )));
        }

        let index_prefix = url.path().trim_end_matches('/').to_string();
        let index_name = index_prefix
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();

        if index_name.is_empty() {
            return Err(AnalyticsError::Config(format!(
                "Index URL does not name an index: {}",
                credentials.url
            )));
        }

        Ok(Self {
            http: HttpClient::new()?,
            origin: origin(&url),
            index_prefix,
            index_name,
            userid: credentials.userid.clone(),
            password: credentials.password.clone(),
        })
    }

    /// Returns the index name.
    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    /// Returns the path prefix every request lives under.
    pub fn index_prefix(&self) -> &str {
        &self.index_prefix
    }
}

#[async_trait]
impl Transport for DirectTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Direct
    }

    fn request_options(&self, method: Method, path: &str) -> RequestOptions {
        RequestOptions::new(
            method,
            &self.origin,
            format!("{}{}", self.index_prefix, path),
            Auth::Basic {
                userid: self.userid.clone(),
                password: self.password.clone(),
            },
        )
    }

    async fn request(&self, options: RequestOptions, body: Option<String>) -> AnalyticsResult<TransportResponse> {
        self.http.send(options, body).await
    }

    async fn load_event_types(&self) -> AnalyticsResult<Map<String, Value>> {
        let options = self.request_options(Method::GET, "/_mapping");
        let response = self
            .get(options)
            .await
            .map_err(|e| e.context("Error getting event types: "))?;
        response.expect(200, None, "getting event types")?;

        let mut document = response.json_object("GET event types response")?;

        match document
            .remove(&self.index_name)
            .and_then(|mut index| index.get_mut("mappings").map(Value::take))
        {
            Some(Value::Object(mappings)) => Ok(mappings),
            _ => Err(AnalyticsError::Serialization(format!(
                "GET event types response does not contain mappings for index: {}",
                self.index_name
            ))),
        }
    }
}
