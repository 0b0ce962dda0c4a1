//! Shared reqwest executor for the network transports.

use std::time::Duration;

use reqwest::Client;

use super::{Auth, RequestOptions, TransportResponse};
use crate::error::{AnalyticsError, AnalyticsResult};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Default connection timeout in seconds.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

pub(crate) struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub(crate) fn new() -> AnalyticsResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| AnalyticsError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    pub(crate) async fn send(
        &self,
        options: RequestOptions,
        body: Option<String>,
    ) -> AnalyticsResult<TransportResponse> {
        let mut request = self.client.request(options.method.clone(), &options.url);

        request = match &options.auth {
            Auth::None => request,
            Auth::Basic { userid, password } => request.basic_auth(userid, Some(password)),
            Auth::Token(token) => request.header("Authorization", token),
        };

        for (name, value) in &options.headers {
            request = request.header(name, value);
        }

        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        tracing::debug!(
            method = %options.method,
            path = %options.path,
            status,
            "Backend responded"
        );

        Ok(TransportResponse { status, body })
    }
}

/// Returns `scheme://host[:port]` for a URL.
pub(crate) fn origin(url: &reqwest::Url) -> String {
    url.origin().ascii_serialization()
}
