use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::http::{origin, HttpClient};
use super::{Auth, Method, RequestOptions, Transport, TransportMode, TransportResponse};
use crate::dispatch::Dispatch;
use crate::error::{AnalyticsError, AnalyticsResult};
use crate::token::TokenProvider;

/// Path prefix the proxy API lives under.
pub const DEFAULT_PROXY_PATH_PREFIX: &str = "/imfmobileanalytics";

/// How long a token provider may take before the fetch is abandoned.
pub const DEFAULT_TOKEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Host label of the analytics proxy inside the authorization server's domain.
const PROXY_HOST_LABEL: &str = "imfmobileanalytics";

/// Settings for proxy mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Application id the events are filed under.
    pub app_id: String,
    /// URL of the authorization server; the proxy lives in the same domain.
    pub server_url: String,
    /// Full proxy URL, bypassing the domain derivation.
    #[serde(default)]
    pub proxy_url_override: Option<String>,
    /// Path prefix in front of `/proxy/v1`.
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
}

fn default_path_prefix() -> String {
    DEFAULT_PROXY_PATH_PREFIX.to_string()
}

impl ProxySettings {
    /// Creates settings with the default path prefix and no override.
    pub fn new(app_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            server_url: server_url.into(),
            proxy_url_override: None,
            path_prefix: default_path_prefix(),
        }
    }

    /// Sets the proxy URL override.
    pub fn with_proxy_url(mut self, url: impl Into<String>) -> Self {
        self.proxy_url_override = Some(url.into());
        self
    }

    /// Resolves the proxy URL.
    ///
    /// Without an override the proxy is `https://imfmobileanalytics.<domain>`,
    /// where the domain is the authorization server's host minus its first
    /// label.
    pub fn proxy_url(&self) -> AnalyticsResult<String> {
        if self.app_id.is_empty() {
            return Err(AnalyticsError::Config(
                "Missing required setting: proxy.app_id".to_string(),
            ));
        }
        if self.server_url.is_empty() {
            return Err(AnalyticsError::Config(
                "Missing required setting: proxy.server_url".to_string(),
            ));
        }

        let server = reqwest::Url::parse(&self.server_url).ok();
        let Some(host) = server.as_ref().and_then(|url| url.host_str()) else {
            return Err(AnalyticsError::Config(format!(
                "proxy.server_url is not set to a valid URL: {}",
                self.server_url
            )));
        };

        if let Some(url) = &self.proxy_url_override {
            return Ok(url.clone());
        }

        match host.split_once('.') {
            Some((label, domain)) if !label.is_empty() && !domain.is_empty() => {
                Ok(format!("https://{}.{}", PROXY_HOST_LABEL, domain))
            }
            _ => Err(AnalyticsError::Config(format!(
                "Unable to extract domain from proxy.server_url: {}",
                self.server_url
            ))),
        }
    }
}

/// Transport posting through the analytics proxy with a bearer token.
pub struct ProxyTransport {
    http: HttpClient,
    origin: String,
    root: String,
    app_id: String,
    provider: Arc<dyn TokenProvider>,
    token: RwLock<Option<String>>,
    token_timeout: Duration,
}

impl ProxyTransport {
    /// Creates a transport. No token is fetched until [`Transport::prepare`].
    pub fn new(settings: &ProxySettings, provider: Arc<dyn TokenProvider>) -> AnalyticsResult<Self> {
        let proxy_url = settings.proxy_url()?;
        let url = reqwest::Url::parse(&proxy_url)
            .map_err(|_| AnalyticsError::Config(format!("Proxy URL is not valid: {}", proxy_url)))?;

        tracing::info!(host = ?url.host_str(), "Using analytics proxy");

        Ok(Self {
            http: HttpClient::new()?,
            origin: origin(&url),
            root: format!("{}/proxy/v1", settings.path_prefix.trim_end_matches('/')),
            app_id: settings.app_id.clone(),
            provider,
            token: RwLock::new(None),
            token_timeout: DEFAULT_TOKEN_TIMEOUT,
        })
    }

    /// Sets how long a token fetch may take.
    pub fn with_token_timeout(mut self, timeout: Duration) -> Self {
        self.token_timeout = timeout;
        self
    }

    /// Returns the current token, if one was obtained.
    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    async fn fetch_token(&self) -> AnalyticsResult<()> {
        let token = tokio::time::timeout(self.token_timeout, self.provider.fetch_token())
            .await
            .map_err(|_| {
                AnalyticsError::Token(format!(
                    "token provider did not answer within {}ms",
                    self.token_timeout.as_millis()
                ))
            })??;
        *self.token.write() = Some(token);
        Ok(())
    }
}

#[async_trait]
impl Transport for ProxyTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Proxy
    }

    fn request_options(&self, method: Method, path: &str) -> RequestOptions {
        let auth = match self.token() {
            Some(token) => Auth::Token(token),
            None => Auth::None,
        };
        RequestOptions::new(method, &self.origin, path, auth)
    }

    async fn request(&self, options: RequestOptions, body: Option<String>) -> AnalyticsResult<TransportResponse> {
        self.http.send(options, body).await
    }

    async fn load_event_types(&self) -> AnalyticsResult<Map<String, Value>> {
        let options = self.request_options(Method::GET, &format!("{}/eventtypes", self.root));
        let response = self
            .get(options)
            .await
            .map_err(|e| e.context("Error getting event types: "))?;
        response.expect(200, None, "getting event types")?;
        response.json_object("GET event types response")
    }

    fn events_path(&self, dispatch: &Dispatch) -> String {
        format!("{}/apps/{}{}", self.root, self.app_id, dispatch.relative_path())
    }

    async fn refresh_credential(&self) -> AnalyticsResult<bool> {
        self.fetch_token().await.map_err(|e| {
            AnalyticsError::Token(format!("Unable to refresh access token from token provider: {}", e))
        })?;
        tracing::debug!("Refreshed proxy access token");
        Ok(true)
    }

    async fn prepare(&self) -> AnalyticsResult<()> {
        self.fetch_token().await.map_err(|e| {
            AnalyticsError::Token(format!("Unable to get initial access token from token provider: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::StaticTokenProvider;
    use serde_json::json;

    #[test]
    fn test_proxy_url_from_server_domain() {
        let settings = ProxySettings::new("app-1", "https://auth.eu-gb.example.net/oauth");
        assert_eq!(settings.proxy_url().unwrap(), "https://imfmobileanalytics.eu-gb.example.net");
    }

    #[test]
    fn test_proxy_url_override_wins() {
        let settings = ProxySettings::new("app-1", "https://auth.example.net").with_proxy_url("http://localhost:9000");
        assert_eq!(settings.proxy_url().unwrap(), "http://localhost:9000");
    }

    #[test]
    fn test_proxy_settings_validation() {
        let missing_app = ProxySettings::new("", "https://auth.example.net");
        assert_eq!(
            missing_app.proxy_url().unwrap_err().to_string(),
            "Missing required setting: proxy.app_id"
        );

        let bad_url = ProxySettings::new("app", "nonsense");
        assert!(bad_url.proxy_url().unwrap_err().to_string().contains("not set to a valid URL"));

        let no_domain = ProxySettings::new("app", "https://localhost");
        assert!(no_domain.proxy_url().unwrap_err().to_string().contains("Unable to extract domain"));
    }

    #[tokio::test]
    async fn test_token_lifecycle() {
        let provider = Arc::new(StaticTokenProvider::sequence(["t1", "t2"]));
        let transport = ProxyTransport::new(
            &ProxySettings::new("app-1", "https://auth.example.net"),
            provider.clone(),
        )
        .unwrap();

        assert_eq!(transport.request_options(Method::GET, "/x").auth, Auth::None);

        transport.prepare().await.unwrap();
        assert_eq!(
            transport.request_options(Method::GET, "/x").auth,
            Auth::Token("t1".to_string())
        );

        assert!(transport.refresh_credential().await.unwrap());
        assert_eq!(transport.token().as_deref(), Some("t2"));
        assert_eq!(provider.calls(), 2);
    }

    struct HangingProvider;

    #[async_trait]
    impl TokenProvider for HangingProvider {
        async fn fetch_token(&self) -> AnalyticsResult<String> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_provider_times_out() {
        let transport = ProxyTransport::new(
            &ProxySettings::new("app-1", "https://auth.example.net"),
            Arc::new(HangingProvider),
        )
        .unwrap()
        .with_token_timeout(Duration::from_secs(5));

        let err = transport.prepare().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unable to get initial access token from token provider: token provider did not answer within 5000ms"
        );

        let err = transport.refresh_credential().await.unwrap_err();
        assert!(err.to_string().starts_with("Unable to refresh access token from token provider: "));
        assert_eq!(transport.token(), None);
    }

    #[test]
    fn test_events_path_is_namespaced_by_app() {
        let transport = ProxyTransport::new(
            &ProxySettings::new("app-1", "https://auth.example.net"),
            Arc::new(StaticTokenProvider::new("t")),
        )
        .unwrap();

        let single = Dispatch::from_buckets(vec![crate::buffer::TypeBucket {
            event_type: "Bob".to_string(),
            events: vec![json!({"a": 1}).as_object().cloned().unwrap()],
        }])
        .unwrap();

        assert_eq!(
            transport.events_path(&single),
            "/imfmobileanalytics/proxy/v1/apps/app-1/Bob"
        );
        assert_eq!(
            transport.request_options(Method::POST, "/p").url,
            "https://imfmobileanalytics.example.net/p"
        );
    }

    mod delivery {
        use super::*;
        use crate::dispatch::deliver;
        use crate::signal::SignalHub;
        use httpmock::prelude::*;

        const EVENTS_PATH: &str = "/imfmobileanalytics/proxy/v1/apps/app-1/Bob";

        fn transport(server: &MockServer, provider: Arc<StaticTokenProvider>) -> ProxyTransport {
            let settings = ProxySettings::new("app-1", "https://auth.example.net").with_proxy_url(server.base_url());
            ProxyTransport::new(&settings, provider).unwrap()
        }

        fn single() -> Dispatch {
            Dispatch::from_buckets(vec![crate::buffer::TypeBucket {
                event_type: "Bob".to_string(),
                events: vec![json!({"a": 1}).as_object().cloned().unwrap()],
            }])
            .unwrap()
        }

        #[tokio::test]
        async fn test_unauthorized_refreshes_and_replays_once() {
            let server = MockServer::start_async().await;
            let stale = server
                .mock_async(|when, then| {
                    when.method(POST).path(EVENTS_PATH).header("authorization", "t1");
                    then.status(401).body("expired");
                })
                .await;
            let fresh = server
                .mock_async(|when, then| {
                    when.method(POST)
                        .path(EVENTS_PATH)
                        .header("authorization", "t2")
                        .body(r#"{"a":1}"#);
                    then.status(201);
                })
                .await;

            let provider = Arc::new(StaticTokenProvider::sequence(["t1", "t2"]));
            let transport = transport(&server, provider.clone());
            transport.prepare().await.unwrap();
            let signals = SignalHub::new(false);
            let mut rx = signals.subscribe();

            let report = deliver(&transport, &single(), &signals).await;

            assert_eq!(
                rx.try_recv().unwrap(),
                crate::signal::AnalyticsSignal::Error("Got statusCode 401 after posting events.\nexpired".to_string())
            );
            assert!(rx.try_recv().is_err());
            stale.assert_async().await;
            fresh.assert_async().await;
            assert!(report.delivered);
            assert_eq!(report.attempts, 2);
            assert_eq!(report.errors.len(), 1);
            assert_eq!(report.errors[0].status_code(), Some(401));
            assert_eq!(provider.calls(), 2);
        }

        #[tokio::test]
        async fn test_second_unauthorized_is_not_retried() {
            let server = MockServer::start_async().await;
            let mock = server
                .mock_async(|when, then| {
                    when.method(POST).path(EVENTS_PATH);
                    then.status(401).body("nope");
                })
                .await;

            let provider = Arc::new(StaticTokenProvider::sequence(["t1", "t2", "t3"]));
            let transport = transport(&server, provider.clone());
            transport.prepare().await.unwrap();

            let report = deliver(&transport, &single(), &SignalHub::new(false)).await;

            mock.assert_hits_async(2).await;
            assert!(!report.delivered);
            assert_eq!(report.attempts, 2);
            assert_eq!(report.errors.len(), 2);
            assert_eq!(provider.calls(), 2);
        }

        #[tokio::test]
        async fn test_load_event_types_from_proxy() {
            let server = MockServer::start_async().await;
            let mock = server
                .mock_async(|when, then| {
                    when.method(GET)
                        .path("/imfmobileanalytics/proxy/v1/eventtypes")
                        .header("authorization", "t1");
                    then.status(200)
                        .json_body(json!({"Bob": {"properties": {"a": {}, "timestamp": {}}}}));
                })
                .await;

            let transport = transport(&server, Arc::new(StaticTokenProvider::new("t1")));
            transport.prepare().await.unwrap();

            let types = transport.load_event_types().await.unwrap();

            mock.assert_async().await;
            assert!(types.contains_key("Bob"));
        }
    }
}
