//! End-to-end tests for the analytics pipeline
//!
//! This test suite covers:
//! - Buffering, deferral and flushing on the timer
//! - Dispatch shapes seen by the backend
//! - Validation failures and schema load failures
//! - The flush snapshot versus events added during delivery
//! - The query safety gate in proxy mode

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beacon_analytics::transport::{LocalTransport, Method, RequestOptions, TransportResponse};
use beacon_analytics::{
    AnalyticsConfig, AnalyticsEmitter, AnalyticsError, AnalyticsResult, AnalyticsSignal, SchemaState,
    Transport, TransportMode,
};
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, Notify, Semaphore};

const INTERVAL: Duration = Duration::from_millis(2500);

fn config() -> AnalyticsConfig {
    AnalyticsConfig {
        emit_internal_signals: true,
        ..AnalyticsConfig::local()
    }
}

async fn start(
    config: AnalyticsConfig,
    transport: Arc<dyn Transport>,
) -> (AnalyticsEmitter, broadcast::Receiver<AnalyticsSignal>) {
    let emitter = AnalyticsEmitter::builder(config).transport(transport).build().unwrap();
    let mut signals = emitter.subscribe();
    assert_eq!(signals.recv().await.unwrap(), AnalyticsSignal::TypesLoaded);
    (emitter, signals)
}

async fn next_error(signals: &mut broadcast::Receiver<AnalyticsSignal>) -> String {
    loop {
        if let AnalyticsSignal::Error(message) = signals.recv().await.unwrap() {
            return message;
        }
    }
}

mod flush_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_single_event_is_deferred_once_then_posted() {
        let backend = Arc::new(LocalTransport::new());
        let (emitter, _signals) = start(config(), backend.clone()).await;

        emitter.report_event("Bob", json!({"a": 1, "b": "x"}));

        tokio::time::sleep(INTERVAL + Duration::from_millis(100)).await;
        assert!(backend.requests().is_empty());
        assert_eq!(emitter.buffered_len(), 1);

        tokio::time::sleep(INTERVAL).await;
        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::POST);
        assert_eq!(requests[0].path, "/FakeElasticSearch/v1/events/Bob");
        assert!(!requests[0].bulk);
        assert_eq!(requests[0].content_type.as_deref(), Some("text/plain"));

        let events = requests[0].events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["a"], json!(1));
        assert_eq!(events[0]["b"], json!("x"));
        assert!(events[0]["timestamp"].is_i64());
        assert_eq!(emitter.buffered_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_is_posted_on_first_tick() {
        let backend = Arc::new(LocalTransport::new());
        let (emitter, _signals) = start(config(), backend.clone()).await;

        let bobs: Vec<Value> = (0..8).map(|a| json!({"a": a})).collect();
        let fruit = vec![json!({"fruit": "apple", "amount": 1}), json!({"fruit": "pear", "amount": 2})];
        emitter.report_events([("Bob", bobs), ("FruitEvent", fruit)]);

        tokio::time::sleep(INTERVAL + Duration::from_millis(100)).await;

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].path, "/FakeElasticSearch/v1/events/_bulk");
        assert!(requests[0].bulk);

        let documents = requests[0].documents();
        assert_eq!(documents.len(), 20);
        assert_eq!(documents[0], json!({"create": {"_type": "Bob"}}));
        assert_eq!(documents[16], json!({"create": {"_type": "FruitEvent"}}));

        // One shared timestamp for the whole call.
        let events = requests[0].events();
        assert!(events.iter().all(|event| event["timestamp"] == events[0]["timestamp"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_type_events_use_type_bulk() {
        let backend = Arc::new(LocalTransport::new());
        let config = AnalyticsConfig {
            min_batch: 0,
            ..config()
        };
        let (emitter, _signals) = start(config, backend.clone()).await;

        emitter.report_event("Lou", json!({"aa": "x"}));
        emitter.report_event("Lou", json!({"aa": "y"}));

        tokio::time::sleep(INTERVAL + Duration::from_millis(100)).await;

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].path, "/FakeElasticSearch/v1/events/Lou/_bulk");
        assert_eq!(requests[0].documents()[0], json!({"create": {}}));
        assert_eq!(requests[0].events().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_sends_nothing() {
        let backend = Arc::new(LocalTransport::new());
        let (_emitter, _signals) = start(config(), backend.clone()).await;

        tokio::time::sleep(INTERVAL * 4).await;
        assert!(backend.requests().is_empty());
    }
}

mod validation_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_invalid_events_are_dropped_individually() {
        let backend = Arc::new(LocalTransport::new());
        let config = AnalyticsConfig {
            min_batch: 0,
            ..config()
        };
        let (emitter, mut signals) = start(config, backend.clone()).await;

        emitter.report_event("Bob", json!({"a": 1, "b": "x", "c": true}));
        emitter.report_event("Bob", json!({"a": 2}));
        emitter.report_event("Nope", json!({"x": 1}));

        tokio::time::sleep(INTERVAL + Duration::from_millis(100)).await;

        let first = next_error(&mut signals).await;
        assert!(first.starts_with("An event has more properties than its type, Bob."));
        assert_eq!(next_error(&mut signals).await, "Nope is not a known event type.");

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].path, "/FakeElasticSearch/v1/events/Bob");
        assert_eq!(requests[0].events()[0]["a"], json!(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_post_is_reported() {
        let backend = Arc::new(LocalTransport::new());
        backend.push_response(500, "boom");
        let config = AnalyticsConfig {
            min_batch: 0,
            ..config()
        };
        let (emitter, mut signals) = start(config, backend.clone()).await;

        emitter.report_event("Lou", json!({"aa": "x"}));
        tokio::time::sleep(INTERVAL + Duration::from_millis(100)).await;

        assert_eq!(
            next_error(&mut signals).await,
            "Got statusCode 500 after posting events.\nboom"
        );
        // Local mode never refreshes a credential, so there is no replay.
        assert_eq!(backend.requests().len(), 1);
    }
}

mod schema_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_load_failure_drops_buffered_events_and_retries() {
        let backend = Arc::new(LocalTransport::new());
        backend.fail_loads(1);

        let emitter = AnalyticsEmitter::builder(config())
            .transport(backend.clone())
            .build()
            .unwrap();
        let mut signals = emitter.subscribe();

        emitter.report_events([("Bob", vec![json!({"a": 1}), json!({"a": 2}), json!({"a": 3})])]);
        assert_eq!(emitter.buffered_len(), 3);

        assert_eq!(
            signals.recv().await.unwrap(),
            AnalyticsSignal::Error("Error loading analytics event types. load_attempt: 0".to_string())
        );
        assert_eq!(signals.recv().await.unwrap(), AnalyticsSignal::TypesLoadFailed);
        assert_eq!(
            signals.recv().await.unwrap(),
            AnalyticsSignal::Error(
                "Analytic events were lost because of a failure to load event types. Lost events: 3".to_string()
            )
        );
        assert_eq!(emitter.buffered_len(), 0);
        assert_eq!(emitter.schema_state(), SchemaState::Loading);

        assert_eq!(signals.recv().await.unwrap(), AnalyticsSignal::TypesLoaded);
        assert_eq!(emitter.schema_state(), SchemaState::Ready);
        assert_eq!(backend.load_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_replaces_types() {
        let backend = Arc::new(LocalTransport::new());
        let (emitter, mut signals) = start(config(), backend.clone()).await;
        assert!(emitter.event_types().contains(&"SportingEvent".to_string()));

        emitter.reload_schema();

        assert_eq!(signals.recv().await.unwrap(), AnalyticsSignal::TypesLoaded);
        assert_eq!(backend.load_calls(), 2);
        assert_eq!(emitter.event_types().len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_while_loading_is_skipped() {
        let backend = Arc::new(LocalTransport::new());
        backend.fail_loads(1);

        let emitter = AnalyticsEmitter::builder(config())
            .transport(backend.clone())
            .build()
            .unwrap();
        let mut signals = emitter.subscribe();

        next_error(&mut signals).await;
        assert_eq!(signals.recv().await.unwrap(), AnalyticsSignal::TypesLoadFailed);
        assert_eq!(emitter.schema_state(), SchemaState::Loading);

        emitter.reload_schema();

        assert_eq!(signals.recv().await.unwrap(), AnalyticsSignal::TypesLoaded);
        assert_eq!(backend.load_calls(), 2);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.load_calls(), 2);
        assert_eq!(emitter.schema_state(), SchemaState::Ready);
        assert!(signals.try_recv().is_err());
    }
}

mod snapshot_tests {
    use super::*;

    /// Local backend whose posts wait for the test to release them.
    struct GatedTransport {
        backend: LocalTransport,
        gate: Semaphore,
        entered: Notify,
    }

    #[async_trait]
    impl Transport for GatedTransport {
        fn mode(&self) -> TransportMode {
            TransportMode::Local
        }

        fn request_options(&self, method: Method, path: &str) -> RequestOptions {
            self.backend.request_options(method, path)
        }

        async fn request(&self, options: RequestOptions, body: Option<String>) -> AnalyticsResult<TransportResponse> {
            self.entered.notify_one();
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| AnalyticsError::Transport("gate closed".to_string()))?;
            permit.forget();
            self.backend.request(options, body).await
        }

        async fn load_event_types(&self) -> AnalyticsResult<Map<String, Value>> {
            self.backend.load_event_types().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_added_during_delivery_wait_for_next_flush() {
        let transport = Arc::new(GatedTransport {
            backend: LocalTransport::new(),
            gate: Semaphore::new(0),
            entered: Notify::new(),
        });
        let config = AnalyticsConfig {
            min_batch: 0,
            ..config()
        };
        let (emitter, _signals) = start(config, transport.clone()).await;

        emitter.report_event("Bob", json!({"a": 1}));

        transport.entered.notified().await;
        assert_eq!(emitter.buffered_len(), 0);

        emitter.report_event("Bob", json!({"a": 2}));
        assert_eq!(emitter.buffered_len(), 1);

        transport.gate.add_permits(1);
        transport.entered.notified().await;
        transport.gate.add_permits(1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let requests = transport.backend.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].events()[0]["a"], json!(1));
        assert_eq!(requests[1].events()[0]["a"], json!(2));
        assert_eq!(emitter.buffered_len(), 0);
    }
}

mod delivery_tests {
    use super::*;

    /// Local backend that rejects every post and never finishes a refresh.
    struct StuckRefreshTransport {
        backend: LocalTransport,
    }

    #[async_trait]
    impl Transport for StuckRefreshTransport {
        fn mode(&self) -> TransportMode {
            TransportMode::Local
        }

        fn request_options(&self, method: Method, path: &str) -> RequestOptions {
            self.backend.request_options(method, path)
        }

        async fn request(&self, options: RequestOptions, body: Option<String>) -> AnalyticsResult<TransportResponse> {
            self.backend.request(options, body).await?;
            Ok(TransportResponse::new(401, "expired"))
        }

        async fn load_event_types(&self) -> AnalyticsResult<Map<String, Value>> {
            self.backend.load_event_types().await
        }

        async fn refresh_credential(&self) -> AnalyticsResult<bool> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushing_continues_while_refresh_hangs() {
        let transport = Arc::new(StuckRefreshTransport {
            backend: LocalTransport::new(),
        });
        let config = AnalyticsConfig {
            min_batch: 0,
            ..config()
        };
        let (emitter, mut signals) = start(config, transport.clone()).await;

        for a in 1..=3 {
            emitter.report_event("Bob", json!({"a": a}));
            tokio::time::sleep(INTERVAL + Duration::from_millis(100)).await;
            assert_eq!(transport.backend.requests().len(), a as usize);
            assert_eq!(emitter.buffered_len(), 0);
        }

        assert_eq!(
            next_error(&mut signals).await,
            "Got statusCode 401 after posting events.\nexpired"
        );
    }
}

mod proxy_tests {
    use super::*;
    use beacon_analytics::transport::ProxySettings;
    use beacon_analytics::StaticTokenProvider;
    use httpmock::prelude::*;

    const EVENTS_PATH: &str = "/imfmobileanalytics/proxy/v1/apps/app-1/Bob";

    #[tokio::test]
    async fn test_recovered_unauthorized_is_still_signalled() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/imfmobileanalytics/proxy/v1/eventtypes");
                then.status(200).json_body(json!({"Bob": {"properties": {"a": {}, "timestamp": {}}}}));
            })
            .await;
        let stale = server
            .mock_async(|when, then| {
                when.method(POST).path(EVENTS_PATH).header("authorization", "t1");
                then.status(401).body("expired");
            })
            .await;
        let fresh = server
            .mock_async(|when, then| {
                when.method(POST).path(EVENTS_PATH).header("authorization", "t2");
                then.status(201);
            })
            .await;

        let provider = Arc::new(StaticTokenProvider::sequence(["t1", "t2"]));
        let config = AnalyticsConfig {
            proxy: Some(ProxySettings::new("app-1", "https://auth.example.net").with_proxy_url(server.base_url())),
            report_event_interval_ms: 50,
            min_batch: 0,
            ..Default::default()
        };
        let emitter = AnalyticsEmitter::builder(config)
            .token_provider(provider.clone())
            .build()
            .unwrap();
        let mut signals = emitter.subscribe();

        emitter.report_event("Bob", json!({"a": 1}));

        let message = tokio::time::timeout(Duration::from_secs(5), next_error(&mut signals))
            .await
            .unwrap();
        assert_eq!(message, "Got statusCode 401 after posting events.\nexpired");

        tokio::time::timeout(Duration::from_secs(5), async {
            while fresh.hits_async().await == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        stale.assert_async().await;
        assert_eq!(provider.calls(), 2);
        assert_eq!(emitter.buffered_len(), 0);

        emitter.shutdown().await;
    }
}

mod query_tests {
    use super::*;
    use beacon_analytics::transport::ProxySettings;
    use beacon_analytics::{QueryOverrides, StaticTokenProvider};
    use httpmock::prelude::*;

    #[tokio::test]
    async fn test_proxy_query_requires_overrides() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/imfmobileanalytics/proxy/v1/eventtypes");
                then.status(200).json_body(json!({"Bob": {"properties": {"a": {}, "timestamp": {}}}}));
            })
            .await;
        let search = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/events/Bob/_search")
                    .header("content-type", "application/json");
                then.status(200).json_body(json!({"hits": {"total": 1}}));
            })
            .await;

        let config = AnalyticsConfig {
            proxy: Some(ProxySettings::new("app-1", "https://auth.example.net").with_proxy_url(server.base_url())),
            ..Default::default()
        };
        let emitter = AnalyticsEmitter::builder(config)
            .token_provider(Arc::new(StaticTokenProvider::new("t1")))
            .build()
            .unwrap();
        let mut signals = emitter.subscribe();
        assert_eq!(emitter.mode(), Some(TransportMode::Proxy));

        let err = emitter
            .run_query(&json!({"query": {"match_all": {}}}), "Bob", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyticsError::QueryRefused));
        assert_eq!(
            next_error(&mut signals).await,
            "run_query: Requires test overrides when running in public org."
        );

        let overrides = QueryOverrides::new(server.host(), server.port(), "events", "u", "p").with_scheme("http");
        let result = emitter
            .run_query(&json!({"query": {"match_all": {}}}), "Bob", None, Some(&overrides))
            .await
            .unwrap();

        search.assert_async().await;
        assert_eq!(result["hits"]["total"], json!(1));

        emitter.shutdown().await;
    }
}
