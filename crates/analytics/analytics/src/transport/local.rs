use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use super::{Auth, Method, RequestOptions, Transport, TransportMode, TransportResponse};
use crate::error::{AnalyticsError, AnalyticsResult};

const LOCAL_ORIGIN: &str = "local://";
const EVENTS_PREFIX: &str = "/FakeElasticSearch/v1/events";

/// A request received by the local backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    /// HTTP method.
    pub method: Method,
    /// Full path, including the fake index prefix.
    pub path: String,
    /// Raw body.
    pub body: String,
    /// Whether the path addressed a bulk endpoint.
    pub bulk: bool,
    /// Value of the `Content-Type` header.
    pub content_type: Option<String>,
}

impl RecordedRequest {
    /// Parses every non-empty body line as JSON.
    ///
    /// Bulk bodies yield action lines and events interleaved.
    pub fn documents(&self) -> Vec<Value> {
        self.body
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Returns the events of the body, skipping bulk action lines.
    pub fn events(&self) -> Vec<Value> {
        let documents = self.documents();
        if self.bulk {
            documents.into_iter().skip(1).step_by(2).collect()
        } else {
            documents
        }
    }
}

/// In-process fake of the search index.
///
/// Serves a fixed set of event types, answers every post with `200 {}`
/// unless a response was queued, and records each request.
pub struct LocalTransport {
    event_types: Map<String, Value>,
    requests: Mutex<Vec<RecordedRequest>>,
    responses: Mutex<VecDeque<TransportResponse>>,
    failing_loads: AtomicUsize,
    load_calls: AtomicUsize,
    stopped: AtomicBool,
}

impl LocalTransport {
    /// Creates a backend serving the built-in fixture types.
    pub fn new() -> Self {
        Self::with_event_types(fixture_event_types())
    }

    /// Creates a backend serving the given type mapping.
    pub fn with_event_types(event_types: Map<String, Value>) -> Self {
        Self {
            event_types,
            requests: Mutex::new(Vec::new()),
            responses: Mutex::new(VecDeque::new()),
            failing_loads: AtomicUsize::new(0),
            load_calls: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// Queues a response for the next request.
    pub fn push_response(&self, status: u16, body: impl Into<String>) {
        self.responses.lock().push_back(TransportResponse::new(status, body));
    }

    /// Makes the next `count` type loads fail.
    pub fn fail_loads(&self, count: usize) {
        self.failing_loads.store(count, Ordering::SeqCst);
    }

    /// Returns how many times the types were requested.
    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    /// Returns the recorded requests.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Removes and returns the recorded requests.
    pub fn take_requests(&self) -> Vec<RecordedRequest> {
        std::mem::take(&mut *self.requests.lock())
    }

    /// Checks if the backend was shut down.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn check_running(&self) -> AnalyticsResult<()> {
        if self.is_stopped() {
            return Err(AnalyticsError::Transport("local backend is stopped".to_string()));
        }
        Ok(())
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Local
    }

    fn request_options(&self, method: Method, path: &str) -> RequestOptions {
        RequestOptions::new(method, LOCAL_ORIGIN, format!("{}{}", EVENTS_PREFIX, path), Auth::None)
    }

    async fn request(&self, options: RequestOptions, body: Option<String>) -> AnalyticsResult<TransportResponse> {
        self.check_running()?;

        let request = RecordedRequest {
            bulk: options.path.contains("_bulk"),
            content_type: options.header("Content-Type").map(str::to_string),
            method: options.method,
            path: options.path,
            body: body.unwrap_or_default(),
        };

        tracing::info!(path = %request.path, bulk = request.bulk, "Local backend received request");

        self.requests.lock().push(request);

        Ok(self
            .responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| TransportResponse::new(200, "{}")))
    }

    async fn load_event_types(&self) -> AnalyticsResult<Map<String, Value>> {
        self.check_running()?;
        self.load_calls.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failing_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AnalyticsError::Transport(
                "Error getting event types: local backend refused".to_string(),
            ));
        }

        Ok(self.event_types.clone())
    }

    async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        tracing::info!("Local backend stopped");
    }
}

/// Event types the local backend serves.
pub fn fixture_event_types() -> Map<String, Value> {
    let date = json!({"type": "date"});
    let keyword = json!({"index": "not_analyzed", "type": "string"});
    let integer = json!({"type": "integer"});

    let types = json!({
        "Bob": {"properties": {"timestamp": date, "a": integer, "b": keyword}},
        "ObjectCreate": {"properties": {
            "timestamp": date, "appID": keyword, "database": keyword, "object": keyword
        }},
        "FileTotal": {"properties": {
            "timestamp": date, "appID": keyword, "size": integer, "fileCount": integer
        }},
        "FileQuery": {"properties": {
            "timestamp": date, "appID": keyword, "collection": keyword, "file": keyword
        }},
        "FruitEvent": {"properties": {"timestamp": date, "fruit": keyword, "amount": integer}},
        "SaladEvent": {"properties": {"timestamp": date, "variety": keyword, "amount": {"type": "float"}}},
        "InjuryEvent": {"properties": {"timestamp": date, "location": keyword, "damage": keyword}},
        "SportingEvent": {"properties": {
            "timestamp": date, "sport": keyword, "leader": keyword, "players": {"type": "object"}
        }},
        "Lou": {"properties": {"timestamp": date, "aa": keyword}},
        "Blah": {"properties": {"timestamp": date, "aaa": {"type": "boolean"}, "bbb": {"type": "boolean"}}},
    });

    match types {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
