//! Reporting façade.
//!
//! [`AnalyticsEmitter`] is what the host service holds. It stamps and buffers
//! events, runs the schema loader and the flush timer in the background, and
//! publishes operational signals. Failures never reach the caller except from
//! the network transaction helpers and [`AnalyticsEmitter::run_query`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::buffer::{EventBuffer, FlushOutcome};
use crate::config::AnalyticsConfig;
use crate::dispatch::{deliver, Dispatch};
use crate::error::{AnalyticsError, AnalyticsResult};
use crate::event::{current_timestamp, into_event, stamp, BufferedEvent};
use crate::network::{NetworkContext, NETWORK_EVENT_TYPE};
use crate::schema::{SchemaLoader, SchemaRegistry, SchemaState};
use crate::signal::{AnalyticsSignal, SignalHub};
use crate::token::TokenProvider;
use crate::transport::{
    Auth, DirectTransport, LocalTransport, Method, ProxyTransport, RequestOptions, Transport, TransportMode,
};

/// Explicit index coordinates for [`AnalyticsEmitter::run_query`].
///
/// Required in proxy mode, where the index is shared and queries are only
/// allowed against a test deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOverrides {
    /// Index host name.
    pub hostname: String,
    /// Index port.
    pub port: u16,
    /// Index name, with or without a leading slash.
    pub index: String,
    /// Basic auth user id.
    pub userid: String,
    /// Basic auth password.
    pub password: String,
    /// URL scheme.
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

fn default_scheme() -> String {
    "https".to_string()
}

impl QueryOverrides {
    /// Creates overrides for an HTTPS index.
    pub fn new(
        hostname: impl Into<String>,
        port: u16,
        index: impl Into<String>,
        userid: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            index: index.into(),
            userid: userid.into(),
            password: password.into(),
            scheme: default_scheme(),
        }
    }

    /// Sets the URL scheme.
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    fn request_options(&self, path: &str) -> RequestOptions {
        let index = self.index.trim_start_matches('/');
        RequestOptions::new(
            Method::POST,
            &format!("{}://{}:{}", self.scheme, self.hostname, self.port),
            format!("/{}{}", index, path),
            Auth::Basic {
                userid: self.userid.clone(),
                password: self.password.clone(),
            },
        )
    }
}

/// The shared parts the background tasks work on.
#[derive(Clone)]
struct Pipeline {
    transport: Arc<dyn Transport>,
    registry: Arc<SchemaRegistry>,
    buffer: Arc<Mutex<EventBuffer>>,
    signals: SignalHub,
}

impl Pipeline {
    /// Runs one flush step and spawns the delivery of whatever it produced.
    fn flush(&self) {
        let outcome = self.buffer.lock().flush(&self.registry);

        let (dispatch, errors) = match outcome {
            FlushOutcome::Idle => return,
            FlushOutcome::Deferred { pending } => {
                tracing::trace!(pending, "Deferring flush to let more events accumulate");
                return;
            }
            FlushOutcome::AllInvalid { errors } => {
                for err in errors {
                    self.signals.error(err);
                }
                return;
            }
            FlushOutcome::Dispatch { dispatch, errors } => (dispatch, errors),
        };

        for err in errors {
            self.signals.error(err);
        }

        tokio::spawn(self.clone().deliver(dispatch));
    }

    async fn deliver(self, dispatch: Dispatch) {
        let report = deliver(self.transport.as_ref(), &dispatch, &self.signals).await;

        if report.delivered {
            tracing::debug!(id = %report.id, count = dispatch.event_count(), attempts = report.attempts, "Events delivered");
        }
    }

    async fn run_flush_timer(self, period: Duration) {
        // A zero period would make `interval` panic.
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if self.registry.is_ready() {
                self.flush();
            }
        }
    }
}

#[derive(Default)]
struct Tasks {
    startup: Option<JoinHandle<()>>,
    reload: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort(&mut self) {
        for handle in [self.startup.take(), self.reload.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

struct Inner {
    pipeline: Pipeline,
    loader: Arc<SchemaLoader>,
    service_name: Option<String>,
    tasks: Mutex<Tasks>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.tasks.get_mut().abort();
    }
}

/// Builder for [`AnalyticsEmitter`].
pub struct AnalyticsEmitterBuilder {
    config: AnalyticsConfig,
    token_provider: Option<Arc<dyn TokenProvider>>,
    transport: Option<Arc<dyn Transport>>,
}

impl AnalyticsEmitterBuilder {
    /// Sets the token provider used in proxy mode.
    pub fn token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// Uses a ready-made transport instead of the configured one.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Builds the emitter and starts its background work.
    ///
    /// Must be called within a Tokio runtime. A disabled configuration
    /// yields a disabled emitter. Configuration errors are logged and
    /// returned; the caller may fall back to [`AnalyticsEmitter::disabled`].
    pub fn build(self) -> AnalyticsResult<AnalyticsEmitter> {
        if !self.config.enabled {
            tracing::info!("Analytics disabled by configuration");
            return Ok(AnalyticsEmitter::disabled());
        }

        let transport = match self.transport {
            Some(transport) => transport,
            None => Self::make_transport(&self.config, self.token_provider).inspect_err(|err| {
                tracing::error!("Analytics configuration error: {}", err);
            })?,
        };

        let signals = SignalHub::new(self.config.emit_internal_signals);
        let pipeline = Pipeline {
            transport,
            registry: Arc::new(SchemaRegistry::new()),
            buffer: Arc::new(Mutex::new(EventBuffer::with_min_batch(self.config.min_batch))),
            signals: signals.clone(),
        };
        let loader = Arc::new(
            SchemaLoader::new(
                pipeline.transport.clone(),
                pipeline.registry.clone(),
                pipeline.buffer.clone(),
                signals.clone(),
            )
            .with_retry(self.config.schema_retry()),
        );

        tracing::info!(
            mode = ?pipeline.transport.mode(),
            interval_ms = self.config.report_event_interval_ms,
            "Starting analytics pipeline"
        );

        let startup = tokio::spawn(startup(pipeline.clone(), loader.clone(), self.config.report_interval()));

        let inner = Inner {
            pipeline,
            loader,
            service_name: self.config.service_name,
            tasks: Mutex::new(Tasks {
                startup: Some(startup),
                reload: None,
            }),
        };

        Ok(AnalyticsEmitter {
            signals,
            inner: Some(Arc::new(inner)),
        })
    }

    fn make_transport(
        config: &AnalyticsConfig,
        token_provider: Option<Arc<dyn TokenProvider>>,
    ) -> AnalyticsResult<Arc<dyn Transport>> {
        match config.mode()? {
            TransportMode::Local => Ok(Arc::new(LocalTransport::new())),
            TransportMode::Direct => {
                let credentials = config
                    .direct
                    .as_ref()
                    .ok_or_else(|| AnalyticsError::Config("Missing required setting: direct.url".to_string()))?;
                Ok(Arc::new(DirectTransport::new(credentials)?))
            }
            TransportMode::Proxy => {
                let settings = config
                    .proxy
                    .as_ref()
                    .ok_or_else(|| AnalyticsError::Config("Missing required setting: proxy.app_id".to_string()))?;
                let provider = token_provider.ok_or_else(|| {
                    AnalyticsError::Config("Missing required setting: proxy token provider".to_string())
                })?;
                Ok(Arc::new(ProxyTransport::new(settings, provider)?))
            }
        }
    }
}

/// Prepares the transport, loads the event types, then runs the flush timer.
async fn startup(pipeline: Pipeline, loader: Arc<SchemaLoader>, period: Duration) {
    if let Err(err) = pipeline.transport.prepare().await {
        pipeline.signals.error(err);
    }

    let attempts = loader.run().await;
    tracing::debug!(attempts, "Event types loaded; starting flush timer");

    pipeline.run_flush_timer(period).await;
}

/// Handle to the analytics pipeline. Cheap to clone.
#[derive(Clone)]
pub struct AnalyticsEmitter {
    signals: SignalHub,
    inner: Option<Arc<Inner>>,
}

impl AnalyticsEmitter {
    /// Starts building an emitter.
    pub fn builder(config: AnalyticsConfig) -> AnalyticsEmitterBuilder {
        AnalyticsEmitterBuilder {
            config,
            token_provider: None,
            transport: None,
        }
    }

    /// Creates an emitter that ignores every call.
    pub fn disabled() -> Self {
        Self {
            signals: SignalHub::new(false),
            inner: None,
        }
    }

    /// Checks if the emitter collects events.
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Returns the backend personality, if enabled.
    pub fn mode(&self) -> Option<TransportMode> {
        self.inner.as_ref().map(|inner| inner.pipeline.transport.mode())
    }

    /// Subscribes to operational signals.
    pub fn subscribe(&self) -> broadcast::Receiver<AnalyticsSignal> {
        self.signals.subscribe()
    }

    /// Returns the number of buffered events.
    pub fn buffered_len(&self) -> usize {
        self.inner
            .as_ref()
            .map_or(0, |inner| inner.pipeline.buffer.lock().len())
    }

    /// Returns the schema registry's state.
    pub fn schema_state(&self) -> SchemaState {
        self.inner
            .as_ref()
            .map_or(SchemaState::Unloaded, |inner| inner.pipeline.registry.state())
    }

    /// Returns the known event type names.
    pub fn event_types(&self) -> Vec<String> {
        self.inner
            .as_ref()
            .map(|inner| inner.pipeline.registry.type_names())
            .unwrap_or_default()
    }

    /// Buffers one event of the given type.
    ///
    /// The event must be a JSON object; it is stamped with the current time.
    /// Problems are reported as signals, never returned.
    pub fn report_event(&self, event_type: &str, event: Value) {
        let Some(inner) = &self.inner else {
            return;
        };

        match into_event(event) {
            Ok(mut event) => {
                stamp(&mut event, current_timestamp());
                inner.pipeline.buffer.lock().add_one(event_type, event);
            }
            Err(err) => self
                .signals
                .error(format!("While reporting an event, caught {}", err)),
        }
    }

    /// Buffers batches of events, each batch sharing one type.
    ///
    /// Every event gets the same timestamp. A batch holding a non-object is
    /// reported and stops the call; earlier batches stay buffered.
    pub fn report_events<I, S>(&self, batches: I)
    where
        I: IntoIterator<Item = (S, Vec<Value>)>,
        S: AsRef<str>,
    {
        let Some(inner) = &self.inner else {
            return;
        };

        let timestamp = current_timestamp();

        for (event_type, events) in batches {
            let events = match events
                .into_iter()
                .map(into_event)
                .collect::<AnalyticsResult<Vec<BufferedEvent>>>()
            {
                Ok(events) => events,
                Err(err) => {
                    self.signals
                        .error(format!("While reporting events, caught {}", err));
                    return;
                }
            };

            let events = events
                .into_iter()
                .map(|mut event| {
                    stamp(&mut event, timestamp);
                    event
                })
                .collect();

            inner.pipeline.buffer.lock().add_many(event_type.as_ref(), events);
        }
    }

    /// Starts timing a network transaction.
    pub fn record_inbound_network_request(&self, ctx: &mut NetworkContext) -> AnalyticsResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        ctx.record_inbound_request(current_timestamp())
    }

    /// Records the call to a backend.
    pub fn record_outbound_network_request(&self, ctx: &mut NetworkContext, url: &str) -> AnalyticsResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        ctx.record_outbound_request(url, current_timestamp())
    }

    /// Records the backend's answer.
    pub fn record_inbound_network_response(&self, ctx: &mut NetworkContext) -> AnalyticsResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        ctx.record_inbound_response(current_timestamp())
    }

    /// Records the response leaving the service.
    pub fn record_outbound_network_response(&self, ctx: &mut NetworkContext) -> AnalyticsResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        ctx.record_outbound_response(current_timestamp())
    }

    /// Reports a completed network transaction.
    ///
    /// The context is checked now; the event is buffered on a later turn of
    /// the scheduler.
    pub fn report_network_event(&self, ctx: &NetworkContext) -> AnalyticsResult<()> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };

        let event = ctx.to_event(inner.service_name.as_deref())?;
        let emitter = self.clone();
        tokio::spawn(async move {
            emitter.report_event(NETWORK_EVENT_TYPE, event);
        });

        Ok(())
    }

    /// Runs a search query against the index.
    ///
    /// Posts `body` to `/<type_scope>/_search`, optionally with a
    /// `search_type`. In proxy mode the query is refused unless `overrides`
    /// point it at an explicit index. Failures are reported and returned.
    pub async fn run_query(
        &self,
        body: &Value,
        type_scope: &str,
        search_kind: Option<&str>,
        overrides: Option<&QueryOverrides>,
    ) -> AnalyticsResult<Value> {
        let Some(inner) = &self.inner else {
            return Ok(Value::Null);
        };

        self.query(inner, body, type_scope, search_kind, overrides)
            .await
            .inspect_err(|err| self.signals.error(err))
    }

    async fn query(
        &self,
        inner: &Inner,
        body: &Value,
        type_scope: &str,
        search_kind: Option<&str>,
        overrides: Option<&QueryOverrides>,
    ) -> AnalyticsResult<Value> {
        let transport = &inner.pipeline.transport;

        if transport.mode() == TransportMode::Proxy && overrides.is_none() {
            return Err(AnalyticsError::QueryRefused);
        }

        let mut path = format!("/{}/_search", type_scope);
        if let Some(kind) = search_kind {
            path.push_str("?search_type=");
            path.push_str(kind);
        }

        let options = match overrides {
            Some(overrides) => {
                tracing::info!(host = %overrides.hostname, "Running query using override options");
                overrides.request_options(&path)
            }
            None => transport.request_options(Method::POST, &path),
        }
        .with_content_type("application/json");

        tracing::debug!(path = %options.path, "Posting query");

        let response = transport
            .request(options, Some(body.to_string()))
            .await
            .map_err(|e| e.context(&format!("Error while posting query: {}: ", body)))?;
        let text = response.expect(200, None, "after posting query")?;

        serde_json::from_str(text)
            .map_err(|e| AnalyticsError::Serialization(format!("Error parsing query result JSON: {}", e)))
    }

    /// Reloads the event types in the background.
    ///
    /// The flush timer pauses until the load succeeds. Ignored while a load
    /// is already running, since that loader retries until it succeeds.
    pub fn reload_schema(&self) {
        let Some(inner) = &self.inner else {
            return;
        };

        let state = inner.pipeline.registry.state();
        if state != SchemaState::Ready {
            tracing::debug!(?state, "Event types are already loading; reload skipped");
            return;
        }

        let loader = inner.loader.clone();
        let handle = tokio::spawn(async move {
            loader.run().await;
        });

        if let Some(previous) = inner.tasks.lock().reload.replace(handle) {
            previous.abort();
        }
    }

    /// Stops the background tasks and releases the transport.
    ///
    /// Buffered events are not flushed. Deliveries already in flight run to
    /// completion.
    pub async fn shutdown(&self) {
        let Some(inner) = &self.inner else {
            return;
        };

        inner.tasks.lock().abort();
        inner.pipeline.transport.shutdown().await;

        tracing::info!(dropped = inner.pipeline.buffer.lock().len(), "Analytics pipeline stopped");
    }
}

impl std::fmt::Debug for AnalyticsEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyticsEmitter")
            .field("enabled", &self.is_enabled())
            .field("mode", &self.mode())
            .field("buffered", &self.buffered_len())
            .finish()
    }
}
