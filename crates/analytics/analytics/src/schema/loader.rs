use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::SchemaRegistry;
use crate::buffer::EventBuffer;
use crate::error::{AnalyticsError, AnalyticsResult};
use crate::signal::{AnalyticsSignal, SignalHub};
use crate::transport::Transport;

/// Delay between failed load attempts.
pub const DEFAULT_SCHEMA_RETRY: Duration = Duration::from_secs(2);

/// Fetches event types from the backend into the registry.
///
/// A failed load drops every buffered event, since none of them can be
/// validated, and is retried after a fixed delay until it succeeds.
pub struct SchemaLoader {
    transport: Arc<dyn Transport>,
    registry: Arc<SchemaRegistry>,
    buffer: Arc<Mutex<EventBuffer>>,
    signals: SignalHub,
    retry: Duration,
}

impl SchemaLoader {
    /// Creates a loader.
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<SchemaRegistry>,
        buffer: Arc<Mutex<EventBuffer>>,
        signals: SignalHub,
    ) -> Self {
        Self {
            transport,
            registry,
            buffer,
            signals,
            retry: DEFAULT_SCHEMA_RETRY,
        }
    }

    /// Sets the delay between attempts.
    pub fn with_retry(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    /// Makes one load attempt and returns the number of types loaded.
    pub async fn load_once(&self, attempt: u64) -> AnalyticsResult<usize> {
        self.registry.mark_loading();

        match self.transport.load_event_types().await {
            Ok(mapping) => {
                self.registry.replace_from_mapping(&mapping);
                self.signals.internal(AnalyticsSignal::TypesLoaded);
                Ok(self.registry.len())
            }
            Err(err) => {
                tracing::warn!(attempt, error = %err, "Loading event types failed");
                self.signals.error(AnalyticsError::SchemaLoad { attempt });
                self.signals.internal(AnalyticsSignal::TypesLoadFailed);

                let lost = self.buffer.lock().clear();
                if lost > 0 {
                    self.signals.error(AnalyticsError::EventsLost(lost));
                }

                Err(err)
            }
        }
    }

    /// Loads until an attempt succeeds. Returns the number of attempts made.
    pub async fn run(&self) -> u64 {
        let mut attempt = 0;
        loop {
            let result = self.load_once(attempt).await;
            attempt += 1;

            if result.is_ok() {
                return attempt;
            }

            tokio::time::sleep(self.retry).await;
        }
    }
}
