//! Operational signals.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of the signal channel. Slow subscribers miss old signals.
const SIGNAL_CAPACITY: usize = 256;

/// Something the pipeline wants its host to know.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", content = "message", rename_all = "snake_case")]
pub enum AnalyticsSignal {
    /// An operational error. Never fatal.
    Error(String),
    /// Event types were loaded and the flush timer may run.
    TypesLoaded,
    /// Loading event types failed; a retry is scheduled.
    TypesLoadFailed,
}

/// Fan-out point for [`AnalyticsSignal`]s.
///
/// Errors are always sent and logged. Lifecycle signals are only sent when
/// internal signals are enabled.
#[derive(Debug, Clone)]
pub struct SignalHub {
    sender: broadcast::Sender<AnalyticsSignal>,
    internal: bool,
}

impl SignalHub {
    /// Creates a hub.
    pub fn new(internal: bool) -> Self {
        let (sender, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self { sender, internal }
    }

    /// Subscribes to future signals.
    pub fn subscribe(&self) -> broadcast::Receiver<AnalyticsSignal> {
        self.sender.subscribe()
    }

    /// Reports an error.
    pub fn error(&self, err: impl std::fmt::Display) {
        let message = err.to_string();
        tracing::error!("{}", message);
        // No subscriber is not a failure.
        let _ = self.sender.send(AnalyticsSignal::Error(message));
    }

    /// Sends a lifecycle signal if internal signals are enabled.
    pub fn internal(&self, signal: AnalyticsSignal) {
        if self.internal {
            tracing::debug!(?signal, "Internal analytics signal");
            let _ = self.sender.send(signal);
        }
    }
}
