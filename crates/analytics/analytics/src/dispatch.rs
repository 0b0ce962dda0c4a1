//! Flush snapshots and their delivery.

use serde_json::json;
use uuid::Uuid;

use crate::buffer::TypeBucket;
use crate::error::{AnalyticsError, AnalyticsResult};
use crate::event::BufferedEvent;
use crate::signal::SignalHub;
use crate::transport::{Method, Transport};

const CONTENT_TYPE_EVENTS: &str = "text/plain";

/// Which backend API a dispatch uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    /// One event, posted as a bare document.
    Single,
    /// Many events of one type, posted to the type's bulk endpoint.
    SameType,
    /// Events of several types, posted to the index bulk endpoint.
    Mixed,
}

/// Events moved out of the buffer by a flush.
///
/// The snapshot owns its events, so a replay after a credential refresh
/// sends exactly what the first attempt sent.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// A single event.
    Single {
        /// Event type name.
        event_type: String,
        /// The event.
        event: BufferedEvent,
    },
    /// Several events sharing one type.
    SameType {
        /// Event type name.
        event_type: String,
        /// The events, in insertion order.
        events: Vec<BufferedEvent>,
    },
    /// Events of several types.
    Mixed {
        /// One bucket per type, in first-seen order.
        buckets: Vec<TypeBucket>,
    },
}

impl Dispatch {
    /// Builds the cheapest dispatch for the given buckets.
    ///
    /// Empty buckets are ignored. Returns `None` if no event remains.
    pub fn from_buckets(buckets: Vec<TypeBucket>) -> Option<Self> {
        let mut buckets: Vec<TypeBucket> = buckets.into_iter().filter(|b| !b.is_empty()).collect();

        match buckets.len() {
            0 => None,
            1 => {
                let TypeBucket {
                    event_type,
                    mut events,
                } = buckets.remove(0);
                if events.len() == 1 {
                    let event = events.remove(0);
                    Some(Dispatch::Single { event_type, event })
                } else {
                    Some(Dispatch::SameType { event_type, events })
                }
            }
            _ => Some(Dispatch::Mixed { buckets }),
        }
    }

    /// Returns the dispatch kind.
    pub fn kind(&self) -> DispatchKind {
        match self {
            Dispatch::Single { .. } => DispatchKind::Single,
            Dispatch::SameType { .. } => DispatchKind::SameType,
            Dispatch::Mixed { .. } => DispatchKind::Mixed,
        }
    }

    /// Returns the number of events carried.
    pub fn event_count(&self) -> usize {
        match self {
            Dispatch::Single { .. } => 1,
            Dispatch::SameType { events, .. } => events.len(),
            Dispatch::Mixed { buckets } => buckets.iter().map(TypeBucket::len).sum(),
        }
    }

    /// Returns the event type for single-type dispatches.
    pub fn event_type(&self) -> Option<&str> {
        match self {
            Dispatch::Single { event_type, .. } | Dispatch::SameType { event_type, .. } => {
                Some(event_type)
            }
            Dispatch::Mixed { .. } => None,
        }
    }

    /// Returns the path relative to the events root: `/<type>`,
    /// `/<type>/_bulk` or `/_bulk`.
    pub fn relative_path(&self) -> String {
        match self {
            Dispatch::Single { event_type, .. } => format!("/{}", event_type),
            Dispatch::SameType { event_type, .. } => format!("/{}/_bulk", event_type),
            Dispatch::Mixed { .. } => "/_bulk".to_string(),
        }
    }

    /// Encodes the request body.
    ///
    /// A single event is its bare JSON. Bulk bodies are newline-delimited
    /// pairs of an action line and the event; mixed bulks tag each action
    /// with the event's type.
    pub fn encode(&self) -> AnalyticsResult<String> {
        match self {
            Dispatch::Single { event, .. } => Ok(serde_json::to_string(event)?),
            Dispatch::SameType { events, .. } => {
                let action = json!({"create": {}}).to_string();
                let mut body = String::new();
                for event in events {
                    push_line(&mut body, &action);
                    push_line(&mut body, &serde_json::to_string(event)?);
                }
                Ok(body)
            }
            Dispatch::Mixed { buckets } => {
                let mut body = String::new();
                for bucket in buckets {
                    let action = json!({"create": {"_type": bucket.event_type}}).to_string();
                    for event in &bucket.events {
                        push_line(&mut body, &action);
                        push_line(&mut body, &serde_json::to_string(event)?);
                    }
                }
                Ok(body)
            }
        }
    }
}

fn push_line(body: &mut String, line: &str) {
    body.push_str(line);
    body.push('\n');
}

/// Outcome of delivering one dispatch.
#[derive(Debug)]
pub struct DeliveryReport {
    /// Correlation id used in logs.
    pub id: Uuid,
    /// Requests sent, including a replay.
    pub attempts: u32,
    /// Whether one of the attempts was accepted.
    pub delivered: bool,
    /// Every failure observed, in order.
    pub errors: Vec<AnalyticsError>,
}

impl DeliveryReport {
    fn record(&mut self, signals: &SignalHub, err: AnalyticsError) {
        signals.error(&err);
        self.errors.push(err);
    }
}

/// Sends a dispatch through the transport.
///
/// Every failure is signalled as it happens. A 401 answer is signalled, then
/// makes the transport refresh its credential; if it did, the same snapshot
/// is sent exactly once more. The replay's outcome is reported but never
/// retried.
pub async fn deliver(transport: &dyn Transport, dispatch: &Dispatch, signals: &SignalHub) -> DeliveryReport {
    let mut report = DeliveryReport {
        id: Uuid::new_v4(),
        attempts: 0,
        delivered: false,
        errors: Vec::new(),
    };

    let body = match dispatch.encode() {
        Ok(body) => body,
        Err(err) => {
            report.record(signals, err.context("While reporting events, caught "));
            return report;
        }
    };
    let path = transport.events_path(dispatch);

    tracing::debug!(
        id = %report.id,
        path = %path,
        count = dispatch.event_count(),
        kind = ?dispatch.kind(),
        "Posting events"
    );

    report.attempts += 1;
    let err = match post_events(transport, &path, &body).await {
        Ok(()) => {
            report.delivered = true;
            return report;
        }
        Err(err) => err,
    };

    let unauthorized = err.status_code() == Some(401);
    report.record(signals, err);

    if !unauthorized {
        return report;
    }

    match transport.refresh_credential().await {
        Ok(true) => {
            tracing::info!(
                id = %report.id,
                kind = ?dispatch.kind(),
                "Received 401 Unauthorized while posting events; retrying with a refreshed token"
            );
            report.attempts += 1;
            match post_events(transport, &path, &body).await {
                Ok(()) => report.delivered = true,
                Err(err) => report.record(signals, err),
            }
        }
        Ok(false) => {}
        Err(err) => report.record(signals, err),
    }

    report
}

async fn post_events(transport: &dyn Transport, path: &str, body: &str) -> AnalyticsResult<()> {
    let options = transport
        .request_options(Method::POST, path)
        .with_content_type(CONTENT_TYPE_EVENTS);

    let response = transport
        .request(options, Some(body.to_string()))
        .await
        .map_err(|err| err.context("Error while reporting events: "))?;

    response.expect(200, Some(201), "after posting events")?;
    Ok(())
}
