//! Buffered event representation.

use serde_json::{Map, Value};

use crate::error::{AnalyticsError, AnalyticsResult};

/// Property name carrying the ingestion time in milliseconds since the epoch.
pub const TIMESTAMP: &str = "timestamp";

/// A property bag owned by the buffer until it is flushed or discarded.
pub type BufferedEvent = Map<String, Value>;

/// Returns the current time in milliseconds since the Unix epoch.
pub fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Converts a JSON value into an event, rejecting anything but an object.
pub fn into_event(value: Value) -> AnalyticsResult<BufferedEvent> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(AnalyticsError::InvalidEvent(format!(
            "event must be a JSON object, it was: {}",
            json_kind(&other)
        ))),
    }
}

/// Stamps the event with the given timestamp, replacing any existing value.
pub fn stamp(event: &mut BufferedEvent, timestamp: i64) {
    event.insert(TIMESTAMP.to_string(), Value::from(timestamp));
}

/// Returns the JSON type name of a value, as used in error messages.
pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
