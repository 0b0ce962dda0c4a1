//! Analytics error types.

use thiserror::Error;

/// Result type for analytics operations.
pub type AnalyticsResult<T> = Result<T, AnalyticsError>;

/// Error type for the analytics pipeline.
///
/// The `Display` output of each variant is the operational message surfaced
/// on the emitter's signal channel, so the wording is part of the contract.
#[derive(Debug, Error)]
pub enum AnalyticsError {
    /// Missing or malformed setting.
    #[error("{0}")]
    Config(String),

    /// Event types could not be loaded.
    #[error("Error loading analytics event types. load_attempt: {attempt}")]
    SchemaLoad {
        /// Zero-based attempt counter.
        attempt: u64,
    },

    /// Buffered events were dropped because the event types are unknown.
    #[error("Analytic events were lost because of a failure to load event types. Lost events: {0}")]
    EventsLost(usize),

    /// The event type is not in the registry.
    #[error("{0} is not a known event type.")]
    UnknownType(String),

    /// The event carries a property its type does not declare.
    #[error(
        "An event has property \"{property}\" which is not in its type, {event_type}. \
         Event properties: [{event_properties}]. {event_type} properties: [{type_properties}]."
    )]
    DisallowedProperty {
        /// The offending property.
        property: String,
        /// Event type name.
        event_type: String,
        /// Comma separated event property names.
        event_properties: String,
        /// Comma separated allowed property names.
        type_properties: String,
    },

    /// The event has more properties than its type allows.
    #[error(
        "An event has more properties than its type, {event_type}. \
         Event properties: [{event_properties}]. {event_type} properties: [{type_properties}]."
    )]
    TooManyProperties {
        /// Event type name.
        event_type: String,
        /// Comma separated event property names.
        event_properties: String,
        /// Comma separated allowed property names.
        type_properties: String,
    },

    /// The backend answered with an unexpected status code.
    #[error("Got statusCode {code} {description}.\n{body}")]
    Status {
        /// HTTP status code.
        code: u16,
        /// What the request was doing.
        description: String,
        /// Response body.
        body: String,
    },

    /// Network level failure.
    #[error("{0}")]
    Transport(String),

    /// JSON serialization or parsing failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A network transaction context is malformed.
    #[error("{0}")]
    InvalidContext(String),

    /// A reported event is not a JSON object.
    #[error("{0}")]
    InvalidEvent(String),

    /// A query was refused by the safety gate.
    #[error("run_query: Requires test overrides when running in public org.")]
    QueryRefused,

    /// The token provider failed.
    #[error("{0}")]
    Token(String),
}

impl AnalyticsError {
    /// Returns the HTTP status code for status errors.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            AnalyticsError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Wraps the error message with a prefix, keeping it a transport error.
    pub fn context(self, prefix: &str) -> Self {
        AnalyticsError::Transport(format!("{}{}", prefix, self))
    }
}

impl From<serde_json::Error> for AnalyticsError {
    fn from(err: serde_json::Error) -> Self {
        AnalyticsError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for AnalyticsError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AnalyticsError::Transport(format!("request timed out: {}", err))
        } else {
            AnalyticsError::Transport(err.to_string())
        }
    }
}
