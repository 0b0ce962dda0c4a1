//! # Beacon Analytics
//!
//! Telemetry event pipeline for authenticated HTTP services providing:
//! - In-memory buffering of events grouped by event type
//! - Validation against event type schemas loaded from the search index
//! - Periodic delivery as single documents or bulk requests
//! - Direct, proxy (bearer token) and local backends
//! - Network transaction timing and ad hoc search queries
//!
//! ## Example
//!
//! ```rust,ignore
//! use beacon_analytics::{AnalyticsConfig, AnalyticsEmitter};
//!
//! let emitter = AnalyticsEmitter::builder(AnalyticsConfig::local()).build()?;
//!
//! emitter.report_event("Bob", serde_json::json!({ "a": 1, "b": "x" }));
//!
//! let mut signals = emitter.subscribe();
//! while let Ok(signal) = signals.recv().await {
//!     println!("{:?}", signal);
//! }
//! ```

mod buffer;
mod config;
mod dispatch;
mod emitter;
mod error;
mod event;
mod network;
mod signal;
mod token;
pub mod schema;
pub mod transport;

pub use buffer::{EventBuffer, FlushOutcome, TypeBucket, DEFAULT_MIN_BATCH};
pub use config::{AnalyticsConfig, ENV_ENABLE, ENV_INTERNAL_SIGNALS, ENV_PROXY_URL_OVERRIDE, ENV_VCAP_SERVICES};
pub use dispatch::{deliver, DeliveryReport, Dispatch, DispatchKind};
pub use emitter::{AnalyticsEmitter, AnalyticsEmitterBuilder, QueryOverrides};
pub use error::{AnalyticsError, AnalyticsResult};
pub use event::{current_timestamp, into_event, stamp, BufferedEvent, TIMESTAMP};
pub use network::{NetworkContext, NETWORK_EVENT_TYPE};
pub use schema::{EventTypeSchema, SchemaLoader, SchemaRegistry, SchemaState};
pub use signal::{AnalyticsSignal, SignalHub};
pub use token::{FnTokenProvider, StaticTokenProvider, TokenFuture, TokenProvider};
pub use transport::{Transport, TransportMode};
