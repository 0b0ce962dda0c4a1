//! Event type schemas.
//!
//! Provides the registry of known event types and the loader that keeps it
//! populated:
//! - Property-name membership checks (no value typing)
//! - Wholesale replacement on every successful load
//! - Fixed-backoff reloads that never give up

mod loader;
mod registry;

pub use loader::{SchemaLoader, DEFAULT_SCHEMA_RETRY};
pub use registry::{EventTypeSchema, SchemaRegistry, SchemaState};
