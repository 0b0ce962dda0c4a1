use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Readiness of the registry, which gates the flush timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaState {
    /// No load has been attempted yet.
    Unloaded,
    /// A load is in flight or waiting for its retry.
    Loading,
    /// Types are known and events may be flushed.
    Ready,
}

/// The allowed property names of one event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTypeSchema {
    /// Event type name.
    pub name: String,
    /// Allowed property names, in mapping order.
    pub properties: Vec<String>,
}

impl EventTypeSchema {
    /// Creates a schema from a name and property names.
    pub fn new<I, S>(name: impl Into<String>, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = Vec::new();
        for property in properties {
            let property = property.into();
            if !names.contains(&property) {
                names.push(property);
            }
        }

        Self {
            name: name.into(),
            properties: names,
        }
    }

    /// Checks whether a property is allowed.
    pub fn allows(&self, property: &str) -> bool {
        self.properties.iter().any(|allowed| allowed == property)
    }

    /// Returns the number of allowed properties.
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// Checks if the type allows no properties at all.
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Returns the allowed properties joined with commas.
    pub fn property_list(&self) -> String {
        self.properties
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Registry of known event types.
pub struct SchemaRegistry {
    types: RwLock<HashMap<String, EventTypeSchema>>,
    state: RwLock<SchemaState>,
}

impl SchemaRegistry {
    /// Creates an empty, unloaded registry.
    pub fn new() -> Self {
        Self {
            types: RwLock::new(HashMap::new()),
            state: RwLock::new(SchemaState::Unloaded),
        }
    }

    /// Creates a ready registry holding the given schemas.
    pub fn with_types(types: impl IntoIterator<Item = EventTypeSchema>) -> Self {
        let registry = Self::new();
        registry.replace(types);
        registry
    }

    /// Replaces every known type and marks the registry ready.
    pub fn replace(&self, types: impl IntoIterator<Item = EventTypeSchema>) {
        let map = types
            .into_iter()
            .map(|schema| (schema.name.clone(), schema))
            .collect::<HashMap<_, _>>();

        tracing::info!(count = map.len(), "Loaded event types");

        *self.types.write() = map;
        *self.state.write() = SchemaState::Ready;
    }

    /// Replaces every known type from a backend mapping document.
    ///
    /// The mapping has the shape `{type: {properties: {name: {...}}}}`. Types
    /// without a `properties` object are skipped.
    pub fn replace_from_mapping(&self, mapping: &Map<String, Value>) {
        self.replace(Self::parse_mapping(mapping));
    }

    /// Extracts schemas from a backend mapping document.
    pub fn parse_mapping(mapping: &Map<String, Value>) -> Vec<EventTypeSchema> {
        mapping
            .iter()
            .filter_map(|(name, definition)| {
                let properties = definition.get("properties")?.as_object()?;
                Some(EventTypeSchema::new(name.clone(), properties.keys().cloned()))
            })
            .collect()
    }

    /// Gets a schema by type name.
    pub fn get(&self, name: &str) -> Option<EventTypeSchema> {
        self.types.read().get(name).cloned()
    }

    /// Checks if a type is known.
    pub fn contains(&self, name: &str) -> bool {
        self.types.read().contains_key(name)
    }

    /// Returns all known type names, sorted.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the number of known types.
    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    /// Checks if no type is known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the readiness state.
    pub fn state(&self) -> SchemaState {
        *self.state.read()
    }

    /// Checks if the registry is ready.
    pub fn is_ready(&self) -> bool {
        self.state() == SchemaState::Ready
    }

    /// Marks a load as in flight. Known types stay usable for validation.
    pub fn mark_loading(&self) {
        *self.state.write() = SchemaState::Loading;
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}
