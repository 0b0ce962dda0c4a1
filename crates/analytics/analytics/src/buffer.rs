//! In-memory event buffer.
//!
//! Events are grouped into one bucket per event type, in the order the types
//! first appeared. A flush validates every bucket against the schema
//! registry, then moves what survives out of the buffer as a [`Dispatch`].
//!
//! The buffer itself is a plain owned aggregate. The emitter guards it with a
//! single mutex, and exactly [`EventBuffer::add_one`],
//! [`EventBuffer::add_many`], [`EventBuffer::flush`] and
//! [`EventBuffer::clear`] run under that lock.

use std::collections::HashMap;

use crate::dispatch::Dispatch;
use crate::error::AnalyticsError;
use crate::event::BufferedEvent;
use crate::schema::SchemaRegistry;

/// Below this many events, a flush may be deferred once.
pub const DEFAULT_MIN_BATCH: usize = 10;

/// The buffered events of one type, in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeBucket {
    /// Event type name.
    pub event_type: String,
    /// Events of that type.
    pub events: Vec<BufferedEvent>,
}

impl TypeBucket {
    /// Creates an empty bucket.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            events: Vec::new(),
        }
    }

    /// Returns the number of events in the bucket.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Checks if the bucket holds no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// What a flush decided to do.
#[derive(Debug)]
pub enum FlushOutcome {
    /// Nothing was buffered.
    Idle,
    /// Too few events; the flush was skipped to let more accumulate.
    Deferred {
        /// Events left waiting.
        pending: usize,
    },
    /// Validation removed every event.
    AllInvalid {
        /// One error per removed bucket or event.
        errors: Vec<AnalyticsError>,
    },
    /// Events are ready to send. The buffer is already empty.
    Dispatch {
        /// The snapshot to deliver.
        dispatch: Dispatch,
        /// One error per removed bucket or event.
        errors: Vec<AnalyticsError>,
    },
}

/// Buffer of events waiting for the next flush.
#[derive(Debug)]
pub struct EventBuffer {
    buckets: Vec<TypeBucket>,
    index: HashMap<String, usize>,
    count: usize,
    can_delay: bool,
    min_batch: usize,
}

impl EventBuffer {
    /// Creates an empty buffer with the default deferral threshold.
    pub fn new() -> Self {
        Self::with_min_batch(DEFAULT_MIN_BATCH)
    }

    /// Creates an empty buffer with a custom deferral threshold.
    pub fn with_min_batch(min_batch: usize) -> Self {
        Self {
            buckets: Vec::new(),
            index: HashMap::new(),
            count: 0,
            can_delay: true,
            min_batch,
        }
    }

    /// Appends one event to its type's bucket.
    pub fn add_one(&mut self, event_type: &str, event: BufferedEvent) {
        self.bucket_mut(event_type).events.push(event);
        self.count += 1;

        tracing::trace!(event_type, count = self.count, "Buffered event");
    }

    /// Appends a sequence of events of the same type, keeping their order.
    pub fn add_many(&mut self, event_type: &str, events: Vec<BufferedEvent>) {
        if events.is_empty() {
            return;
        }

        let added = events.len();
        self.bucket_mut(event_type).events.extend(events);
        self.count += added;

        tracing::trace!(event_type, added, count = self.count, "Buffered events");
    }

    /// Removes every event and returns how many were discarded.
    pub fn clear(&mut self) -> usize {
        let discarded = self.count;
        self.buckets.clear();
        self.index.clear();
        self.count = 0;
        discarded
    }

    /// Returns the total number of buffered events.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Checks if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns the number of type buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Gets the bucket of a type.
    pub fn bucket(&self, event_type: &str) -> Option<&TypeBucket> {
        self.index.get(event_type).map(|&i| &self.buckets[i])
    }

    /// Returns the buckets in first-seen order.
    pub fn buckets(&self) -> &[TypeBucket] {
        &self.buckets
    }

    /// Checks if the next under-sized flush may still be deferred.
    pub fn can_delay(&self) -> bool {
        self.can_delay
    }

    /// Removes unknown types and structurally invalid events.
    ///
    /// Values are never touched; only property names are checked against
    /// the type's allowed set. Returns one error per removed bucket or event.
    pub fn validate(&mut self, registry: &SchemaRegistry) -> Vec<AnalyticsError> {
        let mut errors = Vec::new();
        let mut removed = 0;

        for bucket in &mut self.buckets {
            let Some(schema) = registry.get(&bucket.event_type) else {
                errors.push(AnalyticsError::UnknownType(bucket.event_type.clone()));
                removed += bucket.events.len();
                bucket.events.clear();
                continue;
            };

            bucket.events.retain(|event| match check_event(event, &schema) {
                Ok(()) => true,
                Err(err) => {
                    errors.push(err);
                    removed += 1;
                    false
                }
            });
        }

        if removed > 0 {
            self.count -= removed;
            self.buckets.retain(|bucket| !bucket.is_empty());
            self.reindex();
        }

        errors
    }

    /// Runs one flush step.
    ///
    /// An under-sized buffer is deferred once per accumulation window; the
    /// next call proceeds regardless of the count. Proceeding validates the
    /// buffer and moves the surviving buckets out, so the buffer is empty
    /// when this returns anything other than `Deferred`.
    pub fn flush(&mut self, registry: &SchemaRegistry) -> FlushOutcome {
        if self.is_empty() {
            return FlushOutcome::Idle;
        }

        if self.count < self.min_batch && self.can_delay {
            self.can_delay = false;
            return FlushOutcome::Deferred {
                pending: self.count,
            };
        }

        self.can_delay = true;

        let errors = self.validate(registry);
        let buckets = std::mem::take(&mut self.buckets);
        self.clear();

        match Dispatch::from_buckets(buckets) {
            Some(dispatch) => FlushOutcome::Dispatch { dispatch, errors },
            None => FlushOutcome::AllInvalid { errors },
        }
    }

    fn bucket_mut(&mut self, event_type: &str) -> &mut TypeBucket {
        let i = match self.index.get(event_type) {
            Some(&i) => i,
            None => {
                self.buckets.push(TypeBucket::new(event_type));
                let i = self.buckets.len() - 1;
                self.index.insert(event_type.to_string(), i);
                i
            }
        };
        &mut self.buckets[i]
    }

    fn reindex(&mut self) {
        self.index = self
            .buckets
            .iter()
            .enumerate()
            .map(|(i, bucket)| (bucket.event_type.clone(), i))
            .collect();
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn check_event(
    event: &BufferedEvent,
    schema: &crate::schema::EventTypeSchema,
) -> Result<(), AnalyticsError> {
    let event_properties = || event.keys().map(String::as_str).collect::<Vec<_>>().join(",");

    if event.len() > schema.len() {
        return Err(AnalyticsError::TooManyProperties {
            event_type: schema.name.clone(),
            event_properties: event_properties(),
            type_properties: schema.property_list(),
        });
    }

    if let Some(property) = event.keys().find(|key| !schema.allows(key)) {
        return Err(AnalyticsError::DisallowedProperty {
            property: property.clone(),
            event_type: schema.name.clone(),
            event_properties: event_properties(),
            type_properties: schema.property_list(),
        });
    }

    Ok(())
}
