//! # Event Model
//!
//! Events are the fundamental unit of communication in eventweave. An [`Event`]
//! is an immutable record of something that happened, carrying a type tag used
//! for routing, the identity of its producer, and an open payload that pattern
//! matching filters against.
//!
//! ## Identity and Ordering
//!
//! Every event receives a v4 UUID at construction; ids are never reused. Wall
//! clock timestamps are not monotonic, so each event additionally carries a
//! process-wide `sequence` number that gives a stable total order for events
//! created inside one process.
//!
//! ## Correlation
//!
//! Related events share a `correlation_id`. The first event of a causal chain
//! is usually published without one; the correlator assigns an id and
//! re-publishes an enriched copy (see [`crate::correlator`]). Because events
//! are immutable, enrichment always produces a *new* value — the original is
//! never mutated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier of a single event.
pub type EventId = Uuid;

// Process-wide ordering counter. Monotonic for the process lifetime.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn next_sequence() -> u64 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Payload value type.
///
/// Payloads and metadata are open mappings from attribute name to `Value`.
/// Pattern attribute constraints compare values by equality only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    List(Vec<Value>),
    Duration(Duration),
    Map(HashMap<String, Value>),
    Null,
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<Duration> for Value {
    fn from(value: Duration) -> Self {
        Value::Duration(value)
    }
}

/// # Event
///
/// Immutable record flowing through the router. Construct with [`Event::new`]
/// for the common case or [`Event::builder`] when payload, metadata or chain
/// identifiers are needed up front.
///
/// ## Example
///
/// ```rust,no_run
/// use eventweave::event::{Event, Value};
///
/// let event = Event::builder()
///     .event_type("build.failure")
///     .source("ci")
///     .payload_entry("severity", Value::from("high"))
///     .build()
///     .unwrap();
/// assert!(event.correlation_id.is_none());
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique id, assigned at construction and never reused
    pub id: EventId,
    /// Category tag used for routing, e.g. `"build.failure"`
    pub event_type: String,
    /// Identifier of the producing component
    pub source: String,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Process-monotonic ordering counter
    pub sequence: u64,
    /// Identifier shared by all events of one causal chain
    pub correlation_id: Option<String>,
    /// Id of the event that directly caused this one
    pub causation_id: Option<EventId>,
    /// Event content; the attribute space pattern matching filters against
    pub payload: HashMap<String, Value>,
    /// Transport and bookkeeping data, never matched against
    pub metadata: HashMap<String, Value>,
    /// Marks replayed historical events; side-effecting handlers skip these
    pub is_replay: bool,
}

impl Event {
    /// Creates an event with the given type and source and empty payload.
    ///
    /// Both strings must be non-empty; use [`Event::builder`] when the inputs
    /// are not statically known.
    pub fn new(event_type: &str, source: &str) -> Self {
        debug_assert!(!event_type.is_empty() && !source.is_empty());
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            source: source.to_string(),
            timestamp: Utc::now(),
            sequence: next_sequence(),
            correlation_id: None,
            causation_id: None,
            payload: HashMap::new(),
            metadata: HashMap::new(),
            is_replay: false,
        }
    }

    pub fn builder() -> EventBuilder {
        EventBuilder::new()
    }

    /// Returns an enriched copy carrying the given correlation id.
    ///
    /// Identity (`id`, `sequence`, `timestamp`) and content are preserved;
    /// only `correlation_id` differs. The receiver is left untouched.
    pub fn with_correlation_id(&self, correlation_id: &str) -> Self {
        let mut enriched = self.clone();
        enriched.correlation_id = Some(correlation_id.to_string());
        enriched
    }

    /// Creates a follow-up event that continues this event's causal chain.
    ///
    /// The derived event gets a fresh id, `causation_id` pointing at this
    /// event, and this event's correlation id (or, when none was assigned
    /// yet, this event's own id as the chain key).
    pub fn derive(&self, event_type: &str) -> Self {
        let mut derived = Event::new(event_type, &self.source);
        derived.correlation_id = Some(
            self.correlation_id
                .clone()
                .unwrap_or_else(|| self.id.to_string()),
        );
        derived.causation_id = Some(self.id);
        derived.metadata = self.metadata.clone();
        derived
    }

    pub fn to_json(&self) -> EventResult<String> {
        serde_json::to_string(self).map_err(|e| EventError::Serialization {
            message: e.to_string(),
        })
    }

    pub fn from_json(json: &str) -> EventResult<Self> {
        serde_json::from_str(json).map_err(|e| EventError::Serialization {
            message: e.to_string(),
        })
    }
}

/// Builder for [`Event`], validating required fields at `build` time.
#[derive(Default, Clone)]
pub struct EventBuilder {
    event_type: Option<String>,
    source: Option<String>,
    correlation_id: Option<String>,
    causation_id: Option<EventId>,
    payload: HashMap<String, Value>,
    metadata: HashMap<String, Value>,
    is_replay: bool,
}

impl EventBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn event_type(mut self, event_type: &str) -> Self {
        self.event_type = Some(event_type.to_string());
        self
    }

    pub fn source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub fn correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    pub fn causation_id(mut self, causation_id: EventId) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    pub fn payload(mut self, payload: HashMap<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn payload_entry(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    pub fn metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn metadata_entry(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn replay(mut self) -> Self {
        self.is_replay = true;
        self
    }

    pub fn build(self) -> EventResult<Event> {
        let event_type = self
            .event_type
            .filter(|t| !t.is_empty())
            .ok_or(EventError::BuilderFailed(
                "event_type is required".to_string(),
            ))?;
        let source = self
            .source
            .filter(|s| !s.is_empty())
            .ok_or(EventError::BuilderFailed("source is required".to_string()))?;

        Ok(Event {
            id: Uuid::new_v4(),
            event_type,
            source,
            timestamp: Utc::now(),
            sequence: next_sequence(),
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            payload: self.payload,
            metadata: self.metadata,
            is_replay: self.is_replay,
        })
    }
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("event builder failed: {0}")]
    BuilderFailed(String),

    #[error("event serialization failed: {message}")]
    Serialization { message: String },
}

pub type EventResult<T> = Result<T, EventError>;
