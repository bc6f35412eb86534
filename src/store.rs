//! # Event Store
//!
//! Durable append/query of events lives behind the [`EventStore`] trait. The
//! router and correlator only ever see this contract, so production backends
//! (a time-series database, a log-structured file store) swap in without
//! touching dispatch or correlation code. [`InMemoryEventStore`] is the
//! reference implementation: a keyed map with no eviction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;

use crate::event::{Event, EventId};

/// Exact-match and time-range criteria for [`EventStore::query_events`].
///
/// Unset fields do not constrain the result. Backends without time support
/// ignore the time bounds rather than erroring.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub event_type: Option<String>,
    pub source: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<EventId>,
    pub is_replay: Option<bool>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
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

    pub fn is_replay(mut self, is_replay: bool) -> Self {
        self.is_replay = Some(is_replay);
        self
    }

    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Field-equality and time-bound check used by in-process backends.
    pub fn accepts(&self, event: &Event) -> bool {
        if let Some(event_type) = &self.event_type {
            if event.event_type != *event_type {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if event.source != *source {
                return false;
            }
        }
        if let Some(correlation_id) = &self.correlation_id {
            if event.correlation_id.as_deref() != Some(correlation_id.as_str()) {
                return false;
            }
        }
        if let Some(causation_id) = &self.causation_id {
            if event.causation_id != Some(*causation_id) {
                return false;
            }
        }
        if let Some(is_replay) = self.is_replay {
            if event.is_replay != is_replay {
                return false;
            }
        }
        if let Some(start) = &self.start_time {
            if event.timestamp < *start {
                return false;
            }
        }
        if let Some(end) = &self.end_time {
            if event.timestamp > *end {
                return false;
            }
        }
        true
    }
}

/// Contract for durable event persistence.
///
/// `store` is an idempotent append: writing an id that already exists must
/// not duplicate the record. Queries return an empty sequence, never an
/// error, when nothing matches.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn store(&self, event: Event) -> StoreResult<()>;

    async fn get_event_by_id(&self, id: &EventId) -> StoreResult<Option<Event>>;

    /// Matching events ordered by creation sequence.
    async fn query_events(&self, filter: &QueryFilter) -> StoreResult<Vec<Event>>;

    async fn event_count(&self, filter: &QueryFilter) -> StoreResult<usize> {
        Ok(self.query_events(filter).await?.len())
    }

    /// Removes every stored event, returning how many were dropped.
    async fn clear(&self) -> StoreResult<usize>;
}

/// Reference store: concurrent keyed map, no eviction.
///
/// Duplicate ids are a no-op (the first write wins); this keeps replays and
/// the correlator's re-published enriched copies from duplicating records.
#[derive(Default)]
pub struct InMemoryEventStore {
    events: DashMap<EventId, Event>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn store(&self, event: Event) -> StoreResult<()> {
        self.events.entry(event.id).or_insert(event);
        Ok(())
    }

    async fn get_event_by_id(&self, id: &EventId) -> StoreResult<Option<Event>> {
        Ok(self.events.get(id).map(|entry| entry.clone()))
    }

    async fn query_events(&self, filter: &QueryFilter) -> StoreResult<Vec<Event>> {
        let mut matches: Vec<Event> = self
            .events
            .iter()
            .filter(|entry| filter.accepts(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        matches.sort_by_key(|event| event.sequence);
        if let Some(limit) = filter.limit {
            matches.truncate(limit);
        }
        Ok(matches)
    }

    async fn clear(&self) -> StoreResult<usize> {
        let removed = self.events.len();
        self.events.clear();
        Ok(removed)
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend error: {message}")]
    Backend { message: String },

    #[error("store unavailable: {message}")]
    Unavailable { message: String },
}

impl StoreError {
    pub fn backend<S: Into<String>>(message: S) -> Self {
        StoreError::Backend {
            message: message.into(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Value;
    use pretty_assertions::assert_eq;

    fn stored_event(event_type: &str) -> Event {
        Event::builder()
            .event_type(event_type)
            .source("unit")
            .payload_entry("k", Value::from("v"))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_round_trip() {
        let store = InMemoryEventStore::new();
        let event = stored_event("build.failure");

        store.store(event.clone()).await.unwrap();
        let loaded = store.get_event_by_id(&event.id).await.unwrap();
        assert_eq!(loaded, Some(event));
    }

    #[tokio::test]
    async fn test_duplicate_store_is_noop() {
        let store = InMemoryEventStore::new();
        let event = stored_event("build.failure");

        store.store(event.clone()).await.unwrap();
        let mut altered = event.clone();
        altered
            .payload
            .insert("k".to_string(), Value::from("changed"));
        store.store(altered).await.unwrap();

        assert_eq!(store.len(), 1);
        // first write wins
        let loaded = store.get_event_by_id(&event.id).await.unwrap().unwrap();
        assert_eq!(loaded.payload.get("k"), Some(&Value::from("v")));
    }

    #[tokio::test]
    async fn test_query_by_type() {
        let store = InMemoryEventStore::new();
        let failure_a = stored_event("build.failure");
        let failure_b = stored_event("build.failure");
        let success = stored_event("build.success");
        for event in [&failure_a, &failure_b, &success] {
            store.store((*event).clone()).await.unwrap();
        }

        let failures = store
            .query_events(&QueryFilter::new().event_type("build.failure"))
            .await
            .unwrap();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].id, failure_a.id);
        assert_eq!(failures[1].id, failure_b.id);

        // nothing matching is an empty result, not an error
        let none = store
            .query_events(&QueryFilter::new().event_type("deploy.finished"))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_query_by_correlation_and_time() {
        let store = InMemoryEventStore::new();
        let correlated = stored_event("a").with_correlation_id("corr_000000000abc");
        let other = stored_event("b");
        store.store(correlated.clone()).await.unwrap();
        store.store(other.clone()).await.unwrap();

        let chain = store
            .query_events(&QueryFilter::new().correlation_id("corr_000000000abc"))
            .await
            .unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].id, correlated.id);

        let window = store
            .query_events(&QueryFilter::new().between(
                correlated.timestamp - chrono::Duration::seconds(1),
                correlated.timestamp + chrono::Duration::seconds(1),
            ))
            .await
            .unwrap();
        assert_eq!(window.len(), 2);

        let past = store
            .query_events(&QueryFilter::new().between(
                correlated.timestamp - chrono::Duration::hours(2),
                correlated.timestamp - chrono::Duration::hours(1),
            ))
            .await
            .unwrap();
        assert!(past.is_empty());
    }

    #[tokio::test]
    async fn test_limit_and_count() {
        let store = InMemoryEventStore::new();
        for _ in 0..5 {
            store.store(stored_event("tick")).await.unwrap();
        }

        let limited = store
            .query_events(&QueryFilter::new().event_type("tick").limit(3))
            .await
            .unwrap();
        assert_eq!(limited.len(), 3);

        let count = store
            .event_count(&QueryFilter::new().event_type("tick"))
            .await
            .unwrap();
        assert_eq!(count, 5);

        assert_eq!(store.clear().await.unwrap(), 5);
        assert!(store.is_empty());
    }
}
