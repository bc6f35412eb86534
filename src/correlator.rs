//! # Event Correlator
//!
//! The [`EventCorrelator`] observes every event flowing through the router
//! (it attaches itself as a permanent universal-wildcard subscription) and
//! groups events sharing a `correlation_id`. When a group satisfies the
//! configured [`CompletionRule`], a summary event is synthesized and
//! re-published, and the group's buffered state is discarded.
//!
//! ## Enrichment
//!
//! Events without a `correlation_id` are bootstrapped into traceable chains:
//! the correlator generates a fresh id and re-publishes an enriched copy
//! (same event id, same content). Downstream consumers treat the enriched
//! copy as the start of a new causal chain; the bare original is neither
//! grouped nor persisted.
//!
//! ## Group Lifetime
//!
//! A group is open from the first observation of its key until completion;
//! completion removes it, and a later event under the same key starts a brand
//! new group. Groups that never complete are reclaimed by the expiry sweep
//! (see [`EventCorrelator::start_sweep`]) instead of leaking.
//!
//! ## Durability
//!
//! Every grouped event and every summary is appended to the configured
//! [`EventStore`]. A store failure degrades durability, not routing: the
//! correlator logs a warning and keeps correlating in memory.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use crate::config::{CorrelatorConfig, SweepConfig};
use crate::event::{Event, EventId, Value};
use crate::router::{EventRouter, RouterResult};
use crate::store::{EventStore, QueryFilter, StoreError};
use crate::subscription::{handler_fn, HandlerError, HandlerResult, SubscriptionId};
use crate::pattern::EventPattern;

/// Event type of the summary synthesized when a group completes.
pub const CORRELATION_COMPLETED_EVENT: &str = "correlation.completed";

/// Source identifier stamped on synthesized summary events.
const CORRELATOR_SOURCE: &str = "correlator";

/// In-memory accumulation of one correlation chain, pending completion.
#[derive(Debug, Clone)]
pub struct CorrelationGroup {
    pub correlation_id: String,
    pub root_event_id: EventId,
    pub events: Vec<Event>,
    pub created_at: Instant,
    pub last_touched: Instant,
}

impl CorrelationGroup {
    fn new(correlation_id: &str, root_event_id: EventId) -> Self {
        let now = Instant::now();
        Self {
            correlation_id: correlation_id.to_string(),
            root_event_id,
            events: Vec::new(),
            created_at: now,
            last_touched: now,
        }
    }

    /// Appends an event, ignoring ids already present in the group.
    fn add_event(&mut self, event: Event) {
        self.last_touched = Instant::now();
        if !self.events.iter().any(|e| e.id == event.id) {
            self.events.push(event);
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Pluggable decision of when a group is done accumulating.
pub trait CompletionRule: Send + Sync {
    fn is_complete(&self, group: &CorrelationGroup) -> bool;
}

/// Default rule: complete once the group holds at least `threshold` events.
pub struct MinEventsRule {
    pub threshold: usize,
}

impl MinEventsRule {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }
}

impl CompletionRule for MinEventsRule {
    fn is_complete(&self, group: &CorrelationGroup) -> bool {
        group.len() >= self.threshold
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelatorStats {
    pub open_groups: usize,
    pub events_enriched: u64,
    pub summaries_emitted: u64,
    pub groups_expired: u64,
}

/// # EventCorrelator
///
/// Stateful grouping of correlated events. Group mutation is keyed by
/// correlation id through a concurrent map, so unrelated chains never
/// contend while concurrent events of one chain serialize per key.
pub struct EventCorrelator {
    groups: DashMap<String, CorrelationGroup>,
    rule: Box<dyn CompletionRule>,
    store: Option<Arc<dyn EventStore>>,
    router: RwLock<Option<Weak<EventRouter>>>,
    config: CorrelatorConfig,
    sweep_running: AtomicBool,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
    events_enriched: AtomicU64,
    summaries_emitted: AtomicU64,
    groups_expired: AtomicU64,
}

impl EventCorrelator {
    pub fn new(config: CorrelatorConfig) -> Self {
        let rule = Box::new(MinEventsRule::new(config.completion_threshold));
        Self {
            groups: DashMap::new(),
            rule,
            store: None,
            router: RwLock::new(None),
            config,
            sweep_running: AtomicBool::new(false),
            sweep_handle: Mutex::new(None),
            events_enriched: AtomicU64::new(0),
            summaries_emitted: AtomicU64::new(0),
            groups_expired: AtomicU64::new(0),
        }
    }

    pub fn with_store(config: CorrelatorConfig, store: Arc<dyn EventStore>) -> Self {
        let mut correlator = Self::new(config);
        correlator.store = Some(store);
        correlator
    }

    /// Replaces the completion rule. Call before `attach`.
    pub fn with_rule(mut self, rule: Box<dyn CompletionRule>) -> Self {
        self.rule = rule;
        self
    }

    /// Installs this correlator as a permanent universal-wildcard
    /// subscription on the router and returns the subscription id.
    pub async fn attach(
        self: Arc<Self>,
        router: &Arc<EventRouter>,
    ) -> RouterResult<SubscriptionId> {
        *self.router.write().await = Some(Arc::downgrade(router));
        let correlator = self.clone();
        router
            .subscribe(
                EventPattern::any(),
                handler_fn(move |event| {
                    let correlator = correlator.clone();
                    async move { correlator.observe(event).await }
                }),
            )
            .await
    }

    /// Records one observed event.
    ///
    /// Replayed events are skipped entirely; summaries are persisted but
    /// never grouped (a summary must not feed a new group under its own
    /// key); uncorrelated events are enriched and re-published.
    #[instrument(skip(self, event), fields(event_type = %event.event_type, event_id = %event.id))]
    pub async fn observe(&self, event: Event) -> HandlerResult<()> {
        if event.is_replay {
            trace!("skipping replayed event");
            return Ok(());
        }
        if event.event_type == CORRELATION_COMPLETED_EVENT {
            self.persist(&event).await;
            return Ok(());
        }

        let correlation_id = match &event.correlation_id {
            None => {
                let correlation_id = generate_correlation_id();
                let enriched = event.with_correlation_id(&correlation_id);
                self.events_enriched.fetch_add(1, Ordering::Relaxed);
                debug!(%correlation_id, "enriching uncorrelated event");
                self.republish(enriched).await?;
                return Ok(());
            }
            Some(correlation_id) => correlation_id.clone(),
        };

        self.persist(&event).await;

        let completed = {
            let mut group = self
                .groups
                .entry(correlation_id.clone())
                .or_insert_with(|| CorrelationGroup::new(&correlation_id, event.id));
            group.add_event(event);
            if self.rule.is_complete(&group) {
                Some(group.events.clone())
            } else {
                None
            }
        };

        if let Some(events) = completed {
            self.groups.remove(&correlation_id);
            let summary = self.build_summary(&correlation_id, &events);
            self.summaries_emitted.fetch_add(1, Ordering::Relaxed);
            debug!(
                correlation_id = %correlation_id,
                event_count = events.len(),
                "correlation group completed"
            );
            self.republish(summary).await?;
        }
        Ok(())
    }

    fn build_summary(&self, correlation_id: &str, events: &[Event]) -> Event {
        let mut summary = Event::new(CORRELATION_COMPLETED_EVENT, CORRELATOR_SOURCE);
        summary.correlation_id = Some(correlation_id.to_string());
        summary.causation_id = events.last().map(|event| event.id);
        summary.payload.insert(
            "event_ids".to_string(),
            Value::List(
                events
                    .iter()
                    .map(|event| Value::from(event.id.to_string()))
                    .collect(),
            ),
        );
        summary.payload.insert(
            "event_count".to_string(),
            Value::from(events.len() as i64),
        );
        summary.payload.insert(
            "summary".to_string(),
            Value::from(format!(
                "{} related events completed correlation {}",
                events.len(),
                correlation_id
            )),
        );
        summary
    }

    /// Best-effort append; durability degrades, routing stays live.
    async fn persist(&self, event: &Event) {
        if let Some(store) = &self.store {
            if let Err(error) = store.store(event.clone()).await {
                warn!(
                    event_id = %event.id,
                    error = %error,
                    "event store append failed, continuing in memory"
                );
            }
        }
    }

    async fn republish(&self, event: Event) -> HandlerResult<()> {
        let router = self
            .router
            .read()
            .await
            .as_ref()
            .and_then(|weak| weak.upgrade())
            .ok_or(HandlerError::Publish {
                message: "router is no longer attached".to_string(),
            })?;
        router
            .publish(event)
            .await
            .map_err(|e| HandlerError::Publish {
                message: e.to_string(),
            })?;
        Ok(())
    }

    /// Full causal chain for a correlation id, from the event store.
    ///
    /// Without a configured store, the open in-memory group (if any) is
    /// returned instead.
    pub async fn get_correlation_chain(
        &self,
        correlation_id: &str,
    ) -> CorrelatorResult<Vec<Event>> {
        match &self.store {
            Some(store) => {
                let chain = store
                    .query_events(&QueryFilter::new().correlation_id(correlation_id))
                    .await?;
                Ok(chain)
            }
            None => Ok(self
                .groups
                .get(correlation_id)
                .map(|group| group.events.clone())
                .unwrap_or_default()),
        }
    }

    /// Walks `causation_id` links back from an event, returning the chain
    /// root-cause first. Cycle-safe.
    pub async fn get_causation_chain(&self, event_id: &EventId) -> CorrelatorResult<Vec<Event>> {
        let store = self
            .store
            .as_ref()
            .ok_or(CorrelatorError::StoreNotConfigured)?;

        let mut chain = Vec::new();
        let mut visited: HashSet<EventId> = HashSet::new();
        let mut cursor = store.get_event_by_id(event_id).await?;
        while let Some(event) = cursor {
            if !visited.insert(event.id) {
                break;
            }
            cursor = match event.causation_id {
                Some(parent) => store.get_event_by_id(&parent).await?,
                None => None,
            };
            chain.push(event);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Drops groups idle longer than the configured timeout. Returns the
    /// number of groups reclaimed.
    pub fn sweep_expired(&self) -> usize {
        let idle_timeout = self
            .config
            .sweep
            .as_ref()
            .map(|sweep| sweep.group_idle_timeout)
            .unwrap_or_else(|| SweepConfig::default().group_idle_timeout);

        let before = self.groups.len();
        self.groups
            .retain(|_, group| group.last_touched.elapsed() <= idle_timeout);
        let expired = before.saturating_sub(self.groups.len());
        if expired > 0 {
            self.groups_expired
                .fetch_add(expired as u64, Ordering::Relaxed);
            debug!(expired, "expired idle correlation groups");
        }
        expired
    }

    /// Starts the background expiry sweep, if enabled by configuration.
    ///
    /// Non-blocking; the task runs until [`stop_sweep`](Self::stop_sweep).
    pub async fn start_sweep(self: Arc<Self>) {
        let Some(sweep) = self.config.sweep.clone() else {
            return;
        };
        if !sweep.enabled || self.sweep_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let correlator = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep.sweep_interval);
            // the first tick fires immediately; skip it
            interval.tick().await;
            while correlator.sweep_running.load(Ordering::SeqCst) {
                interval.tick().await;
                correlator.sweep_expired();
            }
        });
        *self.sweep_handle.lock().await = Some(handle);
        debug!("correlation group sweep started");
    }

    pub async fn stop_sweep(&self) {
        self.sweep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.sweep_handle.lock().await.take() {
            handle.abort();
        }
    }

    pub fn open_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn group_len(&self, correlation_id: &str) -> Option<usize> {
        self.groups.get(correlation_id).map(|group| group.len())
    }

    pub fn stats(&self) -> CorrelatorStats {
        CorrelatorStats {
            open_groups: self.groups.len(),
            events_enriched: self.events_enriched.load(Ordering::Relaxed),
            summaries_emitted: self.summaries_emitted.load(Ordering::Relaxed),
            groups_expired: self.groups_expired.load(Ordering::Relaxed),
        }
    }
}

fn generate_correlation_id() -> String {
    format!("corr_{}", &Uuid::new_v4().simple().to_string()[..12])
}

#[derive(Error, Debug)]
pub enum CorrelatorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("no event store configured")]
    StoreNotConfigured,
}

pub type CorrelatorResult<T> = Result<T, CorrelatorError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;
    use crate::store::{InMemoryEventStore, MockEventStore};
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    async fn capture_all(router: &Arc<EventRouter>) -> Arc<AsyncMutex<Vec<Event>>> {
        let captured: Arc<AsyncMutex<Vec<Event>>> = Arc::new(AsyncMutex::new(Vec::new()));
        let captured_ref = captured.clone();
        router
            .subscribe(
                EventPattern::any(),
                handler_fn(move |event| {
                    let captured = captured_ref.clone();
                    async move {
                        captured.lock().await.push(event);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();
        captured
    }

    fn correlated_event(event_type: &str, correlation_id: &str) -> Event {
        Event::builder()
            .event_type(event_type)
            .source("unit")
            .correlation_id(correlation_id)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_enrichment_assigns_correlation_id() {
        let router = Arc::new(EventRouter::new(RouterConfig::default()));
        let correlator = Arc::new(EventCorrelator::new(CorrelatorConfig::default()));
        correlator.clone().attach(&router).await.unwrap();
        let captured = capture_all(&router).await;

        let original = Event::new("file.save", "editor");
        let original_id = original.id;
        router.publish(original).await.unwrap();

        let observed = captured.lock().await.clone();
        let enriched: Vec<&Event> = observed
            .iter()
            .filter(|e| e.id == original_id && e.correlation_id.is_some())
            .collect();
        assert_eq!(enriched.len(), 1);
        let correlation_id = enriched[0].correlation_id.as_deref().unwrap();
        assert!(correlation_id.starts_with("corr_"));
        assert_eq!(correlation_id.len(), "corr_".len() + 12);
        assert_eq!(correlator.stats().events_enriched, 1);
    }

    #[tokio::test]
    async fn test_completion_emits_single_summary_and_clears_group() {
        let router = Arc::new(EventRouter::new(RouterConfig::default()));
        let store = Arc::new(InMemoryEventStore::new());
        let correlator = Arc::new(EventCorrelator::with_store(
            CorrelatorConfig::default(),
            store.clone(),
        ));
        correlator.clone().attach(&router).await.unwrap();

        let summaries: Arc<AsyncMutex<Vec<Event>>> = Arc::new(AsyncMutex::new(Vec::new()));
        let summaries_ref = summaries.clone();
        router
            .subscribe(
                EventPattern::new(CORRELATION_COMPLETED_EVENT),
                handler_fn(move |event| {
                    let summaries = summaries_ref.clone();
                    async move {
                        summaries.lock().await.push(event);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        let first = correlated_event("build.started", "X");
        let second = correlated_event("build.failure", "X");
        router.publish(first.clone()).await.unwrap();
        assert_eq!(correlator.group_len("X"), Some(1));

        router.publish(second.clone()).await.unwrap();

        let observed = summaries.lock().await.clone();
        assert_eq!(observed.len(), 1);
        let summary = &observed[0];
        assert_eq!(summary.correlation_id.as_deref(), Some("X"));
        assert_eq!(summary.causation_id, Some(second.id));
        match summary.payload.get("event_ids") {
            Some(Value::List(ids)) => {
                assert_eq!(ids.len(), 2);
                assert!(ids.contains(&Value::from(first.id.to_string())));
                assert!(ids.contains(&Value::from(second.id.to_string())));
            }
            other => panic!("unexpected event_ids payload: {:?}", other),
        }
        assert_eq!(
            summary.payload.get("event_count"),
            Some(&Value::Integer(2))
        );

        // group removed on completion; the same key starts a fresh group
        assert_eq!(correlator.group_len("X"), None);
        router
            .publish(correlated_event("build.retry", "X"))
            .await
            .unwrap();
        assert_eq!(correlator.group_len("X"), Some(1));
        assert_eq!(summaries.lock().await.len(), 1);

        // constituents and the summary were persisted
        let chain = correlator.get_correlation_chain("X").await.unwrap();
        assert!(chain.len() >= 3);
    }

    #[tokio::test]
    async fn test_store_failure_degrades_to_in_memory() {
        let mut store = MockEventStore::new();
        store
            .expect_store()
            .returning(|_| Err(StoreError::backend("backend down")));

        let router = Arc::new(EventRouter::new(RouterConfig::default()));
        let correlator = Arc::new(EventCorrelator::with_store(
            CorrelatorConfig::default(),
            Arc::new(store),
        ));
        correlator.clone().attach(&router).await.unwrap();
        let captured = capture_all(&router).await;

        router
            .publish(correlated_event("a", "Y"))
            .await
            .unwrap();
        let report = router.publish(correlated_event("b", "Y")).await.unwrap();

        // publishing never fails on store errors and the summary still fires
        assert!(report.failures.is_empty());
        let observed = captured.lock().await.clone();
        assert!(observed
            .iter()
            .any(|e| e.event_type == CORRELATION_COMPLETED_EVENT));
        assert_eq!(correlator.stats().summaries_emitted, 1);
    }

    #[tokio::test]
    async fn test_replayed_events_are_skipped() {
        let correlator = EventCorrelator::new(CorrelatorConfig::default());

        let replayed = Event::builder()
            .event_type("build.failure")
            .source("history")
            .correlation_id("R")
            .replay()
            .build()
            .unwrap();
        correlator.observe(replayed).await.unwrap();

        assert_eq!(correlator.open_groups(), 0);
        assert_eq!(correlator.stats().events_enriched, 0);
    }

    #[tokio::test]
    async fn test_summaries_are_not_regrouped() {
        let correlator = EventCorrelator::new(CorrelatorConfig::default());

        let mut summary = Event::new(CORRELATION_COMPLETED_EVENT, CORRELATOR_SOURCE);
        summary.correlation_id = Some("done".to_string());
        correlator.observe(summary).await.unwrap();

        assert_eq!(correlator.open_groups(), 0);
    }

    #[tokio::test]
    async fn test_sweep_reclaims_idle_groups() {
        let config = CorrelatorConfig {
            completion_threshold: 10,
            sweep: Some(SweepConfig {
                enabled: true,
                sweep_interval: Duration::from_millis(10),
                group_idle_timeout: Duration::from_millis(0),
            }),
        };
        let correlator = EventCorrelator::new(config);

        correlator
            .observe(correlated_event("a", "Z"))
            .await
            .unwrap();
        assert_eq!(correlator.open_groups(), 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(correlator.sweep_expired(), 1);
        assert_eq!(correlator.open_groups(), 0);
        assert_eq!(correlator.stats().groups_expired, 1);
    }

    #[tokio::test]
    async fn test_background_sweep_runs() {
        let config = CorrelatorConfig {
            completion_threshold: 10,
            sweep: Some(SweepConfig {
                enabled: true,
                sweep_interval: Duration::from_millis(20),
                group_idle_timeout: Duration::from_millis(1),
            }),
        };
        let correlator = Arc::new(EventCorrelator::new(config));
        correlator
            .observe(correlated_event("a", "W"))
            .await
            .unwrap();

        correlator.clone().start_sweep().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(correlator.open_groups(), 0);
        correlator.stop_sweep().await;
    }

    #[tokio::test]
    async fn test_causation_chain_walks_to_root() {
        let store = Arc::new(InMemoryEventStore::new());
        let correlator =
            EventCorrelator::with_store(CorrelatorConfig::default(), store.clone());

        let root = Event::new("build.started", "ci");
        let middle = root.derive("build.compiled");
        let leaf = middle.derive("build.failure");
        for event in [&root, &middle, &leaf] {
            store.store((*event).clone()).await.unwrap();
        }

        let chain = correlator.get_causation_chain(&leaf.id).await.unwrap();
        let ids: Vec<EventId> = chain.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![root.id, middle.id, leaf.id]);
    }

    #[tokio::test]
    async fn test_custom_completion_rule() {
        struct TypeRule;
        impl CompletionRule for TypeRule {
            fn is_complete(&self, group: &CorrelationGroup) -> bool {
                group
                    .events
                    .iter()
                    .any(|event| event.event_type == "build.finished")
            }
        }

        let router = Arc::new(EventRouter::new(RouterConfig::default()));
        let correlator = Arc::new(
            EventCorrelator::new(CorrelatorConfig {
                completion_threshold: 100,
                ..Default::default()
            })
            .with_rule(Box::new(TypeRule)),
        );
        correlator.clone().attach(&router).await.unwrap();
        let captured = capture_all(&router).await;

        for event_type in ["build.started", "build.compiled"] {
            router
                .publish(correlated_event(event_type, "V"))
                .await
                .unwrap();
        }
        assert_eq!(correlator.stats().summaries_emitted, 0);

        router
            .publish(correlated_event("build.finished", "V"))
            .await
            .unwrap();
        assert_eq!(correlator.stats().summaries_emitted, 1);
        assert!(captured
            .lock()
            .await
            .iter()
            .any(|e| e.event_type == CORRELATION_COMPLETED_EVENT));
    }
}
