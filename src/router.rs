//! # Event Router
//!
//! The [`EventRouter`] is the dispatch hub of eventweave: it owns the
//! subscription registry, matches published events against subscriber
//! patterns, and delivers to every matching active handler in the requested
//! [`DeliveryMode`].
//!
//! ## Delivery Semantics
//!
//! - **Async** (default): all matching handlers run concurrently; `publish`
//!   resolves once every handler has finished or failed (fan-out, join-all).
//! - **Sync**: handlers run one at a time in priority-then-registration
//!   order, each completing before the next starts.
//!
//! Delivery is best-effort, in-process, at-least-once per subscription active
//! at publish time. A subscription added while a publish is computing its
//! matching set does not receive that event.
//!
//! ## Failure Isolation
//!
//! Handler outcomes are captured as values. A failing (or timed out) handler
//! never aborts its siblings and never propagates to the publisher; the
//! failure lands in the returned [`DeliveryReport`], in the log, and on the
//! broadcast failure channel ([`EventRouter::subscribe_failures`]).

use std::cmp::Reverse;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_recursion::async_recursion;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, instrument, trace, warn};

use crate::config::RouterConfig;
use crate::event::{Event, EventId, Value};
use crate::pattern::{EventPattern, PatternError, PatternMatcher};
use crate::subscription::{EventHandler, HandlerError, Subscription, SubscriptionId};

/// Event type of the per-handler outcome events emitted when
/// `RouterConfig::delivery_confirmation` is enabled.
pub const DELIVERY_CONFIRMATION_EVENT: &str = "system.delivery.confirmation";

/// How matching handlers are invoked for one publish.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DeliveryMode {
    /// Concurrent fan-out, join-all
    #[default]
    Async,
    /// Sequential, registration order
    Sync,
}

impl DeliveryMode {
    /// Parses a textual mode, rejecting anything outside `{sync, async}`
    /// before any delivery is attempted.
    pub fn parse(mode: &str) -> RouterResult<Self> {
        mode.parse()
            .map_err(|_| RouterError::UnsupportedMode {
                mode: mode.to_string(),
            })
    }
}

/// One handler failure captured during delivery.
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub subscription_id: SubscriptionId,
    pub event_id: EventId,
    pub event_type: String,
    pub message: String,
}

/// Outcome of a single publish, returned to the publisher.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    /// Number of subscriptions that matched the event
    pub matched: usize,
    /// Handlers that completed successfully
    pub delivered: usize,
    pub failures: Vec<DeliveryFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterStats {
    pub events_published: u64,
    pub deliveries_succeeded: u64,
    pub deliveries_failed: u64,
}

#[derive(Default)]
struct Counters {
    events_published: AtomicU64,
    deliveries_succeeded: AtomicU64,
    deliveries_failed: AtomicU64,
}

/// # EventRouter
///
/// Owned, injectable dispatcher instance. Components that publish or
/// subscribe receive an `Arc<EventRouter>`; nothing is process-global, so
/// tests compose fresh instances freely.
pub struct EventRouter {
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    matcher: PatternMatcher,
    config: RouterConfig,
    counters: Counters,
    registration_order: AtomicU64,
    failure_tx: broadcast::Sender<DeliveryFailure>,
    /// Keeps the failure channel open while no external receiver exists
    _internal_failure_rx: broadcast::Receiver<DeliveryFailure>,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

impl EventRouter {
    pub fn new(config: RouterConfig) -> Self {
        let (failure_tx, failure_rx) = broadcast::channel(config.failure_channel_capacity.max(1));
        Self {
            subscriptions: RwLock::new(Vec::new()),
            matcher: PatternMatcher::new(),
            config,
            counters: Counters::default(),
            registration_order: AtomicU64::new(0),
            failure_tx,
            _internal_failure_rx: failure_rx,
        }
    }

    /// Registers an initially-active subscription and returns its id.
    ///
    /// The pattern is validated here so that a malformed expression fails
    /// the subscriber immediately instead of silently matching nothing at
    /// publish time.
    #[instrument(skip(self, handler), fields(pattern = %pattern))]
    pub async fn subscribe(
        &self,
        pattern: EventPattern,
        handler: Arc<dyn EventHandler>,
    ) -> RouterResult<SubscriptionId> {
        self.subscribe_with_priority(pattern, handler, 0).await
    }

    /// Like [`subscribe`](Self::subscribe) with an explicit priority.
    /// Higher priorities deliver first; ties keep registration order.
    pub async fn subscribe_with_priority(
        &self,
        pattern: EventPattern,
        handler: Arc<dyn EventHandler>,
        priority: i32,
    ) -> RouterResult<SubscriptionId> {
        self.matcher.validate(&pattern)?;
        let order = self.registration_order.fetch_add(1, Ordering::SeqCst);
        let subscription = Arc::new(Subscription::new(pattern, handler, priority, order));
        let id = subscription.id;
        self.subscriptions.write().await.push(subscription);
        debug!(subscription_id = %id, "subscription added");
        Ok(id)
    }

    /// Removes a subscription. Unknown ids are a no-op returning `false`.
    #[instrument(skip(self))]
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write().await;
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != *id);
        let removed = subscriptions.len() < before;
        if removed {
            debug!(subscription_id = %id, "subscription removed");
        }
        removed
    }

    /// Temporarily deactivates a subscription without removing it.
    pub async fn pause(&self, id: &SubscriptionId) -> bool {
        self.with_subscription(id, |s| s.deactivate()).await
    }

    /// Reactivates a paused subscription.
    pub async fn resume(&self, id: &SubscriptionId) -> bool {
        self.with_subscription(id, |s| s.activate()).await
    }

    async fn with_subscription<F: FnOnce(&Subscription)>(
        &self,
        id: &SubscriptionId,
        f: F,
    ) -> bool {
        let subscriptions = self.subscriptions.read().await;
        match subscriptions.iter().find(|s| s.id == *id) {
            Some(subscription) => {
                f(subscription);
                true
            }
            None => false,
        }
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// Publishes with the configured default mode.
    pub async fn publish(&self, event: Event) -> RouterResult<DeliveryReport> {
        self.publish_with_mode(event, self.config.default_mode).await
    }

    /// Publishes an event to every matching active subscription.
    ///
    /// Completion is deterministic regardless of handler outcomes: the
    /// returned report carries every captured failure, and a non-matching
    /// event is expected absence (`matched == 0`), not an error.
    #[async_recursion]
    pub async fn publish_with_mode(
        &self,
        event: Event,
        mode: DeliveryMode,
    ) -> RouterResult<DeliveryReport> {
        debug_event("publishing", &event);
        self.counters.events_published.fetch_add(1, Ordering::Relaxed);

        // Snapshot under the read lock, dispatch without it: subscriptions
        // added mid-publish never see this event, and handlers may subscribe
        // or publish themselves without deadlocking.
        let mut matching: Vec<Arc<Subscription>> = {
            let subscriptions = self.subscriptions.read().await;
            subscriptions
                .iter()
                .filter(|s| s.matches(&self.matcher, &event))
                .cloned()
                .collect()
        };
        matching.sort_by_key(|s| (Reverse(s.priority), s.order));

        let mut report = DeliveryReport {
            matched: matching.len(),
            ..Default::default()
        };
        if matching.is_empty() {
            trace!(event_type = %event.event_type, "no matching subscriptions");
            return Ok(report);
        }

        let outcomes: Vec<(SubscriptionId, Result<(), HandlerError>)> = match mode {
            DeliveryMode::Sync => {
                let mut outcomes = Vec::with_capacity(matching.len());
                for subscription in &matching {
                    let outcome = self.deliver(subscription, &event).await;
                    outcomes.push((subscription.id, outcome));
                }
                outcomes
            }
            DeliveryMode::Async => {
                let event_ref = &event;
                let deliveries = matching.iter().map(|subscription| async move {
                    (subscription.id, self.deliver(subscription, event_ref).await)
                });
                join_all(deliveries).await
            }
        };

        for (subscription_id, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    report.delivered += 1;
                    self.counters
                        .deliveries_succeeded
                        .fetch_add(1, Ordering::Relaxed);
                    if self.config.delivery_confirmation {
                        self.confirm_delivery(&event, &subscription_id, None, mode)
                            .await;
                    }
                }
                Err(error) => {
                    let failure = DeliveryFailure {
                        subscription_id,
                        event_id: event.id,
                        event_type: event.event_type.clone(),
                        message: error.to_string(),
                    };
                    warn!(
                        subscription_id = %failure.subscription_id,
                        event_id = %failure.event_id,
                        event_type = %failure.event_type,
                        error = %failure.message,
                        "handler failed"
                    );
                    self.counters
                        .deliveries_failed
                        .fetch_add(1, Ordering::Relaxed);
                    let _ = self.failure_tx.send(failure.clone());
                    if self.config.delivery_confirmation {
                        self.confirm_delivery(
                            &event,
                            &subscription_id,
                            Some(&failure.message),
                            mode,
                        )
                        .await;
                    }
                    report.failures.push(failure);
                }
            }
        }

        Ok(report)
    }

    /// Re-publishes with exponential backoff while deliveries keep failing.
    ///
    /// Returns the last report; callers inspect `failures` to see whether the
    /// retries were exhausted.
    pub async fn publish_with_retry(
        &self,
        event: Event,
        mode: DeliveryMode,
        max_retries: usize,
        retry_delay: Duration,
    ) -> RouterResult<DeliveryReport> {
        let mut report = self.publish_with_mode(event.clone(), mode).await?;
        for attempt in 0..max_retries {
            if report.failures.is_empty() {
                break;
            }
            tokio::time::sleep(retry_delay * 2u32.saturating_pow(attempt as u32)).await;
            report = self.publish_with_mode(event.clone(), mode).await?;
        }
        Ok(report)
    }

    /// Stream of captured handler failures; each receiver sees every failure
    /// that occurs after it subscribed.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<DeliveryFailure> {
        self.failure_tx.subscribe()
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            events_published: self.counters.events_published.load(Ordering::Relaxed),
            deliveries_succeeded: self.counters.deliveries_succeeded.load(Ordering::Relaxed),
            deliveries_failed: self.counters.deliveries_failed.load(Ordering::Relaxed),
        }
    }

    async fn deliver(
        &self,
        subscription: &Subscription,
        event: &Event,
    ) -> Result<(), HandlerError> {
        let delivery = subscription.handler.handle(event);
        match self.config.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, delivery).await {
                Ok(outcome) => outcome,
                Err(_) => Err(HandlerError::failed(format!(
                    "timed out after {}ms",
                    limit.as_millis()
                ))),
            },
            None => delivery.await,
        }
    }

    /// Emits a per-handler outcome event. Confirmation events are never
    /// themselves confirmed.
    async fn confirm_delivery(
        &self,
        original: &Event,
        subscription_id: &SubscriptionId,
        error: Option<&str>,
        mode: DeliveryMode,
    ) {
        if original.event_type == DELIVERY_CONFIRMATION_EVENT {
            return;
        }
        let mut confirmation = Event::new(DELIVERY_CONFIRMATION_EVENT, "event_router");
        confirmation.correlation_id = original.correlation_id.clone();
        confirmation.causation_id = Some(original.id);
        confirmation
            .payload
            .insert("event_id".to_string(), Value::from(original.id.to_string()));
        confirmation.payload.insert(
            "event_type".to_string(),
            Value::from(original.event_type.clone()),
        );
        confirmation.payload.insert(
            "subscription_id".to_string(),
            Value::from(subscription_id.to_string()),
        );
        confirmation
            .payload
            .insert("success".to_string(), Value::from(error.is_none()));
        if let Some(message) = error {
            confirmation
                .payload
                .insert("error".to_string(), Value::from(message));
        }
        if let Err(e) = self.publish_with_mode(confirmation, mode).await {
            warn!(error = %e, "failed to publish delivery confirmation");
        }
    }
}

/// Log helper keeping noisy event classes at trace level.
pub fn debug_event(prefix: &str, event: &Event) {
    if event.event_type == DELIVERY_CONFIRMATION_EVENT {
        trace!(event_type = %event.event_type, event_id = %event.id, "{}", prefix);
    } else {
        debug!(event_type = %event.event_type, event_id = %event.id, "{}", prefix);
    }
}

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("unsupported delivery mode: {mode}")]
    UnsupportedMode { mode: String },

    #[error("invalid subscription pattern: {0}")]
    Pattern(#[from] PatternError),
}

pub type RouterResult<T> = Result<T, RouterError>;
