//! # System Facade
//!
//! [`EventSystem`] composes a router, a correlator and an event store into
//! one ready-to-use unit. Composition is explicit and happens at startup —
//! the application hands handlers to `subscribe`, nothing is discovered from
//! the filesystem and nothing lives in process-global state.

use std::sync::Arc;

use crate::config::SystemConfig;
use crate::correlator::{CorrelatorResult, EventCorrelator};
use crate::event::Event;
use crate::pattern::EventPattern;
use crate::router::{DeliveryMode, DeliveryReport, EventRouter, RouterResult};
use crate::store::{EventStore, InMemoryEventStore};
use crate::subscription::{EventHandler, SubscriptionId};
use crate::InternalResult;

/// Wired router + correlator + store with a managed lifecycle.
///
/// ## Example
///
/// ```rust,no_run
/// use eventweave::{Event, EventPattern, EventSystem, SystemConfig};
/// use eventweave::subscription::handler_fn;
///
/// # async fn example() -> eventweave::InternalResult<()> {
/// let system = EventSystem::new(SystemConfig::default()).await?;
/// system
///     .subscribe(
///         EventPattern::new("build.*"),
///         handler_fn(|event| async move {
///             println!("build event: {}", event.event_type);
///             Ok(())
///         }),
///     )
///     .await?;
/// system.publish(Event::new("build.failure", "ci")).await?;
/// system.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct EventSystem {
    router: Arc<EventRouter>,
    correlator: Arc<EventCorrelator>,
    store: Arc<dyn EventStore>,
    correlator_subscription: SubscriptionId,
}

impl EventSystem {
    /// Builds a system backed by the in-memory reference store.
    pub async fn new(config: SystemConfig) -> InternalResult<Self> {
        Self::with_store(config, Arc::new(InMemoryEventStore::new())).await
    }

    /// Builds a system on an externally provided store backend.
    pub async fn with_store(
        config: SystemConfig,
        store: Arc<dyn EventStore>,
    ) -> InternalResult<Self> {
        let router = Arc::new(EventRouter::new(config.router.clone()));
        let correlator = Arc::new(EventCorrelator::with_store(
            config.correlator.clone(),
            store.clone(),
        ));
        let correlator_subscription = correlator.clone().attach(&router).await?;
        correlator.clone().start_sweep().await;

        Ok(Self {
            router,
            correlator,
            store,
            correlator_subscription,
        })
    }

    pub fn router(&self) -> Arc<EventRouter> {
        self.router.clone()
    }

    pub fn correlator(&self) -> Arc<EventCorrelator> {
        self.correlator.clone()
    }

    pub fn store(&self) -> Arc<dyn EventStore> {
        self.store.clone()
    }

    pub async fn subscribe(
        &self,
        pattern: EventPattern,
        handler: Arc<dyn EventHandler>,
    ) -> RouterResult<SubscriptionId> {
        self.router.subscribe(pattern, handler).await
    }

    pub async fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        self.router.unsubscribe(id).await
    }

    pub async fn publish(&self, event: Event) -> RouterResult<DeliveryReport> {
        self.router.publish(event).await
    }

    pub async fn publish_with_mode(
        &self,
        event: Event,
        mode: DeliveryMode,
    ) -> RouterResult<DeliveryReport> {
        self.router.publish_with_mode(event, mode).await
    }

    /// Audit surface: the stored causal chain for a correlation id.
    pub async fn get_correlation_chain(
        &self,
        correlation_id: &str,
    ) -> CorrelatorResult<Vec<Event>> {
        self.correlator.get_correlation_chain(correlation_id).await
    }

    /// Stops the sweep task and detaches the correlator.
    pub async fn shutdown(&self) {
        self.correlator.stop_sweep().await;
        self.router.unsubscribe(&self.correlator_subscription).await;
    }
}
