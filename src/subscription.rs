//! # Subscriptions and Handlers
//!
//! A [`Subscription`] is a standing registration of a handler against a
//! pattern. Handlers implement [`EventHandler`]; plain async closures adapt
//! through [`handler_fn`]. A handler reports its outcome as a value — the
//! router captures failures, it never unwinds through the publisher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;
use uuid::Uuid;

use crate::event::Event;
use crate::pattern::{EventPattern, PatternMatcher};

/// Unique identifier of a subscription, returned by `subscribe` and usable
/// for removal.
pub type SubscriptionId = Uuid;

/// Capability supplied by a consumer: receives an event, may fail.
///
/// The router interprets nothing about a successful return; failures are
/// captured, logged and reported on the failure channel.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> HandlerResult<()>;
}

type HandlerFn = Box<dyn Fn(Event) -> BoxFuture<'static, HandlerResult<()>> + Send + Sync>;

struct FnHandler {
    f: HandlerFn,
}

#[async_trait]
impl EventHandler for FnHandler {
    async fn handle(&self, event: &Event) -> HandlerResult<()> {
        (self.f)(event.clone()).await
    }
}

/// Adapts an async closure into an [`EventHandler`].
///
/// ## Example
///
/// ```rust,no_run
/// use eventweave::subscription::handler_fn;
///
/// let handler = handler_fn(|event| async move {
///     println!("saw {}", event.event_type);
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = HandlerResult<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        f: Box::new(move |event| Box::pin(f(event))),
    })
}

/// Standing registration of a handler against a pattern.
pub struct Subscription {
    pub id: SubscriptionId,
    pub pattern: EventPattern,
    pub handler: Arc<dyn EventHandler>,
    /// Higher priorities deliver first; ties keep registration order
    pub priority: i32,
    /// Registration order within the owning router
    pub(crate) order: u64,
    active: AtomicBool,
}

impl Subscription {
    pub fn new(
        pattern: EventPattern,
        handler: Arc<dyn EventHandler>,
        priority: i32,
        order: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            pattern,
            handler,
            priority,
            order,
            active: AtomicBool::new(true),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn activate(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Active-and-matching check used by the router's dispatch path.
    pub fn matches(&self, matcher: &PatternMatcher, event: &Event) -> bool {
        self.is_active() && matcher.matches(event, &self.pattern)
    }
}

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),

    #[error("handler publish failed: {message}")]
    Publish { message: String },
}

impl HandlerError {
    pub fn failed<S: Into<String>>(message: S) -> Self {
        HandlerError::Failed(message.into())
    }
}

pub type HandlerResult<T> = Result<T, HandlerError>;
