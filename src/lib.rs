//! # EVENTWEAVE: Event Routing & Correlation Engine
//!
//! Eventweave provides an in-process, asynchronous event backbone: producers
//! publish typed events, subscribers declare interest through patterns, and
//! a correlator weaves related events into traceable causal chains.
//!
//! ## Core Components
//!
//! ### 1. Events and Patterns
//! Immutable event values with an open, typed payload space:
//! - Event model and builders ([`event`])
//! - Wildcard and attribute pattern matching ([`pattern`])
//!
//! ### 2. Routing
//! The dispatch hub matching events to subscriptions:
//! - Subscriptions and handler contracts ([`subscription`])
//! - Sync/async delivery with failure isolation ([`router`])
//!
//! ### 3. Correlation
//! Stateful grouping of events sharing a correlation id:
//! - Groups, completion rules, enrichment, summaries ([`correlator`])
//! - Durable append/query behind a swappable contract ([`store`])
//!
//! ### 4. Composition
//! Explicit wiring with a managed lifecycle:
//! - Configuration ([`config`])
//! - System facade ([`system`])
//! - Error taxonomy ([`error`])
//!
//! ## Event Flow
//!
//! ```text
//! ┌──────────┐     ┌─────────────┐     ┌────────────┐
//! │ Producer │────▶│ EventRouter │────▶│ Subscriber │
//! └──────────┘     └──────┬──────┘     └────────────┘
//!                         │
//!                  ┌──────▼──────────┐     ┌────────────┐
//!                  │ EventCorrelator │────▶│ EventStore │
//!                  └──────┬──────────┘     └────────────┘
//!                         │ summary / enriched copy
//!                         ▼
//!                    EventRouter
//! ```
//!
//! 1. Producers publish events to the router
//! 2. The pattern matcher selects the active subscriptions to deliver to
//! 3. The correlator (itself a subscription on `"*"`) records each event,
//!    enriches uncorrelated ones, and re-publishes a summary when a group
//!    completes — closing the loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use eventweave::{Event, EventPattern, EventSystem, SystemConfig};
//! use eventweave::subscription::handler_fn;
//!
//! # async fn example() -> eventweave::InternalResult<()> {
//! let system = EventSystem::new(SystemConfig::default()).await?;
//!
//! system
//!     .subscribe(
//!         EventPattern::new("build.*"),
//!         handler_fn(|event| async move {
//!             println!("observed {}", event.event_type);
//!             Ok(())
//!         }),
//!     )
//!     .await?;
//!
//! system.publish(Event::new("build.failure", "ci")).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod correlator;
pub mod error;
pub mod event;
pub mod pattern;
pub mod router;
pub mod store;
pub mod subscription;
pub mod system;

// Re-exports
pub use config::*;
pub use correlator::*;
pub use error::*;
pub use event::*;
pub use pattern::*;
pub use router::*;
pub use store::*;
pub use subscription::*;
pub use system::*;

#[cfg(test)]
mod tests {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    #[ctor::ctor]
    fn init_tests() {
        // One-time test setup: tracing subscriber initialization
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .expect("Failed to set tracing subscriber");
    }
}
