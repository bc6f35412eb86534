use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eventweave::config::RouterConfig;
use eventweave::event::Event;
use eventweave::pattern::EventPattern;
use eventweave::router::{DeliveryMode, EventRouter, RouterError};
use eventweave::subscription::{handler_fn, HandlerError};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

#[tokio::test]
async fn test_failure_channel_carries_handler_identity() {
    let router = EventRouter::new(RouterConfig::default());
    let failing = router
        .subscribe(
            EventPattern::new("job.*"),
            handler_fn(|_| async { Err(HandlerError::failed("disk full")) }),
        )
        .await
        .unwrap();

    let mut failures = BroadcastStream::new(router.subscribe_failures());

    let event = Event::new("job.cleanup", "scheduler");
    let event_id = event.id;
    router.publish(event).await.unwrap();

    let failure = tokio::time::timeout(Duration::from_secs(1), failures.next())
        .await
        .expect("failure not broadcast")
        .unwrap()
        .unwrap();
    assert_eq!(failure.subscription_id, failing);
    assert_eq!(failure.event_id, event_id);
    assert_eq!(failure.event_type, "job.cleanup");
    assert!(failure.message.contains("disk full"));
}

#[tokio::test]
async fn test_publisher_is_isolated_from_handler_failures() {
    let router = EventRouter::new(RouterConfig::default());
    let healthy = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let healthy = healthy.clone();
        router
            .subscribe(
                EventPattern::any(),
                handler_fn(move |_| {
                    let healthy = healthy.clone();
                    async move {
                        healthy.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();
    }
    router
        .subscribe(
            EventPattern::any(),
            handler_fn(|_| async { Err(HandlerError::failed("broken consumer")) }),
        )
        .await
        .unwrap();

    for mode in [DeliveryMode::Async, DeliveryMode::Sync] {
        let report = router
            .publish_with_mode(Event::new("tick", "clock"), mode)
            .await
            .unwrap();
        assert_eq!(report.matched, 3);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failures.len(), 1);
    }
    assert_eq!(healthy.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_bad_configuration_fails_before_delivery() {
    let router = EventRouter::new(RouterConfig::default());

    // malformed patterns are rejected when subscribing, not at publish time
    let result = router
        .subscribe(
            EventPattern::new("regex:[unclosed"),
            handler_fn(|_| async { Ok(()) }),
        )
        .await;
    assert!(matches!(result, Err(RouterError::Pattern(_))));

    // unknown delivery modes are rejected before any delivery is attempted
    assert!(matches!(
        DeliveryMode::parse("queued"),
        Err(RouterError::UnsupportedMode { .. })
    ));
}
