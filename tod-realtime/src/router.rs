//! Event routing to bound handlers

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tod_core::InboundEvent;
use tracing::{debug, warn};

use crate::registry::SubscriptionRegistry;

/// Delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    /// Events handed to at least one handler
    pub delivered: u64,
    /// Events on unauthorized channels or without a handler
    pub dropped: u64,
    /// Handler invocations that returned an error or panicked
    pub handler_failures: u64,
}

/// Delivers inbound events to the handlers bound for them
///
/// Only channels marked `Authorized` receive events. A failing handler is
/// logged and counted; the remaining handlers still run.
#[derive(Debug)]
pub struct EventRouter {
    registry: Arc<SubscriptionRegistry>,
    delivered: AtomicU64,
    dropped: AtomicU64,
    handler_failures: AtomicU64,
}

impl EventRouter {
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            registry,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn dispatch(&self, event: InboundEvent) {
        if !self.registry.is_authorized(&event.channel_name) {
            debug!(
                "[TOD Router] Dropping {} on unauthorized channel {}",
                event.event_name, event.channel_name
            );
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let handlers = self.registry.resolve(&event.channel_name, &event.event_name);
        if handlers.is_empty() {
            debug!(
                "[TOD Router] Unhandled event type: {} on {}",
                event.event_name, event.channel_name
            );
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        for handler in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        "[TOD Router] Handler for {} on {} failed: {}",
                        event.event_name, event.channel_name, e
                    );
                    self.handler_failures.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    warn!(
                        "[TOD Router] Handler for {} on {} panicked",
                        event.event_name, event.channel_name
                    );
                    self.handler_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    fn router() -> EventRouter {
        EventRouter::new(Arc::new(SubscriptionRegistry::new()))
    }

    #[test]
    fn test_delivers_only_when_authorized() {
        let router = router();
        let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
        let sink = Arc::clone(&seen);
        router.registry().bind("k1", "OrderFilled", move |event| {
            sink.lock().push(event.payload.clone());
            Ok(())
        });

        router.dispatch(InboundEvent::new("k1", "OrderFilled", json!({"id": 1})));
        assert!(seen.lock().is_empty());

        router.registry().mark_authorized("k1");
        router.dispatch(InboundEvent::new(
            "k1",
            "App\\Events\\OrderFilled",
            json!({"id": 42}),
        ));

        assert_eq!(*seen.lock(), vec![json!({"id": 42})]);
        assert_eq!(
            router.stats(),
            RouterStats {
                delivered: 1,
                dropped: 1,
                handler_failures: 0
            }
        );
    }

    #[test]
    fn test_unhandled_event_is_dropped() {
        let router = router();
        router.registry().mark_authorized("k1");
        router.dispatch(InboundEvent::new("k1", "OrderCreated", json!({})));
        router.dispatch(InboundEvent::new("other", "OrderCreated", json!({})));
        assert_eq!(router.stats().dropped, 2);
        assert_eq!(router.stats().delivered, 0);
    }

    #[test]
    fn test_failing_handlers_do_not_stop_others() {
        let router = router();
        let calls = Arc::new(Mutex::new(Vec::new()));

        router
            .registry()
            .bind("k1", "OrderUpdated", |_| Err(HandlerError::new("bad payload")));
        router.registry().bind("k1", "OrderUpdated", |_| panic!("handler bug"));
        let sink = Arc::clone(&calls);
        router.registry().bind("k1", "OrderUpdated", move |event| {
            sink.lock().push(event.event_name.clone());
            Ok(())
        });
        router.registry().mark_authorized("k1");

        router.dispatch(InboundEvent::new("k1", "OrderUpdated", json!({})));
        router.dispatch(InboundEvent::new("k1", "OrderUpdated", json!({})));

        assert_eq!(calls.lock().len(), 2);
        let stats = router.stats();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.handler_failures, 4);
    }

    #[test]
    fn test_rejected_channel_receives_nothing() {
        let router = router();
        let count = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&count);
        router.registry().bind("k1", "OrderFilled", move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        router.registry().mark_rejected("k1");

        router.dispatch(InboundEvent::new("k1", "OrderFilled", json!({})));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
