//! Post-commit publishing and a keyed in-process fan-out.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::HandlerError;
use crate::event::RecordedEvent;

/// Receives committed (or replayed) events.
///
/// Implemented for any `Fn(&RecordedEvent<E>, bool) -> Result<(), HandlerError>`
/// closure and for [`EventBus`].
pub trait Publisher<E>: Send + Sync {
    /// Deliver one event. `replay` is `true` when the event is being
    /// re-driven from history.
    fn publish(&self, event: &RecordedEvent<E>, replay: bool) -> Result<(), HandlerError>;
}

impl<E, F> Publisher<E> for F
where
    F: Fn(&RecordedEvent<E>, bool) -> Result<(), HandlerError> + Send + Sync,
{
    fn publish(&self, event: &RecordedEvent<E>, replay: bool) -> Result<(), HandlerError> {
        self(event, replay)
    }
}

type Subscriber<E> = Arc<dyn Fn(&RecordedEvent<E>, bool) -> Result<(), HandlerError> + Send + Sync>;

/// Event-type keyed subscriber lists.
///
/// Subscribing takes the write lock; publishing snapshots the subscriber list
/// under the read lock and calls handlers without holding it, so a handler
/// may itself subscribe.
pub struct EventBus<E> {
    subscribers: RwLock<HashMap<String, Vec<Subscriber<E>>>>,
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subscribers = self.subscribers.read();
        f.debug_map()
            .entries(subscribers.iter().map(|(k, v)| (k, v.len())))
            .finish()
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Add a subscriber for `event_type`. Subscribers run in subscription
    /// order.
    pub fn subscribe<F>(&self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(&RecordedEvent<E>, bool) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .entry(event_type.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Number of subscribers for `event_type`.
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.subscribers.read().get(event_type).map_or(0, Vec::len)
    }
}

impl<E> Publisher<E> for EventBus<E> {
    /// Deliver to each subscriber of the event's type, stopping at the first
    /// error.
    fn publish(&self, event: &RecordedEvent<E>, replay: bool) -> Result<(), HandlerError> {
        let subscribers = self.subscribers.read().get(&event.event_type).cloned();
        let Some(subscribers) = subscribers else {
            tracing::warn!(event_type = %event.event_type, "no subscribers for event type");
            return Ok(());
        };
        for subscriber in subscribers {
            subscriber(event, replay)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use parking_lot::Mutex;

    use super::*;
    use crate::aggregate::test_fixtures::OrderEvent;

    fn shipped() -> RecordedEvent<OrderEvent> {
        RecordedEvent {
            sequence: 4,
            aggregate_id: "A".into(),
            event_type: "OrderShipped".into(),
            payload: OrderEvent::OrderShipped { id: "A".into() },
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn fans_out_by_event_type() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["mail", "audit"] {
            let seen = Arc::clone(&seen);
            bus.subscribe("OrderShipped", move |e: &RecordedEvent<OrderEvent>, replay| {
                seen.lock().push((tag, e.sequence, replay));
                Ok(())
            });
        }
        bus.subscribe("OrderCreated", |_: &RecordedEvent<OrderEvent>, _| {
            Err("wrong type".into())
        });

        bus.publish(&shipped(), true).unwrap();
        assert_eq!(*seen.lock(), vec![("mail", 4, true), ("audit", 4, true)]);
        assert_eq!(bus.subscriber_count("OrderShipped"), 2);
    }

    #[test]
    fn stops_at_first_error() {
        let bus = EventBus::new();
        let later = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&later);
        bus.subscribe("OrderShipped", |_: &RecordedEvent<OrderEvent>, _| {
            Err("mailer down".into())
        });
        bus.subscribe("OrderShipped", move |_: &RecordedEvent<OrderEvent>, _| {
            *flag.lock() = true;
            Ok(())
        });

        let err = bus.publish(&shipped(), false).unwrap_err();
        assert_eq!(err.to_string(), "mailer down");
        assert!(!*later.lock());
    }

    #[test]
    fn no_subscribers_is_not_an_error() {
        let bus = EventBus::<OrderEvent>::new();
        assert!(bus.publish(&shipped(), false).is_ok());
    }

    #[test]
    fn closures_are_publishers() {
        let count = Mutex::new(0);
        let publisher = |_: &RecordedEvent<OrderEvent>, _: bool| -> Result<(), HandlerError> {
            *count.lock() += 1;
            Ok(())
        };
        publisher.publish(&shipped(), false).unwrap();
        assert_eq!(*count.lock(), 1);
    }
}
