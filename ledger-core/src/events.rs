//! In-process typed publish/subscribe. Subscribers register for a topic or
//! the wildcard `*`; publish snapshots the subscriber list under lock and
//! delivers outside the lock so a slow or panicking subscriber can't hold up
//! the publisher or other subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

pub const TOPIC_ORDER_NEW: &str = "order.new";
pub const TOPIC_ORDER_FILL: &str = "order.fill";
pub const TOPIC_ORDER_CANCEL: &str = "order.cancel";
pub const TOPIC_ORDER_CANCEL_TRADER: &str = "order.cancel.trader";
const WILDCARD: &str = "*";

#[derive(Clone, Debug)]
pub struct Event {
    pub topic: String,
    pub payload: Value,
}

pub type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: impl Into<String>, callback: Subscriber) {
        self.subscribers
            .lock()
            .expect("event bus mutex poisoned")
            .entry(topic.into())
            .or_default()
            .push(callback);
    }

    /// Delivery order within a single publish call follows subscriber
    /// registration order; there are no cross-topic ordering guarantees.
    pub fn publish(&self, topic: impl Into<String>, payload: Value) {
        let topic = topic.into();
        let event = Event { topic: topic.clone(), payload };

        let (direct, wildcard) = {
            let subs = self.subscribers.lock().expect("event bus mutex poisoned");
            (
                subs.get(&topic).cloned().unwrap_or_default(),
                subs.get(WILDCARD).cloned().unwrap_or_default(),
            )
        };

        for callback in direct.iter().chain(wildcard.iter()) {
            // A misbehaving subscriber must never affect the publisher or
            // its siblings.
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(&event)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn wildcard_subscriber_sees_every_topic() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe(WILDCARD, Arc::new(move |_| { c.fetch_add(1, Ordering::SeqCst); }));

        bus.publish(TOPIC_ORDER_NEW, serde_json::json!({"order_id": 1}));
        bus.publish(TOPIC_ORDER_FILL, serde_json::json!({"order_id": 1}));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_subscriber_does_not_stop_delivery_to_others() {
        let bus = EventBus::new();
        bus.subscribe(TOPIC_ORDER_NEW, Arc::new(|_| panic!("boom")));
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe(TOPIC_ORDER_NEW, Arc::new(move |_| { c.fetch_add(1, Ordering::SeqCst); }));

        bus.publish(TOPIC_ORDER_NEW, serde_json::json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscriber_order_is_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            bus.subscribe(TOPIC_ORDER_NEW, Arc::new(move |_| seen.lock().unwrap().push(i)));
        }
        bus.publish(TOPIC_ORDER_NEW, serde_json::json!({}));
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }
}
