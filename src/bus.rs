//! In-process publish/subscribe bus.
//!
//! Decouples protocol dispatch from scenario/consumer logic inside one
//! process. Cross-process deployments get the same contract from [`crate::netbus`];
//! the ordering and snapshot rules below hold for both.
//!
//! Contract:
//! - `publish` multicasts to a snapshot of the topic's subscriber list taken
//!   the moment publish begins, in registration order;
//! - `subscribe`/`unsubscribe` mutate the live registry and take effect from
//!   the next publish, never retroactively for an in-flight multicast;
//! - publishing to a topic nobody subscribes to is a no-op;
//! - duplicate subscriptions are allowed and invoked once each.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::trace;

use crate::protocol::Message;

/// Token returned by [`Bus::subscribe`], consumed by [`Bus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn value(self) -> u64 {
        self.0
    }
}

type Callback = Rc<RefCell<dyn FnMut(&Message)>>;

#[derive(Default)]
struct Registry {
    topics: HashMap<String, Vec<(SubscriptionId, Callback)>>,
    next_id: u64,
}

/// Topic-keyed callback bus, shared by reference (`Rc<Bus>`) within one
/// process. Single-threaded by design; all mutation goes through the interior
/// registry cell.
#[derive(Default)]
pub struct Bus {
    registry: RefCell<Registry>,
}

impl Bus {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Register `callback` for `topic`. Insertion order is the multicast
    /// order.
    pub fn subscribe(
        &self,
        topic: &str,
        callback: impl FnMut(&Message) + 'static,
    ) -> SubscriptionId {
        let mut registry = self.registry.borrow_mut();
        let id = SubscriptionId(registry.next_id);
        registry.next_id += 1;
        registry
            .topics
            .entry(topic.to_string())
            .or_default()
            .push((id, Rc::new(RefCell::new(callback))));
        id
    }

    /// Remove the subscription `id` from `topic`. Returns whether anything was
    /// removed. An in-flight multicast is unaffected.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut registry = self.registry.borrow_mut();
        match registry.topics.get_mut(topic) {
            Some(subscribers) => {
                let before = subscribers.len();
                subscribers.retain(|(sub_id, _)| *sub_id != id);
                before != subscribers.len()
            }
            None => false,
        }
    }

    /// Multicast `message` to the subscribers of `topic` registered at this
    /// moment. Callbacks may freely subscribe, unsubscribe, or publish again.
    pub fn publish(&self, topic: &str, message: &Message) {
        let snapshot: Vec<Callback> = match self.registry.borrow().topics.get(topic) {
            Some(subscribers) => subscribers.iter().map(|(_, cb)| Rc::clone(cb)).collect(),
            None => return,
        };
        trace!(topic, subscribers = snapshot.len(), "publish");
        for callback in snapshot {
            (callback.borrow_mut())(message);
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.registry
            .borrow()
            .topics
            .get(topic)
            .map_or(0, |subscribers| subscribers.len())
    }
}
