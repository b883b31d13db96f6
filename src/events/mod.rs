//! In-process publish/subscribe.
//!
//! The [`EventBus`] decouples the connection manager, network monitor and
//! replay queue from the consumers that render their output. Events are
//! typed ([`SyncEvent`]) and routed by [`Topic`].

mod listeners;

pub use listeners::{ListenerId, Listeners, Subscription};

use crate::error::Error;
use crate::feed::{Alert, ConnectionStatus, PriceTable, PriceUpdate};
use crate::network::NetworkChange;
use crate::queue::PendingOperation;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Event names consumers can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Feed connection state changed.
    Connection,
    /// Full price snapshot received.
    Prices,
    /// Single price changed.
    PriceUpdate,
    /// Out-of-band alert from the feed.
    Alert,
    /// Device connectivity changed.
    Network,
    /// A pending operation hit its replay cap and was removed.
    OperationDropped,
}

impl Topic {
    /// All topics.
    pub const ALL: [Topic; 6] = [
        Topic::Connection,
        Topic::Prices,
        Topic::PriceUpdate,
        Topic::Alert,
        Topic::Network,
        Topic::OperationDropped,
    ];

    /// Wire/event name of the topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Prices => "prices",
            Self::PriceUpdate => "price_update",
            Self::Alert => "alert",
            Self::Network => "network",
            Self::OperationDropped => "operation_dropped",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| Error::invalid_input(format!("unknown event topic '{s}'")))
    }
}

/// Events published on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Feed connection state changed.
    Connection(ConnectionStatus),
    /// Full price snapshot.
    Prices(PriceTable),
    /// Incremental price change.
    PriceUpdate(PriceUpdate),
    /// Feed alert, passed through verbatim.
    Alert(Alert),
    /// Device connectivity transition.
    Network(NetworkChange),
    /// Operation removed after exhausting its replay attempts.
    OperationDropped(PendingOperation),
}

impl SyncEvent {
    /// The topic this event is delivered on.
    pub fn topic(&self) -> Topic {
        match self {
            Self::Connection(_) => Topic::Connection,
            Self::Prices(_) => Topic::Prices,
            Self::PriceUpdate(_) => Topic::PriceUpdate,
            Self::Alert(_) => Topic::Alert,
            Self::Network(_) => Topic::Network,
            Self::OperationDropped(_) => Topic::OperationDropped,
        }
    }
}

/// Topic-keyed callback registry.
#[derive(Debug, Default)]
pub struct EventBus {
    topics: RwLock<HashMap<Topic, Listeners<SyncEvent>>>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for every event published on `topic`.
    pub fn subscribe<F>(&self, topic: Topic, callback: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.topics
            .write()
            .entry(topic)
            .or_default()
            .add(callback)
    }

    /// Deliver `event` to every subscriber of its topic, in registration
    /// order, before returning. Returns the number of callbacks invoked.
    pub fn publish(&self, event: SyncEvent) -> usize {
        let topic = event.topic();
        let listeners = self.topics.read().get(&topic).cloned();
        let delivered = listeners.map_or(0, |listeners| listeners.notify(&event));
        tracing::trace!(%topic, delivered, "Event published");
        delivered
    }

    /// Number of callbacks registered for `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topics
            .read()
            .get(&topic)
            .map_or(0, |listeners| listeners.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::ConnectionState;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter(bus: &EventBus, topic: Topic) -> (Arc<AtomicUsize>, Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let sub = {
            let count = Arc::clone(&count);
            bus.subscribe(topic, move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        (count, sub)
    }

    fn update(symbol: &str) -> SyncEvent {
        SyncEvent::PriceUpdate(PriceUpdate {
            symbol: symbol.to_string(),
            price: dec!(1),
        })
    }

    #[test]
    fn test_two_subscribers_each_invoked_once() {
        let bus = EventBus::new();
        let (a, _sa) = counter(&bus, Topic::PriceUpdate);
        let (b, _sb) = counter(&bus, Topic::PriceUpdate);

        assert_eq!(bus.publish(update("BTC")), 2);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribed_listener_is_skipped() {
        let bus = EventBus::new();
        let (a, sa) = counter(&bus, Topic::PriceUpdate);
        let (b, _sb) = counter(&bus, Topic::PriceUpdate);

        sa.unsubscribe();
        bus.publish(update("BTC"));
        assert_eq!(a.load(Ordering::SeqCst), 0);
        assert_eq!(b.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(Topic::PriceUpdate), 1);
    }

    #[test]
    fn test_events_routed_by_topic() {
        let bus = EventBus::new();
        let (prices, _s1) = counter(&bus, Topic::Prices);
        let (connection, _s2) = counter(&bus, Topic::Connection);

        bus.publish(SyncEvent::Connection(ConnectionStatus::from(
            ConnectionState::Connected,
        )));
        assert_eq!(prices.load(Ordering::SeqCst), 0);
        assert_eq!(connection.load(Ordering::SeqCst), 1);
        assert_eq!(bus.publish(update("ETH")), 0);
    }

    #[test]
    fn test_listener_unsubscribing_another_mid_publish() {
        let bus = EventBus::new();
        let victim_slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        {
            let victim_slot = Arc::clone(&victim_slot);
            bus.subscribe(Topic::Alert, move |_| {
                if let Some(victim) = victim_slot.lock().take() {
                    victim.unsubscribe();
                }
            });
        }
        let (victim, victim_sub) = counter(&bus, Topic::Alert);
        *victim_slot.lock() = Some(victim_sub);

        let alert = SyncEvent::Alert(Alert::default());
        // Snapshot taken before delivery: the victim still gets this one.
        assert_eq!(bus.publish(alert.clone()), 2);
        assert_eq!(bus.publish(alert), 1);
        assert_eq!(victim.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_topic_names_round_trip() {
        for topic in Topic::ALL {
            assert_eq!(topic.as_str().parse::<Topic>().unwrap(), topic);
        }
        assert!("quotes".parse::<Topic>().is_err());
    }
}
