//! In-process event bus.
//!
//! Uses a tokio broadcast channel for event distribution. Each subscriber
//! names the collection it cares about and only sees that collection's
//! events. A subscriber that falls behind by more than the channel capacity
//! is told how many events it missed. Loss upstream of the bus (a relay that
//! fell behind its broker) is reported to every subscriber the same way
//! through [`EventBus::signal_lag`].

use tokio::sync::broadcast;
use tracing::debug;

use crate::message::InvalidationEvent;

/// One item received from a [`CollectionEvents`] subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// An event for the subscribed collection.
    Event(InvalidationEvent),
    /// The subscriber fell behind and this many events were discarded.
    Lagged(u64),
}

/// What travels on the bus channel.
#[derive(Debug, Clone)]
enum BusItem {
    Event(InvalidationEvent),
    Lagged(u64),
}

/// Publish/subscribe point for invalidation events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusItem>,
}

impl EventBus {
    /// Create a bus whose subscribers can buffer `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Deliver an event to every current subscriber.
    ///
    /// Returns the number of receivers the event was handed to. Publishing
    /// with no subscribers is not an error.
    pub fn publish(&self, event: InvalidationEvent) -> usize {
        let kind = event.kind.as_str();
        match self.tx.send(BusItem::Event(event)) {
            Ok(receivers) => {
                debug!(kind, receivers, "Published invalidation event");
                receivers
            }
            Err(_) => {
                debug!(kind, "No subscribers for invalidation event");
                0
            }
        }
    }

    /// Tell every subscriber, whatever its collection, that `skipped`
    /// events were lost before reaching the bus.
    pub fn signal_lag(&self, skipped: u64) -> usize {
        let receivers = self.tx.send(BusItem::Lagged(skipped)).unwrap_or(0);
        debug!(skipped, receivers, "Signalled upstream lag");
        receivers
    }

    /// Subscribe to events for one collection.
    pub fn subscribe(&self, collection: impl Into<String>) -> CollectionEvents {
        CollectionEvents {
            collection: collection.into(),
            rx: self.tx.subscribe(),
        }
    }

    /// Number of live subscriptions across all collections.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiver filtered to a single collection.
#[derive(Debug)]
pub struct CollectionEvents {
    collection: String,
    rx: broadcast::Receiver<BusItem>,
}

impl CollectionEvents {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Wait for the next event for this collection.
    ///
    /// Returns `None` once the bus has been dropped.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            match self.rx.recv().await {
                Ok(item) => match self.accept(item) {
                    Some(delivery) => return Some(delivery),
                    None => continue,
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Some(Delivery::Lagged(skipped));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next already-buffered event for this collection, if any.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        loop {
            match self.rx.try_recv() {
                Ok(item) => match self.accept(item) {
                    Some(delivery) => return Some(delivery),
                    None => continue,
                },
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    return Some(Delivery::Lagged(skipped));
                }
                Err(_) => return None,
            }
        }
    }

    fn accept(&self, item: BusItem) -> Option<Delivery> {
        match item {
            BusItem::Event(event) if event.collection == self.collection => {
                Some(Delivery::Event(event))
            }
            BusItem::Event(_) => None,
            BusItem::Lagged(skipped) => Some(Delivery::Lagged(skipped)),
        }
    }
}
