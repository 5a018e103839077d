//! In-process broadcast hub standing in for a pub/sub broker.
//!
//! A [`BroadcastHub`] plays the role of the shared network channel. Every
//! [`HubUpdater`] connected to it gets a fresh sender id and its own
//! [`EventBus`]; a relay task decodes hub traffic, drops messages the
//! updater published itself, and forwards the rest to the bus. When the
//! relay falls behind the hub it signals lag on the bus so subscribers drop
//! whatever the lost messages would have invalidated.
//!
//! ```text
//!  HubUpdater A ──push──→ ┌──────────────┐ ──relay──→ bus B (subscribers in B)
//!                         │ BroadcastHub │
//!  HubUpdater B ──push──→ └──────────────┘ ──relay──→ bus A (own echoes dropped)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use stratum_core::{EntityId, EventError, PipelineConfig, StratumResult};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::message::{InvalidationEvent, InvalidationMessage};
use crate::updater::Updater;

/// Shared channel connecting updaters, as a broker would.
#[derive(Debug, Clone)]
pub struct BroadcastHub {
    tx: broadcast::Sender<Vec<u8>>,
}

impl BroadcastHub {
    /// Create a hub buffering up to `capacity` encoded messages per connection.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Hub whose per-connection buffer matches the pipeline's event capacity.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.event_capacity)
    }

    /// Connect a new updater. Must be called inside a tokio runtime.
    pub fn connect(&self, bus_capacity: usize) -> HubUpdater {
        HubUpdater::spawn(self.tx.clone(), bus_capacity)
    }

    /// Connect an updater whose bus buffers `config.event_capacity` events.
    pub fn connect_with(&self, config: &PipelineConfig) -> HubUpdater {
        self.connect(config.event_capacity)
    }

    /// Number of connected updaters.
    pub fn connections(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Inject raw bytes as if another process had published them.
    pub fn publish_raw(&self, bytes: Vec<u8>) -> usize {
        self.tx.send(bytes).unwrap_or(0)
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

/// [`Updater`] backed by a [`BroadcastHub`].
#[derive(Debug)]
pub struct HubUpdater {
    sender_id: Uuid,
    hub: broadcast::Sender<Vec<u8>>,
    bus: EventBus,
    relay: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl HubUpdater {
    fn spawn(hub: broadcast::Sender<Vec<u8>>, bus_capacity: usize) -> Self {
        let sender_id = Uuid::new_v4();
        let bus = EventBus::new(bus_capacity);
        let relay = tokio::spawn(relay(sender_id, hub.subscribe(), bus.clone()));
        info!(sender = %sender_id, "Connected updater to broadcast hub");
        Self {
            sender_id,
            hub,
            bus,
            relay: Mutex::new(Some(relay)),
            closed: AtomicBool::new(false),
        }
    }

    async fn push(&self, event: InvalidationEvent) -> StratumResult<()> {
        if self.is_closed() {
            return Err(EventError::ChannelClosed.into());
        }
        let kind = event.kind.as_str();
        let collection = event.collection.clone();
        let bytes = InvalidationMessage::new(self.sender_id, event).encode()?;
        match self.hub.send(bytes) {
            Ok(receivers) => {
                trace!(%collection, kind, receivers, "Pushed invalidation");
            }
            Err(_) => {
                debug!(%collection, kind, "No peers connected for invalidation");
            }
        }
        Ok(())
    }
}

async fn relay(sender_id: Uuid, mut rx: broadcast::Receiver<Vec<u8>>, bus: EventBus) {
    loop {
        match rx.recv().await {
            Ok(bytes) => {
                let message = match InvalidationMessage::decode(&bytes) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(sender = %sender_id, error = %e, "Dropping undecodable invalidation message");
                        continue;
                    }
                };
                if message.is_from(sender_id) {
                    trace!(sender = %sender_id, "Discarding own invalidation echo");
                    continue;
                }
                match message.into_event() {
                    Ok(event) => {
                        bus.publish(event);
                    }
                    Err(e) => {
                        warn!(sender = %sender_id, error = %e, "Dropping malformed invalidation message");
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(sender = %sender_id, skipped, "Invalidation relay lagged behind hub");
                bus.signal_lag(skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!(sender = %sender_id, "Broadcast hub closed, relay exiting");
                return;
            }
        }
    }
}

#[async_trait]
impl Updater for HubUpdater {
    fn sender_id(&self) -> Uuid {
        self.sender_id
    }

    fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    async fn push_update(&self, collection: &str, id: EntityId, data: &[u8]) -> StratumResult<()> {
        self.push(InvalidationEvent::update(collection, id, data.to_vec()))
            .await
    }

    async fn push_removal(&self, collection: &str, id: EntityId) -> StratumResult<()> {
        self.push(InvalidationEvent::removal(collection, id)).await
    }

    async fn push_clear(&self, collection: &str) -> StratumResult<()> {
        self.push(InvalidationEvent::clear(collection)).await
    }

    async fn close(&self) -> StratumResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(mut relay) = self.relay.lock() {
            if let Some(handle) = relay.take() {
                handle.abort();
            }
        }
        info!(sender = %self.sender_id, "Disconnected updater from broadcast hub");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for HubUpdater {
    fn drop(&mut self) {
        if let Ok(mut relay) = self.relay.lock() {
            if let Some(handle) = relay.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Delivery;
    use crate::message::EventKind;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_peer_receives_update() {
        let hub = BroadcastHub::new(64);
        let a = hub.connect(64);
        let b = hub.connect(64);
        assert_ne!(a.sender_id(), b.sender_id());
        let mut b_events = b.event_bus().subscribe("players");

        let id = Uuid::now_v7();
        a.push_update("players", id, b"payload").await.unwrap();

        let delivery = timeout(WAIT, b_events.recv()).await.unwrap();
        assert_eq!(
            delivery,
            Some(Delivery::Event(InvalidationEvent::update(
                "players",
                id,
                b"payload".to_vec()
            )))
        );
    }

    #[tokio::test]
    async fn test_own_messages_are_not_delivered_locally() {
        let hub = BroadcastHub::new(64);
        let a = hub.connect(64);
        let b = hub.connect(64);
        let mut a_events = a.event_bus().subscribe("players");
        let mut b_events = b.event_bus().subscribe("players");

        a.push_clear("players").await.unwrap();
        // Once B has it, A's relay has processed it too (same hub order).
        let delivery = timeout(WAIT, b_events.recv()).await.unwrap();
        assert!(matches!(delivery, Some(Delivery::Event(_))));

        b.push_removal("players", Uuid::nil()).await.unwrap();
        let delivery = timeout(WAIT, a_events.recv()).await.unwrap();
        match delivery {
            Some(Delivery::Event(event)) => {
                assert_eq!(event.kind, EventKind::Removal { id: Uuid::nil() });
            }
            other => panic!("expected B's removal first, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_garbage_on_hub_is_dropped() {
        let hub = BroadcastHub::new(64);
        let a = hub.connect(64);
        let b = hub.connect(64);
        let mut b_events = b.event_bus().subscribe("c");

        hub.publish_raw(b"not json".to_vec());
        a.push_clear("c").await.unwrap();

        let delivery = timeout(WAIT, b_events.recv()).await.unwrap();
        assert_eq!(delivery, Some(Delivery::Event(InvalidationEvent::clear("c"))));
    }

    #[tokio::test]
    async fn test_closed_updater_rejects_pushes() {
        let hub = BroadcastHub::new(8);
        let a = hub.connect(8);
        a.close().await.unwrap();
        assert!(a.is_closed());
        assert!(a.push_clear("c").await.is_err());
        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_lag_is_signalled_to_subscribers() {
        let hub = BroadcastHub::new(2);
        let a = hub.connect(64);
        let b = hub.connect(64);
        let mut b_events = b.event_bus().subscribe("players");

        a.push_removal("players", Uuid::now_v7()).await.unwrap();
        for i in 0..5u8 {
            a.push_update("players", Uuid::now_v7(), &[i]).await.unwrap();
        }

        let delivery = timeout(WAIT, b_events.recv()).await.unwrap();
        assert_eq!(delivery, Some(Delivery::Lagged(4)));
        let delivery = timeout(WAIT, b_events.recv()).await.unwrap();
        assert!(matches!(delivery, Some(Delivery::Event(_))));
    }

    #[tokio::test]
    async fn test_configured_capacity_bounds_the_bus() {
        let config = PipelineConfig::default().with_event_capacity(2);
        let hub = BroadcastHub::from_config(&PipelineConfig::default());
        let a = hub.connect_with(&PipelineConfig::default());
        let b = hub.connect_with(&config);
        let mut b_events = b.event_bus().subscribe("players");

        for _ in 0..5 {
            a.push_clear("players").await.unwrap();
        }
        // B's relay forwards all five onto a bus that only holds two.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(b_events.recv().await, Some(Delivery::Lagged(3))));
    }

    #[tokio::test]
    async fn test_push_without_peers_succeeds() {
        let hub = BroadcastHub::new(8);
        let a = hub.connect(8);
        assert_eq!(hub.connections(), 1);
        a.push_removal("c", Uuid::now_v7()).await.unwrap();
    }
}
