//! The invalidation channel contract.

use async_trait::async_trait;
use stratum_core::{EntityId, StratumResult};
use uuid::Uuid;

use crate::bus::EventBus;

/// Cross-process broadcaster of cache mutations.
///
/// Implementations tag every outgoing message with [`sender_id`] and deliver
/// inbound messages to their [`event_bus`], discarding the ones carrying
/// their own sender id.
///
/// The `push_*` futures resolve once the broadcast has been handed to the
/// transport; delivery to other processes is not awaited or guaranteed.
///
/// [`sender_id`]: Updater::sender_id
/// [`event_bus`]: Updater::event_bus
#[async_trait]
pub trait Updater: Send + Sync {
    /// Stable per-instance identifier used to reject echoes.
    fn sender_id(&self) -> Uuid;

    /// Local bus carrying events from other processes.
    fn event_bus(&self) -> &EventBus;

    /// Broadcast that `id` now holds `data` in `collection`.
    async fn push_update(&self, collection: &str, id: EntityId, data: &[u8]) -> StratumResult<()>;

    /// Broadcast that `id` was removed from `collection`.
    async fn push_removal(&self, collection: &str, id: EntityId) -> StratumResult<()>;

    /// Broadcast that `collection` was cleared.
    async fn push_clear(&self, collection: &str) -> StratumResult<()>;

    /// Stop publishing and receiving.
    async fn close(&self) -> StratumResult<()>;

    fn is_closed(&self) -> bool;
}
