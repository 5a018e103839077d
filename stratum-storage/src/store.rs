//! Tier contracts.
//!
//! Every tier (local cache, shared cache, durable store) implements the same
//! two traits. A [`Store`] manages named maps; a [`StoreMap`] is the
//! per-collection key/value surface keyed by [`EntityId`] holding opaque bytes.
//!
//! # Contract
//!
//! - Absence is a value, never an error: lookups return `Option`/`bool`.
//! - `open_map` is idempotent; reopening a name returns the live handle.
//! - `close_map` drops the in-process handle and keeps the data.
//! - `remove_map` destroys the data.
//! - All methods are safe to call concurrently.

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use stratum_core::{EntityId, RawRecord, StratumResult, TierOptions};

/// Per-collection key/value surface of one tier.
#[async_trait]
pub trait StoreMap: Debug + Send + Sync {
    /// Name of the collection this map backs.
    fn name(&self) -> &str;

    /// Whether this handle has been closed.
    fn is_closed(&self) -> bool;

    async fn get(&self, id: EntityId) -> StratumResult<Option<RawRecord>>;

    /// Insert or overwrite the record for `id`.
    async fn put(&self, id: EntityId, data: RawRecord) -> StratumResult<()>;

    async fn contains(&self, id: EntityId) -> StratumResult<bool>;

    /// Remove `id`, returning whether it was present.
    async fn remove(&self, id: EntityId) -> StratumResult<bool>;

    async fn clear(&self) -> StratumResult<()>;

    async fn size(&self) -> StratumResult<usize>;

    /// Full enumeration of live records.
    async fn entries(&self) -> StratumResult<Vec<(EntityId, RawRecord)>>;

    async fn keys(&self) -> StratumResult<Vec<EntityId>> {
        Ok(self.entries().await?.into_iter().map(|(id, _)| id).collect())
    }

    async fn values(&self) -> StratumResult<Vec<RawRecord>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .map(|(_, data)| data)
            .collect())
    }
}

/// A tier: a set of named [`StoreMap`]s.
#[async_trait]
pub trait Store: Debug + Send + Sync {
    /// Open (or return the already open) map called `name`.
    async fn open_map(&self, name: &str, options: &TierOptions) -> StratumResult<Arc<dyn StoreMap>>;

    async fn has_map(&self, name: &str) -> StratumResult<bool>;

    /// Release the handle for `name`, keeping its data.
    async fn close_map(&self, name: &str) -> StratumResult<()>;

    /// Destroy `name` and its data.
    async fn remove_map(&self, name: &str) -> StratumResult<()>;

    /// Names of every map with data in this tier.
    async fn maps(&self) -> StratumResult<BTreeSet<String>>;

    fn is_closed(&self) -> bool;

    /// Close every open map and the tier itself.
    async fn close(&self) -> StratumResult<()>;
}
