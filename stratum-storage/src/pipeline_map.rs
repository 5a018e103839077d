//! Per-collection tier multiplexer.
//!
//! A [`PipelineMap`] presents one map-shaped surface over the local cache,
//! shared cache and durable tiers of a collection.
//!
//! # Read path
//!
//! ```text
//! get(id) ─→ local? ──hit──→ return
//!              │ miss
//!              ↓
//!            shared? ──hit──→ promote to local (background) → return
//!              │ miss / failure (logged)
//!              ↓
//!            durable ──hit──→ promote to local + shared (background) → return
//!              │ miss
//!              ↓
//!            None
//! ```
//!
//! # Write path
//!
//! Writes go to every configured tier the [`QueryStrategy`] selects. The
//! sub-writes are independent: each is attempted and the first failure is
//! reported after the others ran. A local write is broadcast through the
//! [`Updater`] when one is attached; shared and durable writes are not.
//!
//! # Inbound events
//!
//! With both a local tier and an updater, a listener task drains the
//! updater's events for this collection and applies them to the local tier.
//! If the listener falls behind it clears the local tier, since it can no
//! longer tell which entries are stale.
//!
//! # Ordering
//!
//! Writes, removals, clears and inbound events hold the synchronizer's
//! [`WriteFence`]. A promotion started by a read is dropped when one of them
//! finishes first, so removed data never reappears in a cache.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use stratum_core::{
    EntityId, PipelineConfig, QueryStrategy, RawRecord, StorageError, StratumError, StratumResult,
    Tier, ValidationError,
};
use stratum_events::{CollectionEvents, Delivery, EventKind, InvalidationEvent, Updater};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::store::StoreMap;
use crate::synchronizer::{DataSynchronizer, TierMaps, WriteFence};

/// Tiered view of one collection.
pub struct PipelineMap {
    name: String,
    tiers: TierMaps,
    updater: Option<Arc<dyn Updater>>,
    synchronizer: DataSynchronizer,
    config: PipelineConfig,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for PipelineMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineMap")
            .field("name", &self.name)
            .field("tiers", &self.tiers.configured())
            .field("updater", &self.updater.as_ref().map(|u| u.sender_id()))
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PipelineMap {
    /// Combine the tier maps of `name` into one view.
    ///
    /// The updater is only kept when a local tier exists. Must be called
    /// inside a tokio runtime when it is kept, since the event listener is
    /// spawned here.
    pub fn new(
        name: impl Into<String>,
        tiers: TierMaps,
        updater: Option<Arc<dyn Updater>>,
        config: &PipelineConfig,
    ) -> Self {
        let name = name.into();
        let updater = if tiers.local.is_some() { updater } else { None };
        let synchronizer = DataSynchronizer::new(name.clone(), tiers.clone(), config.sync_workers);
        let listener = match (&tiers.local, &updater) {
            (Some(local), Some(updater)) => {
                let events = updater.event_bus().subscribe(name.clone());
                let fence = synchronizer.fence().clone();
                Some(tokio::spawn(listen(local.clone(), fence, events)))
            }
            _ => None,
        };
        debug!(
            collection = %name,
            tiers = %tiers.configured(),
            listening = listener.is_some(),
            "Opened pipeline map"
        );
        Self {
            name,
            tiers,
            updater,
            synchronizer,
            config: config.clone(),
            listener: Mutex::new(listener),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tiers(&self) -> &TierMaps {
        &self.tiers
    }

    pub fn synchronizer(&self) -> &DataSynchronizer {
        &self.synchronizer
    }

    pub fn updater(&self) -> Option<&Arc<dyn Updater>> {
        self.updater.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> StratumResult<()> {
        if self.is_closed() {
            return Err(StorageError::MapClosed {
                name: self.name.clone(),
            }
            .into());
        }
        Ok(())
    }

    // ========================================================================
    // READ PATH
    // ========================================================================

    /// Freshest available copy of `id`.
    pub async fn get(&self, id: EntityId) -> StratumResult<Option<RawRecord>> {
        self.get_decoded(id, |bytes| Ok(bytes.to_vec())).await
    }

    /// Read `id` and decode it with `decode`.
    ///
    /// A cache hit that fails to decode counts as a miss and the read moves
    /// on to the next tier. A durable hit that fails to decode is an error.
    pub async fn get_decoded<T, F>(&self, id: EntityId, decode: F) -> StratumResult<Option<T>>
    where
        F: Fn(&[u8]) -> StratumResult<T> + Send + Sync,
        T: Send,
    {
        self.ensure_open()?;
        let observed = self.synchronizer.fence().generation();

        if let Some(local) = &self.tiers.local {
            if let Some(value) = self.read_cache(Tier::Local, local, id, &decode).await {
                trace!(collection = %self.name, %id, "Local cache hit");
                return Ok(Some(value.1));
            }
        }

        if let Some(shared) = &self.tiers.shared {
            if let Some((data, value)) = self.read_cache(Tier::Shared, shared, id, &decode).await {
                debug!(collection = %self.name, %id, "Shared cache hit");
                self.promote(id, data, QueryStrategy::LOCAL_CACHE, observed);
                return Ok(Some(value));
            }
        }

        match self.tiers.durable.get(id).await? {
            Some(data) => {
                let value = decode(&data)?;
                debug!(collection = %self.name, %id, "Durable hit");
                self.promote(
                    id,
                    data,
                    QueryStrategy::LOCAL_CACHE | QueryStrategy::GLOBAL_CACHE,
                    observed,
                );
                Ok(Some(value))
            }
            None => {
                trace!(collection = %self.name, %id, "Miss on every tier");
                Ok(None)
            }
        }
    }

    /// Cache lookup where failures of any kind read as a miss.
    async fn read_cache<T, F>(
        &self,
        tier: Tier,
        map: &Arc<dyn StoreMap>,
        id: EntityId,
        decode: &F,
    ) -> Option<(RawRecord, T)>
    where
        F: Fn(&[u8]) -> StratumResult<T> + Send + Sync,
        T: Send,
    {
        let data = match map.get(id).await {
            Ok(found) => found?,
            Err(e) => {
                warn!(collection = %self.name, %id, %tier, error = %e, "Cache read failed, falling back");
                return None;
            }
        };
        match decode(&data) {
            Ok(value) => Some((data, value)),
            Err(e) => {
                warn!(collection = %self.name, %id, %tier, error = %e, "Undecodable cache entry, falling back");
                None
            }
        }
    }

    /// Copy `data`, read at fence generation `observed`, into the faster
    /// tiers in the background.
    fn promote(&self, id: EntityId, data: RawRecord, destinations: QueryStrategy, observed: u64) {
        let destinations = destinations & self.tiers.configured();
        if !destinations.is_empty() {
            self.synchronizer
                .synchronize_to_since(id, data, destinations, observed);
        }
    }

    // ========================================================================
    // WRITE PATH
    // ========================================================================

    /// Write `data` into every configured tier `strategy` selects.
    ///
    /// # Errors
    ///
    /// - `ValidationError::EmptyStrategy` when `strategy` is empty
    /// - The first tier failure, after every selected tier was attempted
    pub async fn put(&self, id: EntityId, data: RawRecord, strategy: QueryStrategy) -> StratumResult<()> {
        self.ensure_open()?;
        if strategy.is_empty() {
            return Err(ValidationError::EmptyStrategy {
                operation: "put".to_string(),
            }
            .into());
        }

        let _fence = self.synchronizer.fence().exclusive().await;
        let mut failure = None;

        if strategy.contains(QueryStrategy::LOCAL_CACHE) {
            if let Some(local) = &self.tiers.local {
                record(&mut failure, Tier::Local, &self.name, local.put(id, data.clone()).await);
            }
            if let Some(updater) = &self.updater {
                if let Err(e) = updater.push_update(&self.name, id, &data).await {
                    warn!(collection = %self.name, %id, error = %e, "Failed to broadcast update");
                }
            }
        }
        if strategy.contains(QueryStrategy::GLOBAL_CACHE) {
            if let Some(shared) = &self.tiers.shared {
                record(&mut failure, Tier::Shared, &self.name, shared.put(id, data.clone()).await);
            }
        }
        if strategy.contains(QueryStrategy::GLOBAL_STORAGE) {
            record(&mut failure, Tier::Durable, &self.name, self.tiers.durable.put(id, data).await);
        }

        failure.map_or(Ok(()), Err)
    }

    /// Whether any configured tier `strategy` selects holds `id`.
    ///
    /// An empty strategy answers `false`. Cache failures read as absent.
    pub async fn exists(&self, id: EntityId, strategy: QueryStrategy) -> StratumResult<bool> {
        self.ensure_open()?;
        for tier in strategy.tiers() {
            let Some(map) = self.tiers.get(tier) else {
                continue;
            };
            match map.contains(id).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) if tier != Tier::Durable => {
                    warn!(collection = %self.name, %id, %tier, error = %e, "Cache lookup failed, treating as absent");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    /// Remove `id` from every configured tier `strategy` selects.
    ///
    /// Returns whether any tier held it. An empty strategy is a no-op.
    pub async fn remove(&self, id: EntityId, strategy: QueryStrategy) -> StratumResult<bool> {
        self.ensure_open()?;
        let _fence = self.synchronizer.fence().exclusive().await;
        let mut failure = None;
        let mut removed = false;

        for tier in strategy.tiers() {
            let Some(map) = self.tiers.get(tier) else {
                continue;
            };
            match map.remove(id).await {
                Ok(found) => removed |= found,
                Err(e) => record(&mut failure, tier, &self.name, Err(e)),
            }
        }
        if strategy.contains(QueryStrategy::LOCAL_CACHE) {
            if let Some(updater) = &self.updater {
                if let Err(e) = updater.push_removal(&self.name, id).await {
                    warn!(collection = %self.name, %id, error = %e, "Failed to broadcast removal");
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    /// Clear every configured tier `strategy` selects. An empty strategy is a no-op.
    pub async fn clear(&self, strategy: QueryStrategy) -> StratumResult<()> {
        self.ensure_open()?;
        let _fence = self.synchronizer.fence().exclusive().await;
        let mut failure = None;
        for tier in strategy.tiers() {
            if let Some(map) = self.tiers.get(tier) {
                record(&mut failure, tier, &self.name, map.clear().await);
            }
        }
        if strategy.contains(QueryStrategy::LOCAL_CACHE) {
            if let Some(updater) = &self.updater {
                if let Err(e) = updater.push_clear(&self.name).await {
                    warn!(collection = %self.name, error = %e, "Failed to broadcast clear");
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }

    // ========================================================================
    // ENUMERATION (durable tier is the source of truth)
    // ========================================================================

    pub async fn size(&self) -> StratumResult<usize> {
        self.ensure_open()?;
        self.tiers.durable.size().await
    }

    pub async fn entries(&self) -> StratumResult<Vec<(EntityId, RawRecord)>> {
        self.ensure_open()?;
        self.tiers.durable.entries().await
    }

    pub async fn keys(&self) -> StratumResult<Vec<EntityId>> {
        self.ensure_open()?;
        self.tiers.durable.keys().await
    }

    pub async fn values(&self) -> StratumResult<Vec<RawRecord>> {
        self.ensure_open()?;
        self.tiers.durable.values().await
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Stop the event listener and the synchronizer. Idempotent.
    ///
    /// The tier maps themselves belong to the owning store.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_listener();
        self.synchronizer.close(self.config.shutdown_timeout).await;
        info!(collection = %self.name, "Closed pipeline map");
    }

    fn stop_listener(&self) {
        if let Ok(mut listener) = self.listener.lock() {
            if let Some(handle) = listener.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for PipelineMap {
    fn drop(&mut self) {
        self.stop_listener();
    }
}

/// Keep the first failure, log every one.
fn record(failure: &mut Option<StratumError>, tier: Tier, collection: &str, result: StratumResult<()>) {
    if let Err(e) = result {
        warn!(%collection, %tier, error = %e, "Tier write failed");
        failure.get_or_insert(e);
    }
}

/// Apply remote mutations of one collection to the local tier.
async fn listen(local: Arc<dyn StoreMap>, fence: Arc<WriteFence>, mut events: CollectionEvents) {
    while let Some(delivery) = events.recv().await {
        let _fence = fence.exclusive().await;
        match delivery {
            Delivery::Event(event) => apply(local.as_ref(), event).await,
            Delivery::Lagged(skipped) => {
                warn!(
                    collection = %events.collection(),
                    skipped,
                    "Invalidation listener lagged, clearing local cache"
                );
                if let Err(e) = local.clear().await {
                    warn!(collection = %events.collection(), error = %e, "Failed to clear local cache after lag");
                }
            }
        }
    }
    debug!(collection = %events.collection(), "Invalidation listener stopped");
}

async fn apply(local: &dyn StoreMap, event: InvalidationEvent) {
    let kind = event.kind.as_str();
    let result = match event.kind {
        EventKind::Update { id, data } => local.put(id, data).await,
        EventKind::Removal { id } => local.remove(id).await.map(|_| ()),
        EventKind::Clear => local.clear().await,
    };
    match result {
        Ok(()) => trace!(collection = %event.collection, kind, "Applied remote invalidation"),
        Err(e) => {
            warn!(collection = %event.collection, kind, error = %e, "Failed to apply remote invalidation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::Store;
    use async_trait::async_trait;
    use std::time::Duration;
    use stratum_core::TierOptions;
    use stratum_events::BroadcastHub;
    use uuid::Uuid;

    /// Shared tier that is always unreachable.
    #[derive(Debug)]
    struct UnreachableMap;

    #[async_trait]
    impl StoreMap for UnreachableMap {
        fn name(&self) -> &str {
            "unreachable"
        }
        fn is_closed(&self) -> bool {
            false
        }
        async fn get(&self, _id: EntityId) -> StratumResult<Option<RawRecord>> {
            Err(StratumError::backend(Tier::Shared, "connection refused"))
        }
        async fn put(&self, _id: EntityId, _data: RawRecord) -> StratumResult<()> {
            Err(StratumError::backend(Tier::Shared, "connection refused"))
        }
        async fn contains(&self, _id: EntityId) -> StratumResult<bool> {
            Err(StratumError::backend(Tier::Shared, "connection refused"))
        }
        async fn remove(&self, _id: EntityId) -> StratumResult<bool> {
            Err(StratumError::backend(Tier::Shared, "connection refused"))
        }
        async fn clear(&self) -> StratumResult<()> {
            Err(StratumError::backend(Tier::Shared, "connection refused"))
        }
        async fn size(&self) -> StratumResult<usize> {
            Err(StratumError::backend(Tier::Shared, "connection refused"))
        }
        async fn entries(&self) -> StratumResult<Vec<(EntityId, RawRecord)>> {
            Err(StratumError::backend(Tier::Shared, "connection refused"))
        }
    }

    async fn open(store: &MemoryStore) -> Arc<dyn StoreMap> {
        store.open_map("players", &TierOptions::default()).await.unwrap()
    }

    async fn three_tiers() -> TierMaps {
        TierMaps {
            local: Some(open(&MemoryStore::new()).await),
            shared: Some(open(&MemoryStore::for_tier(Tier::Shared)).await),
            durable: open(&MemoryStore::for_tier(Tier::Durable)).await,
        }
    }

    fn local(map: &PipelineMap) -> &Arc<dyn StoreMap> {
        map.tiers().local.as_ref().unwrap()
    }

    fn shared(map: &PipelineMap) -> &Arc<dyn StoreMap> {
        map.tiers().shared.as_ref().unwrap()
    }

    async fn eventually_contains(map: &Arc<dyn StoreMap>, id: EntityId) -> bool {
        for _ in 0..200 {
            if map.contains(id).await.unwrap() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_durable_hit_promotes_to_caches() {
        let map = PipelineMap::new("players", three_tiers().await, None, &PipelineConfig::default());
        let id = Uuid::now_v7();
        map.tiers().durable.put(id, b"d".to_vec()).await.unwrap();

        assert_eq!(map.get(id).await.unwrap(), Some(b"d".to_vec()));
        map.synchronizer().wait_idle().await;
        assert_eq!(local(&map).get(id).await.unwrap(), Some(b"d".to_vec()));
        assert_eq!(shared(&map).get(id).await.unwrap(), Some(b"d".to_vec()));
    }

    #[tokio::test]
    async fn test_shared_hit_promotes_to_local_only() {
        let map = PipelineMap::new("players", three_tiers().await, None, &PipelineConfig::default());
        let id = Uuid::now_v7();
        shared(&map).put(id, b"s".to_vec()).await.unwrap();

        assert_eq!(map.get(id).await.unwrap(), Some(b"s".to_vec()));
        map.synchronizer().wait_idle().await;
        assert_eq!(local(&map).get(id).await.unwrap(), Some(b"s".to_vec()));
        assert!(!map.tiers().durable.contains(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_local_cache_takes_precedence() {
        let map = PipelineMap::new("players", three_tiers().await, None, &PipelineConfig::default());
        let id = Uuid::now_v7();
        local(&map).put(id, b"local".to_vec()).await.unwrap();
        shared(&map).put(id, b"shared".to_vec()).await.unwrap();
        map.tiers().durable.put(id, b"durable".to_vec()).await.unwrap();

        assert_eq!(map.get(id).await.unwrap(), Some(b"local".to_vec()));
        assert_eq!(map.synchronizer().pending(), 0);
    }

    #[tokio::test]
    async fn test_storage_write_leaves_caches_alone() {
        let map = PipelineMap::new("players", three_tiers().await, None, &PipelineConfig::default());
        let id = Uuid::now_v7();
        map.put(id, b"v".to_vec(), QueryStrategy::GLOBAL_STORAGE)
            .await
            .unwrap();

        assert!(!local(&map).contains(id).await.unwrap());
        assert!(!shared(&map).contains(id).await.unwrap());
        assert!(map.exists(id, QueryStrategy::GLOBAL_STORAGE).await.unwrap());
        assert!(!map
            .exists(id, QueryStrategy::LOCAL_CACHE | QueryStrategy::GLOBAL_CACHE)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_shared_failure_falls_back_to_durable() {
        let mut tiers = three_tiers().await;
        tiers.shared = Some(Arc::new(UnreachableMap));
        let map = PipelineMap::new("players", tiers, None, &PipelineConfig::default());
        let id = Uuid::now_v7();
        map.tiers().durable.put(id, b"d".to_vec()).await.unwrap();

        assert_eq!(map.get(id).await.unwrap(), Some(b"d".to_vec()));
        assert!(map.exists(id, QueryStrategy::ALL).await.unwrap());
        map.synchronizer().wait_idle().await;
        assert!(local(&map).contains(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_partial_write_failure_keeps_other_tiers() {
        let mut tiers = three_tiers().await;
        tiers.shared = Some(Arc::new(UnreachableMap));
        let map = PipelineMap::new("players", tiers, None, &PipelineConfig::default());
        let id = Uuid::now_v7();

        let err = map.put(id, b"v".to_vec(), QueryStrategy::ALL).await.unwrap_err();
        assert!(matches!(err, StratumError::Storage(StorageError::Backend { tier: Tier::Shared, .. })));
        assert!(local(&map).contains(id).await.unwrap());
        assert!(map.tiers().durable.contains(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_undecodable_cache_entry_is_a_miss() {
        let map = PipelineMap::new("players", three_tiers().await, None, &PipelineConfig::default());
        let id = Uuid::now_v7();
        local(&map).put(id, b"garbage".to_vec()).await.unwrap();
        map.tiers().durable.put(id, b"7".to_vec()).await.unwrap();

        let decode = |bytes: &[u8]| {
            std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .ok_or_else(|| StratumError::from(StorageError::Codec { reason: "nan".into() }))
        };
        assert_eq!(map.get_decoded(id, decode).await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_empty_strategy() {
        let map = PipelineMap::new("players", three_tiers().await, None, &PipelineConfig::default());
        let id = Uuid::now_v7();
        map.put(id, b"v".to_vec(), QueryStrategy::ALL).await.unwrap();

        let err = map.put(id, b"w".to_vec(), QueryStrategy::empty()).await.unwrap_err();
        assert!(matches!(err, StratumError::Validation(ValidationError::EmptyStrategy { .. })));
        assert!(!map.exists(id, QueryStrategy::empty()).await.unwrap());
        assert!(!map.remove(id, QueryStrategy::empty()).await.unwrap());
        map.clear(QueryStrategy::empty()).await.unwrap();
        assert_eq!(map.get(id).await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_remove_then_get_is_absent() {
        let map = PipelineMap::new("players", three_tiers().await, None, &PipelineConfig::default());
        let id = Uuid::now_v7();
        map.put(id, b"v".to_vec(), QueryStrategy::ALL).await.unwrap();

        assert!(map.remove(id, QueryStrategy::ALL).await.unwrap());
        assert_eq!(map.get(id).await.unwrap(), None);
        assert!(!map.remove(id, QueryStrategy::ALL).await.unwrap());
    }

    #[tokio::test]
    async fn test_removal_outruns_pending_promotion() {
        let map = PipelineMap::new("players", three_tiers().await, None, &PipelineConfig::default());
        let id = Uuid::now_v7();
        map.put(id, b"v".to_vec(), QueryStrategy::GLOBAL_STORAGE)
            .await
            .unwrap();

        // The durable hit queues a promotion that has not run yet.
        assert_eq!(map.get(id).await.unwrap(), Some(b"v".to_vec()));
        assert!(map.remove(id, QueryStrategy::ALL).await.unwrap());
        map.synchronizer().wait_idle().await;

        assert_eq!(map.get(id).await.unwrap(), None);
        assert!(!map.exists(id, QueryStrategy::ALL).await.unwrap());
        assert!(!local(&map).contains(id).await.unwrap());
        assert!(!shared(&map).contains(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_outruns_pending_promotion() {
        let map = PipelineMap::new("players", three_tiers().await, None, &PipelineConfig::default());
        let id = Uuid::now_v7();
        shared(&map).put(id, b"s".to_vec()).await.unwrap();

        assert_eq!(map.get(id).await.unwrap(), Some(b"s".to_vec()));
        map.clear(QueryStrategy::ALL).await.unwrap();
        map.synchronizer().wait_idle().await;

        assert!(!map.exists(id, QueryStrategy::ALL).await.unwrap());
    }

    #[tokio::test]
    async fn test_newer_write_is_not_overwritten_by_promotion() {
        let map = PipelineMap::new("players", three_tiers().await, None, &PipelineConfig::default());
        let id = Uuid::now_v7();
        map.tiers().durable.put(id, b"old".to_vec()).await.unwrap();

        assert_eq!(map.get(id).await.unwrap(), Some(b"old".to_vec()));
        map.put(id, b"new".to_vec(), QueryStrategy::ALL).await.unwrap();
        map.synchronizer().wait_idle().await;

        assert_eq!(local(&map).get(id).await.unwrap(), Some(b"new".to_vec()));
        assert_eq!(shared(&map).get(id).await.unwrap(), Some(b"new".to_vec()));
    }

    #[tokio::test]
    async fn test_remove_scoped_to_cache_keeps_durable() {
        let map = PipelineMap::new("players", three_tiers().await, None, &PipelineConfig::default());
        let id = Uuid::now_v7();
        map.put(id, b"v".to_vec(), QueryStrategy::ALL).await.unwrap();

        map.remove(id, QueryStrategy::LOCAL_CACHE | QueryStrategy::GLOBAL_CACHE)
            .await
            .unwrap();
        assert!(!local(&map).contains(id).await.unwrap());
        assert_eq!(map.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_local_write_reaches_peer_local_cache() {
        let hub = BroadcastHub::new(64);
        let config = PipelineConfig::default();
        let durable = open(&MemoryStore::for_tier(Tier::Durable)).await;
        let peer_tiers = |local| TierMaps {
            local: Some(local),
            shared: None,
            durable: durable.clone(),
        };

        let a = PipelineMap::new(
            "players",
            peer_tiers(open(&MemoryStore::new()).await),
            Some(Arc::new(hub.connect(64))),
            &config,
        );
        let b = PipelineMap::new(
            "players",
            peer_tiers(open(&MemoryStore::new()).await),
            Some(Arc::new(hub.connect(64))),
            &config,
        );

        let id = Uuid::now_v7();
        assert!(!local(&b).contains(id).await.unwrap());
        a.put(id, b"from-a".to_vec(), QueryStrategy::LOCAL_CACHE)
            .await
            .unwrap();
        assert!(eventually_contains(local(&b), id).await);
        assert_eq!(local(&b).get(id).await.unwrap(), Some(b"from-a".to_vec()));

        a.remove(id, QueryStrategy::LOCAL_CACHE).await.unwrap();
        for _ in 0..200 {
            if !local(&b).contains(id).await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!local(&b).contains(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_lagged_listener_clears_local_cache() {
        let hub = BroadcastHub::new(64);
        let config = PipelineConfig::default();
        let sender = hub.connect(64);
        let map = PipelineMap::new(
            "players",
            three_tiers().await,
            Some(Arc::new(hub.connect(1))),
            &config,
        );
        let sentinel = Uuid::now_v7();
        local(&map).put(sentinel, vec![0]).await.unwrap();

        let mut last = sentinel;
        for i in 0..5u8 {
            last = Uuid::now_v7();
            sender.push_update("players", last, &[i]).await.unwrap();
        }
        assert!(eventually_contains(local(&map), last).await);
        assert!(!local(&map).contains(sentinel).await.unwrap());
    }

    #[tokio::test]
    async fn test_relay_lag_clears_peer_local_cache() {
        let hub = BroadcastHub::new(2);
        let config = PipelineConfig::default();
        let sender = hub.connect(64);
        let map = PipelineMap::new(
            "players",
            three_tiers().await,
            Some(Arc::new(hub.connect(64))),
            &config,
        );
        let stale = Uuid::now_v7();
        local(&map).put(stale, b"stale".to_vec()).await.unwrap();

        sender.push_removal("players", stale).await.unwrap();
        let mut last = stale;
        for i in 0..5u8 {
            last = Uuid::now_v7();
            sender.push_update("players", last, &[i]).await.unwrap();
        }
        assert!(eventually_contains(local(&map), last).await);
        assert!(!local(&map).contains(stale).await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_map_fails_fast() {
        let map = PipelineMap::new("players", three_tiers().await, None, &PipelineConfig::default());
        map.close().await;
        map.close().await;
        assert!(map.is_closed());
        assert!(matches!(
            map.get(Uuid::now_v7()).await,
            Err(StratumError::Storage(StorageError::MapClosed { .. }))
        ));
    }

    #[tokio::test]
    async fn test_updater_dropped_without_local_tier() {
        let hub = BroadcastHub::new(8);
        let durable = open(&MemoryStore::new()).await;
        let map = PipelineMap::new(
            "players",
            TierMaps::durable_only(durable),
            Some(Arc::new(hub.connect(8))),
            &PipelineConfig::default(),
        );
        assert!(map.updater().is_none());
    }
}
