//! Inter-tier record copying.
//!
//! A [`DataSynchronizer`] holds the tier maps of one collection and copies a
//! single record's bytes between them. The synchronous forms are awaited by
//! the caller; the `synchronize_*` forms run on spawned tasks (at most
//! `sync_workers` at a time) and are used for cache warming that must not
//! hold up reads.
//!
//! Background failures are logged and reported as `false`/`None` through
//! the returned handle; they never bring the synchronizer down.
//!
//! Background writes are fenced against foreground mutations: a copy whose
//! source was read before a put, remove or clear finished is discarded
//! instead of resurrecting the old bytes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stratum_core::{EntityId, QueryStrategy, RawRecord, StratumResult, Tier};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, warn};

use crate::store::StoreMap;

/// The tier maps of one collection. Local and shared are optional.
#[derive(Debug, Clone)]
pub struct TierMaps {
    pub local: Option<Arc<dyn StoreMap>>,
    pub shared: Option<Arc<dyn StoreMap>>,
    pub durable: Arc<dyn StoreMap>,
}

impl TierMaps {
    pub fn durable_only(durable: Arc<dyn StoreMap>) -> Self {
        Self {
            local: None,
            shared: None,
            durable,
        }
    }

    /// The map for `tier`, when configured.
    pub fn get(&self, tier: Tier) -> Option<&Arc<dyn StoreMap>> {
        match tier {
            Tier::Local => self.local.as_ref(),
            Tier::Shared => self.shared.as_ref(),
            Tier::Durable => Some(&self.durable),
        }
    }

    /// Tiers that are configured, as a strategy set.
    pub fn configured(&self) -> QueryStrategy {
        Tier::ALL
            .into_iter()
            .filter(|tier| self.get(*tier).is_some())
            .collect()
    }
}

// ============================================================================
// WRITE FENCE
// ============================================================================

/// Orders background copies against foreground mutations of one collection.
///
/// Every mutation runs under [`exclusive`](WriteFence::exclusive) and bumps
/// the generation before releasing the gate. A background copy records the
/// generation before it reads its source and only writes while the
/// generation is unchanged.
#[derive(Debug, Default)]
pub struct WriteFence {
    generation: AtomicU64,
    gate: RwLock<()>,
}

/// Held for the duration of a foreground mutation.
#[derive(Debug)]
pub struct FenceGuard<'a> {
    fence: &'a WriteFence,
    _gate: RwLockWriteGuard<'a, ()>,
}

impl Drop for FenceGuard<'_> {
    fn drop(&mut self) {
        // Runs before the gate field is released.
        self.fence.generation.fetch_add(1, Ordering::SeqCst);
    }
}

impl WriteFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutations finished so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Block background copies until the returned guard drops.
    pub async fn exclusive(&self) -> FenceGuard<'_> {
        let gate = self.gate.write().await;
        FenceGuard {
            fence: self,
            _gate: gate,
        }
    }

    /// Admit a background write whose data was read at `observed`.
    ///
    /// `None` when a mutation has finished since.
    pub async fn admit(&self, observed: u64) -> Option<RwLockReadGuard<'_, ()>> {
        let gate = self.gate.read().await;
        (self.generation() == observed).then_some(gate)
    }
}

// ============================================================================
// DATA SYNCHRONIZER
// ============================================================================

#[derive(Debug)]
struct Shared {
    collection: String,
    tiers: TierMaps,
    fence: Arc<WriteFence>,
    closed: AtomicBool,
}

impl Shared {
    async fn to(&self, id: EntityId, data: &[u8], destinations: QueryStrategy) -> StratumResult<bool> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.write(id, data, destinations).await?;
        Ok(true)
    }

    /// Fenced form of `to` for data read at generation `observed`.
    async fn to_since(
        &self,
        id: EntityId,
        data: &[u8],
        destinations: QueryStrategy,
        observed: u64,
    ) -> StratumResult<bool> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let Some(_admitted) = self.fence.admit(observed).await else {
            debug!(collection = %self.collection, %id, "Discarded copy overtaken by a mutation");
            return Ok(false);
        };
        self.write(id, data, destinations).await?;
        Ok(true)
    }

    async fn write(&self, id: EntityId, data: &[u8], destinations: QueryStrategy) -> StratumResult<()> {
        for tier in destinations.tiers() {
            if let Some(map) = self.tiers.get(tier) {
                map.put(id, data.to_vec()).await?;
                debug!(collection = %self.collection, %id, %tier, "Synchronized record into tier");
            }
        }
        Ok(())
    }

    async fn from(&self, id: EntityId, source: Tier) -> StratumResult<Option<RawRecord>> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        match self.tiers.get(source) {
            Some(map) => map.get(id).await,
            None => Ok(None),
        }
    }

    async fn from_to(
        &self,
        id: EntityId,
        source: Tier,
        destinations: QueryStrategy,
    ) -> StratumResult<bool> {
        match self.from(id, source).await? {
            Some(data) => self.to(id, &data, destinations).await,
            None => Ok(false),
        }
    }

    async fn from_to_since(
        &self,
        id: EntityId,
        source: Tier,
        destinations: QueryStrategy,
        observed: u64,
    ) -> StratumResult<bool> {
        match self.from(id, source).await? {
            Some(data) => self.to_since(id, &data, destinations, observed).await,
            None => Ok(false),
        }
    }
}

/// Copies records between the tiers of one collection.
#[derive(Debug)]
pub struct DataSynchronizer {
    shared: Arc<Shared>,
    permits: Arc<Semaphore>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl DataSynchronizer {
    /// Create a synchronizer running at most `workers` background copies at once.
    pub fn new(collection: impl Into<String>, tiers: TierMaps, workers: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                collection: collection.into(),
                tiers,
                fence: Arc::new(WriteFence::new()),
                closed: AtomicBool::new(false),
            }),
            permits: Arc::new(Semaphore::new(workers.max(1))),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn tiers(&self) -> &TierMaps {
        &self.shared.tiers
    }

    /// Fence that foreground mutations of this collection must hold.
    pub fn fence(&self) -> &Arc<WriteFence> {
        &self.shared.fence
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Write `data` into every configured tier in `destinations`.
    ///
    /// Returns `Ok(false)` once closed.
    pub async fn to(
        &self,
        id: EntityId,
        data: &[u8],
        destinations: QueryStrategy,
    ) -> StratumResult<bool> {
        self.shared.to(id, data, destinations).await
    }

    /// Read `id` from exactly one tier. Unconfigured tiers read as absent.
    pub async fn from(&self, id: EntityId, source: Tier) -> StratumResult<Option<RawRecord>> {
        self.shared.from(id, source).await
    }

    /// Copy `id` from `source` into `destinations`.
    ///
    /// Returns `Ok(false)` without writing anything when `source` lacks the id.
    pub async fn from_to(
        &self,
        id: EntityId,
        source: Tier,
        destinations: QueryStrategy,
    ) -> StratumResult<bool> {
        self.shared.from_to(id, source, destinations).await
    }

    /// Background form of [`to`](Self::to).
    ///
    /// Dropped when a fenced mutation finishes before the write starts.
    pub fn synchronize_to(
        &self,
        id: EntityId,
        data: RawRecord,
        destinations: QueryStrategy,
    ) -> JoinHandle<bool> {
        let observed = self.shared.fence.generation();
        self.synchronize_to_since(id, data, destinations, observed)
    }

    /// Background write of `data` read at fence generation `observed`.
    ///
    /// Writes nothing and yields `false` if any fenced mutation finished
    /// after `observed` was taken.
    pub fn synchronize_to_since(
        &self,
        id: EntityId,
        data: RawRecord,
        destinations: QueryStrategy,
        observed: u64,
    ) -> JoinHandle<bool> {
        self.spawn(move |shared| async move {
            match shared.to_since(id, &data, destinations, observed).await {
                Ok(done) => done,
                Err(e) => {
                    error!(collection = %shared.collection, %id, error = %e, "Background synchronize_to failed");
                    false
                }
            }
        })
    }

    /// Background form of [`from`](Self::from).
    pub fn synchronize_from(&self, id: EntityId, source: Tier) -> JoinHandle<Option<RawRecord>> {
        self.spawn(move |shared| async move {
            match shared.from(id, source).await {
                Ok(data) => data,
                Err(e) => {
                    error!(collection = %shared.collection, %id, %source, error = %e, "Background synchronize_from failed");
                    None
                }
            }
        })
    }

    /// Background form of [`from_to`](Self::from_to).
    pub fn synchronize_from_to(
        &self,
        id: EntityId,
        source: Tier,
        destinations: QueryStrategy,
    ) -> JoinHandle<bool> {
        let observed = self.shared.fence.generation();
        self.spawn(move |shared| async move {
            match shared.from_to_since(id, source, destinations, observed).await {
                Ok(done) => done,
                Err(e) => {
                    error!(collection = %shared.collection, %id, %source, error = %e, "Background synchronize_from_to failed");
                    false
                }
            }
        })
    }

    fn spawn<T, F, Fut>(&self, task: F) -> JoinHandle<T>
    where
        T: Default + Send + 'static,
        F: FnOnce(Arc<Shared>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = T> + Send + 'static,
    {
        let shared = self.shared.clone();
        let permits = self.permits.clone();
        let handle = tokio::spawn(async move {
            if shared.closed.load(Ordering::SeqCst) {
                return T::default();
            }
            let Ok(_permit) = permits.acquire_owned().await else {
                return T::default();
            };
            task(shared).await
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|task| !task.is_finished());
            tasks.push(handle.abort_handle());
        }
        handle
    }

    /// Number of background tasks not yet finished.
    pub fn pending(&self) -> usize {
        self.tasks
            .lock()
            .map(|tasks| tasks.iter().filter(|task| !task.is_finished()).count())
            .unwrap_or(0)
    }

    /// Wait until every background task submitted so far has finished.
    pub async fn wait_idle(&self) {
        while self.pending() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Stop accepting work, let in-flight tasks finish for up to `timeout`,
    /// then abort whatever remains. Later calls return failure.
    pub async fn close(&self, timeout: Duration) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if tokio::time::timeout(timeout, self.wait_idle()).await.is_err() {
            let aborted = self.drain_tasks();
            warn!(collection = %self.shared.collection, aborted, "Aborted background synchronization on close");
        }
        self.permits.close();
        debug!(collection = %self.shared.collection, "Closed data synchronizer");
    }

    fn drain_tasks(&self) -> usize {
        let Ok(mut tasks) = self.tasks.lock() else {
            return 0;
        };
        let mut aborted = 0;
        for task in tasks.drain(..) {
            if !task.is_finished() {
                task.abort();
                aborted += 1;
            }
        }
        aborted
    }
}

impl Drop for DataSynchronizer {
    fn drop(&mut self) {
        self.drain_tasks();
    }
}
