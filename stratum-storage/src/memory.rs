//! In-memory tier.
//!
//! Usable as the local cache, as a shared cache within one process, or as a
//! durable stand-in for tests. Map data outlives `close_map` and is only
//! destroyed by `remove_map`, so it behaves like a real backend.
//!
//! Entries can expire: when the map is opened with [`TierOptions::ttl`],
//! records older than the TTL read as absent and are purged lazily.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use stratum_core::{EntityId, RawRecord, StorageError, StratumResult, Tier, TierOptions};
use tracing::{debug, info};

use crate::store::{Store, StoreMap};

// ============================================================================
// STATISTICS
// ============================================================================

/// Snapshot of per-map counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub expirations: u64,
}

impl TierStats {
    /// Hit ratio over all lookups, 0.0 when nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    expirations: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> TierStats {
        TierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// MAP
// ============================================================================

#[derive(Debug)]
struct Entry {
    data: RawRecord,
    written_at: Instant,
}

impl Entry {
    fn is_expired(&self, ttl: Option<Duration>, now: Instant) -> bool {
        ttl.is_some_and(|ttl| now.duration_since(self.written_at) >= ttl)
    }
}

/// Backing data of one named map, shared by successive handles.
#[derive(Debug, Default)]
struct MapData {
    entries: RwLock<HashMap<EntityId, Entry>>,
    counters: Counters,
}

/// Handle to one map of a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryMap {
    name: String,
    data: Arc<MapData>,
    ttl: Option<Duration>,
    closed: AtomicBool,
}

impl MemoryMap {
    fn new(name: &str, data: Arc<MapData>, options: &TierOptions) -> Self {
        Self {
            name: name.to_string(),
            data,
            ttl: options.ttl,
            closed: AtomicBool::new(false),
        }
    }

    /// Counters for this map's data, shared across reopened handles.
    pub fn stats(&self) -> TierStats {
        self.data.counters.snapshot()
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
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

    fn read(&self) -> StratumResult<RwLockReadGuard<'_, HashMap<EntityId, Entry>>> {
        self.ensure_open()?;
        self.data
            .entries
            .read()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    fn write(&self) -> StratumResult<RwLockWriteGuard<'_, HashMap<EntityId, Entry>>> {
        self.ensure_open()?;
        self.data
            .entries
            .write()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    /// Drop every expired entry, returning how many went.
    fn purge_expired(&self) -> StratumResult<usize> {
        if self.ttl.is_none() {
            return Ok(0);
        }
        let now = Instant::now();
        let mut entries = self.write()?;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(self.ttl, now));
        let purged = before - entries.len();
        if purged > 0 {
            self.data
                .counters
                .expirations
                .fetch_add(purged as u64, Ordering::Relaxed);
            debug!(map = %self.name, purged, "Purged expired entries");
        }
        Ok(purged)
    }

    /// Look up `id`, purging it when expired.
    fn lookup(&self, id: EntityId) -> StratumResult<Option<RawRecord>> {
        let now = Instant::now();
        {
            let entries = self.read()?;
            match entries.get(&id) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired(self.ttl, now) => {
                    return Ok(Some(entry.data.clone()));
                }
                Some(_) => {}
            }
        }
        let mut entries = self.write()?;
        if entries
            .get(&id)
            .is_some_and(|entry| entry.is_expired(self.ttl, now))
        {
            entries.remove(&id);
            self.data.counters.expirations.fetch_add(1, Ordering::Relaxed);
        }
        Ok(None)
    }
}

#[async_trait]
impl StoreMap for MemoryMap {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn get(&self, id: EntityId) -> StratumResult<Option<RawRecord>> {
        let found = self.lookup(id)?;
        let counter = if found.is_some() {
            &self.data.counters.hits
        } else {
            &self.data.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(found)
    }

    async fn put(&self, id: EntityId, data: RawRecord) -> StratumResult<()> {
        let entry = Entry {
            data,
            written_at: Instant::now(),
        };
        self.write()?.insert(id, entry);
        self.data.counters.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn contains(&self, id: EntityId) -> StratumResult<bool> {
        Ok(self.lookup(id)?.is_some())
    }

    async fn remove(&self, id: EntityId) -> StratumResult<bool> {
        let now = Instant::now();
        let removed = self.write()?.remove(&id);
        Ok(removed.is_some_and(|entry| !entry.is_expired(self.ttl, now)))
    }

    async fn clear(&self) -> StratumResult<()> {
        self.write()?.clear();
        Ok(())
    }

    async fn size(&self) -> StratumResult<usize> {
        self.purge_expired()?;
        Ok(self.read()?.len())
    }

    async fn entries(&self) -> StratumResult<Vec<(EntityId, RawRecord)>> {
        self.purge_expired()?;
        Ok(self
            .read()?
            .iter()
            .map(|(id, entry)| (*id, entry.data.clone()))
            .collect())
    }
}

// ============================================================================
// STORE
// ============================================================================

#[derive(Debug, Default)]
struct StoreState {
    data: HashMap<String, Arc<MapData>>,
    open: HashMap<String, Arc<MemoryMap>>,
}

/// In-memory [`Store`].
#[derive(Debug)]
pub struct MemoryStore {
    tier: Tier,
    state: RwLock<StoreState>,
    closed: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::for_tier(Tier::Local)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store reporting itself as `tier` in errors and logs.
    pub fn for_tier(tier: Tier) -> Self {
        Self {
            tier,
            state: RwLock::new(StoreState::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Typed handle to an open map, for inspecting its statistics.
    pub fn open_handle(&self, name: &str) -> Option<Arc<MemoryMap>> {
        self.state
            .read()
            .ok()
            .and_then(|state| state.open.get(name).cloned())
    }

    fn ensure_open(&self) -> StratumResult<()> {
        if self.is_closed() {
            return Err(StorageError::StoreClosed { tier: self.tier }.into());
        }
        Ok(())
    }

    fn state_mut(&self) -> StratumResult<RwLockWriteGuard<'_, StoreState>> {
        self.state
            .write()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    fn state(&self) -> StratumResult<RwLockReadGuard<'_, StoreState>> {
        self.state
            .read()
            .map_err(|_| StorageError::LockPoisoned.into())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn open_map(&self, name: &str, options: &TierOptions) -> StratumResult<Arc<dyn StoreMap>> {
        self.ensure_open()?;
        let mut state = self.state_mut()?;
        if let Some(existing) = state.open.get(name) {
            return Ok(existing.clone());
        }
        let data = state.data.entry(name.to_string()).or_default().clone();
        let map = Arc::new(MemoryMap::new(name, data, options));
        state.open.insert(name.to_string(), map.clone());
        debug!(tier = %self.tier, map = %name, ttl = ?options.ttl, "Opened memory map");
        Ok(map)
    }

    async fn has_map(&self, name: &str) -> StratumResult<bool> {
        Ok(self.state()?.data.contains_key(name))
    }

    async fn close_map(&self, name: &str) -> StratumResult<()> {
        if let Some(map) = self.state_mut()?.open.remove(name) {
            map.closed.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn remove_map(&self, name: &str) -> StratumResult<()> {
        let mut state = self.state_mut()?;
        if let Some(map) = state.open.remove(name) {
            map.closed.store(true, Ordering::SeqCst);
        }
        if let Some(data) = state.data.remove(name) {
            if let Ok(mut entries) = data.entries.write() {
                entries.clear();
            }
            debug!(tier = %self.tier, map = %name, "Removed memory map");
        }
        Ok(())
    }

    async fn maps(&self) -> StratumResult<BTreeSet<String>> {
        Ok(self.state()?.data.keys().cloned().collect())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> StratumResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.state_mut()?;
        for (_, map) in state.open.drain() {
            map.closed.store(true, Ordering::SeqCst);
        }
        info!(tier = %self.tier, maps = state.data.len(), "Closed memory store");
        Ok(())
    }
}
