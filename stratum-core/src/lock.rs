//! Named read/write locks shared across repositories.
//!
//! A [`LockService`] lazily creates one [`LockPair`] per key and hands out the
//! same pair on every later request. Repositories key their locks by
//! collection name; pipeline-internal singletons key theirs by type.
//!
//! ```text
//! lock_for("players") ──→ LockPair ─── read().await  ──→ shared guard
//!                                  └── write().await ──→ exclusive guard
//! ```

use dashmap::DashMap;
use std::any::TypeId;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

// ============================================================================
// LOCK KEY
// ============================================================================

/// Registry key for a lock pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// Lock for a named collection.
    Collection(String),
    /// Lock for a pipeline-internal singleton, keyed by type.
    Singleton { type_id: TypeId, name: &'static str },
}

impl LockKey {
    pub fn collection(name: impl Into<String>) -> Self {
        LockKey::Collection(name.into())
    }

    pub fn singleton<T: 'static>() -> Self {
        LockKey::Singleton {
            type_id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Collection(name) => write!(f, "collection:{name}"),
            LockKey::Singleton { name, .. } => write!(f, "type:{name}"),
        }
    }
}

// ============================================================================
// LOCK PAIR
// ============================================================================

/// Read/write lock pair for one key.
///
/// Readers proceed concurrently; a writer excludes readers and other
/// writers. Clones share the same underlying lock. Guards release on drop,
/// so every exit path unlocks.
#[derive(Debug, Clone, Default)]
pub struct LockPair {
    inner: Arc<RwLock<()>>,
}

impl LockPair {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the shared (read) side.
    pub async fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.inner.read().await
    }

    /// Acquire the exclusive (write) side.
    pub async fn write(&self) -> RwLockWriteGuard<'_, ()> {
        self.inner.write().await
    }


    /// Try the shared side without waiting.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, ()>> {
        self.inner.try_read().ok()
    }

    /// Try the exclusive side without waiting.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, ()>> {
        self.inner.try_write().ok()
    }

    /// Whether two handles refer to the same lock.
    pub fn same_as(&self, other: &LockPair) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

// ============================================================================
// LOCK SERVICE
// ============================================================================

/// Registry of lazily created lock pairs.
///
/// Pairs are never evicted; they live as long as the service.
#[derive(Debug, Default)]
pub struct LockService {
    locks: DashMap<LockKey, LockPair>,
}

impl LockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the pair for a key.
    pub fn lock(&self, key: LockKey) -> LockPair {
        // entry() holds the shard lock, so concurrent first requests agree.
        self.locks.entry(key).or_default().clone()
    }

    /// Get or create the pair for a collection name.
    pub fn lock_for(&self, collection: &str) -> LockPair {
        self.lock(LockKey::collection(collection))
    }

    /// Get or create the pair for a singleton type.
    pub fn lock_for_type<T: 'static>(&self) -> LockPair {
        self.lock(LockKey::singleton::<T>())
    }

    /// Whether a pair exists for a key.
    pub fn contains(&self, key: &LockKey) -> bool {
        self.locks.contains_key(key)
    }

    /// Number of pairs created so far.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_same_key_returns_same_pair() {
        let service = LockService::new();
        let a = service.lock_for("players");
        let b = service.lock_for("players");
        let c = service.lock_for("items");
        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));
        assert_eq!(service.len(), 2);
    }

    #[test]
    fn test_type_keys_are_distinct_from_names() {
        struct Factory;
        let service = LockService::new();
        let by_type = service.lock_for_type::<Factory>();
        let again = service.lock_for_type::<Factory>();
        assert!(by_type.same_as(&again));
        assert!(service.contains(&LockKey::singleton::<Factory>()));
        assert!(!service.contains(&LockKey::collection("Factory")));
    }

    #[tokio::test]
    async fn test_readers_share_writers_exclude() {
        let service = LockService::new();
        let pair = service.lock_for("players");

        let r1 = pair.read().await;
        let r2 = pair.try_read();
        assert!(r2.is_some(), "readers must not exclude each other");
        assert!(pair.try_write().is_none(), "writer must wait for readers");
        drop(r1);
        drop(r2);

        let w = pair.write().await;
        assert!(pair.try_read().is_none());
        assert!(pair.try_write().is_none());
        drop(w);
        assert!(pair.try_write().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_writers_serialize_across_tasks() {
        let service = Arc::new(LockService::new());
        let active = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let service = Arc::clone(&service);
            let active = Arc::clone(&active);
            handles.push(tokio::spawn(async move {
                let pair = service.lock_for("shared");
                let _guard = pair.write().await;
                let concurrent = active.fetch_add(1, Ordering::SeqCst);
                assert_eq!(concurrent, 0, "two writers held the lock at once");
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
    }
}
