//! LMDB-backed durable tier.
//!
//! Uses the heed crate (Rust bindings for LMDB). Each map is a named LMDB
//! database keyed by the 16 raw bytes of the record id. A reserved catalog
//! database records which map names exist so `maps()` and `has_map()`
//! survive a restart.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions:
//! - Read transactions for `get`, `contains`, `size` and enumeration
//! - Write transactions for `put`, `remove`, `clear` and catalog changes

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use stratum_core::{
    EntityId, RawRecord, StorageError, StratumError, StratumResult, Tier, TierOptions,
    ValidationError,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::{Store, StoreMap};

/// Name of the database listing every map.
const CATALOG_DB: &str = "__stratum_catalog";

/// Error type for LMDB tier operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a database within the environment.
    #[error("Failed to open database {name}: {reason}")]
    DbOpen { name: String, reason: String },

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// A stored key is not a record id.
    #[error("Corrupt key in {name}: {reason}")]
    CorruptKey { name: String, reason: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbStoreError> for StratumError {
    fn from(e: LmdbStoreError) -> Self {
        StratumError::backend(Tier::Durable, e.to_string())
    }
}

fn txn_err(e: heed::Error) -> LmdbStoreError {
    LmdbStoreError::Transaction(e.to_string())
}

// ============================================================================
// MAP
// ============================================================================

/// Handle to one named LMDB database.
pub struct LmdbMap {
    name: String,
    env: Env,
    db: Database<Bytes, Bytes>,
    closed: AtomicBool,
}

impl std::fmt::Debug for LmdbMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbMap")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl LmdbMap {
    fn ensure_open(&self) -> StratumResult<()> {
        if self.is_closed() {
            return Err(StorageError::MapClosed {
                name: self.name.clone(),
            }
            .into());
        }
        Ok(())
    }

    fn decode_key(&self, key: &[u8]) -> Result<EntityId, LmdbStoreError> {
        Uuid::from_slice(key).map_err(|e| LmdbStoreError::CorruptKey {
            name: self.name.clone(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl StoreMap for LmdbMap {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn get(&self, id: EntityId) -> StratumResult<Option<RawRecord>> {
        self.ensure_open()?;
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let value = self
            .db
            .get(&rtxn, id.as_bytes())
            .map_err(txn_err)?
            .map(<[u8]>::to_vec);
        Ok(value)
    }

    async fn put(&self, id: EntityId, data: RawRecord) -> StratumResult<()> {
        self.ensure_open()?;
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.db
            .put(&mut wtxn, id.as_bytes(), &data)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn contains(&self, id: EntityId) -> StratumResult<bool> {
        Ok(self.get(id).await?.is_some())
    }

    async fn remove(&self, id: EntityId) -> StratumResult<bool> {
        self.ensure_open()?;
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let deleted = self.db.delete(&mut wtxn, id.as_bytes()).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(deleted)
    }

    async fn clear(&self) -> StratumResult<()> {
        self.ensure_open()?;
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.db.clear(&mut wtxn).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn size(&self) -> StratumResult<usize> {
        self.ensure_open()?;
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let len = self.db.len(&rtxn).map_err(txn_err)?;
        Ok(len as usize)
    }

    async fn entries(&self) -> StratumResult<Vec<(EntityId, RawRecord)>> {
        self.ensure_open()?;
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut entries = Vec::new();
        for result in self.db.iter(&rtxn).map_err(txn_err)? {
            let (key, value) = result.map_err(txn_err)?;
            entries.push((self.decode_key(key)?, value.to_vec()));
        }
        Ok(entries)
    }

    async fn keys(&self) -> StratumResult<Vec<EntityId>> {
        self.ensure_open()?;
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut keys = Vec::new();
        for result in self.db.iter(&rtxn).map_err(txn_err)? {
            let (key, _) = result.map_err(txn_err)?;
            keys.push(self.decode_key(key)?);
        }
        Ok(keys)
    }
}

// ============================================================================
// STORE
// ============================================================================

/// Durable [`Store`] on an LMDB environment.
///
/// # Example
///
/// ```ignore
/// use stratum_storage::{LmdbStore, Store};
/// use stratum_core::TierOptions;
///
/// let store = LmdbStore::open("/var/lib/app/stratum", 256, 64)?;
/// let players = store.open_map("players", &TierOptions::default()).await?;
/// players.put(id, bytes).await?;
/// ```
pub struct LmdbStore {
    env: Env,
    catalog: Database<Bytes, Bytes>,
    open: RwLock<HashMap<String, Arc<LmdbMap>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for LmdbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbStore")
            .field("path", &self.env.path())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl LmdbStore {
    /// Open or create an LMDB tier.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the environment in megabytes
    /// * `max_maps` - Maximum number of maps the tier will hold
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - `max_size_mb` does not fit in a byte count
    /// - LMDB environment cannot be opened
    /// - The catalog database cannot be created
    pub fn open<P: AsRef<Path>>(
        path: P,
        max_size_mb: usize,
        max_maps: u32,
    ) -> Result<Self, LmdbStoreError> {
        let map_size = max_size_mb.checked_mul(1024 * 1024).ok_or_else(|| {
            LmdbStoreError::EnvOpen(format!("map size of {max_size_mb} MiB overflows"))
        })?;
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per path by this process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(max_maps.saturating_add(1))
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let catalog: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some(CATALOG_DB))
            .map_err(|e| LmdbStoreError::DbOpen {
                name: CATALOG_DB.to_string(),
                reason: e.to_string(),
            })?;
        wtxn.commit().map_err(txn_err)?;

        info!(path = %path.as_ref().display(), max_size_mb, max_maps, "Opened LMDB store");
        Ok(Self {
            env,
            catalog,
            open: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> StratumResult<()> {
        if self.is_closed() {
            return Err(StorageError::StoreClosed {
                tier: Tier::Durable,
            }
            .into());
        }
        Ok(())
    }

    fn validate_name(name: &str) -> StratumResult<()> {
        if name.is_empty() || name == CATALOG_DB {
            return Err(ValidationError::InvalidValue {
                field: "map name".to_string(),
                reason: format!("{name:?} is reserved"),
            }
            .into());
        }
        Ok(())
    }

    /// Create (if needed) the named database and record it in the catalog.
    fn create_map(&self, name: &str) -> Result<LmdbMap, LmdbStoreError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let db: Database<Bytes, Bytes> = self
            .env
            .create_database(&mut wtxn, Some(name))
            .map_err(|e| LmdbStoreError::DbOpen {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        self.catalog
            .put(&mut wtxn, name.as_bytes(), &[])
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(LmdbMap {
            name: name.to_string(),
            env: self.env.clone(),
            db,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Store for LmdbStore {
    async fn open_map(&self, name: &str, options: &TierOptions) -> StratumResult<Arc<dyn StoreMap>> {
        self.ensure_open()?;
        Self::validate_name(name)?;
        let mut open = self
            .open
            .write()
            .map_err(|_| StratumError::from(StorageError::LockPoisoned))?;
        if let Some(existing) = open.get(name) {
            return Ok(existing.clone());
        }
        if options.ttl.is_some() {
            debug!(map = %name, "Ignoring expiration on durable tier");
        }
        let map = Arc::new(self.create_map(name)?);
        open.insert(name.to_string(), map.clone());
        debug!(map = %name, "Opened LMDB map");
        Ok(map)
    }

    async fn has_map(&self, name: &str) -> StratumResult<bool> {
        self.ensure_open()?;
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let found = self
            .catalog
            .get(&rtxn, name.as_bytes())
            .map_err(txn_err)?
            .is_some();
        Ok(found)
    }

    async fn close_map(&self, name: &str) -> StratumResult<()> {
        let removed = self
            .open
            .write()
            .map_err(|_| StratumError::from(StorageError::LockPoisoned))?
            .remove(name);
        if let Some(map) = removed {
            map.closed.store(true, Ordering::SeqCst);
            debug!(map = %name, "Closed LMDB map");
        }
        Ok(())
    }

    async fn remove_map(&self, name: &str) -> StratumResult<()> {
        self.ensure_open()?;
        if !self.has_map(name).await? {
            return Ok(());
        }
        self.close_map(name).await?;

        // LMDB keeps the named database itself; emptying it and dropping the
        // catalog entry makes the map indistinguishable from a missing one.
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let db: Option<Database<Bytes, Bytes>> = self
            .env
            .open_database(&wtxn, Some(name))
            .map_err(txn_err)?;
        if let Some(db) = db {
            db.clear(&mut wtxn).map_err(txn_err)?;
        }
        self.catalog
            .delete(&mut wtxn, name.as_bytes())
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        info!(map = %name, "Removed LMDB map");
        Ok(())
    }

    async fn maps(&self) -> StratumResult<BTreeSet<String>> {
        self.ensure_open()?;
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut names = BTreeSet::new();
        for result in self.catalog.iter(&rtxn).map_err(txn_err)? {
            let (key, _) = result.map_err(txn_err)?;
            names.insert(String::from_utf8_lossy(key).into_owned());
        }
        Ok(names)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> StratumResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(mut open) = self.open.write() {
            for (_, map) in open.drain() {
                map.closed.store(true, Ordering::SeqCst);
            }
        }
        self.env.force_sync().map_err(txn_err)?;
        info!(path = %self.env.path().display(), "Closed LMDB store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (LmdbStore, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let store = LmdbStore::open(temp_dir.path(), 10, 8).expect("store creation should succeed");
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let (store, _dir) = create_test_store();
        let map = store.open_map("players", &TierOptions::default()).await.unwrap();
        let id = Uuid::now_v7();

        assert_eq!(map.get(id).await.unwrap(), None);
        map.put(id, b"{\"n\":1}".to_vec()).await.unwrap();
        assert_eq!(map.get(id).await.unwrap(), Some(b"{\"n\":1}".to_vec()));
        assert!(map.contains(id).await.unwrap());
        assert_eq!(map.size().await.unwrap(), 1);
        assert_eq!(map.keys().await.unwrap(), vec![id]);

        assert!(map.remove(id).await.unwrap());
        assert!(!map.remove(id).await.unwrap());
        assert_eq!(map.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_maps_are_isolated() {
        let (store, _dir) = create_test_store();
        let a = store.open_map("a", &TierOptions::default()).await.unwrap();
        let b = store.open_map("b", &TierOptions::default()).await.unwrap();
        a.put(Uuid::nil(), vec![1]).await.unwrap();
        assert_eq!(b.get(Uuid::nil()).await.unwrap(), None);

        a.clear().await.unwrap();
        assert!(a.entries().await.unwrap().is_empty());
        assert_eq!(
            store.maps().await.unwrap().into_iter().collect::<Vec<_>>(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_oversized_map_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let result = LmdbStore::open(temp_dir.path(), usize::MAX, 4);
        assert!(matches!(result, Err(LmdbStoreError::EnvOpen(_))));
    }

    #[tokio::test]
    async fn test_catalog_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let id = Uuid::now_v7();
        {
            let store = LmdbStore::open(temp_dir.path(), 10, 8).unwrap();
            let map = store.open_map("players", &TierOptions::default()).await.unwrap();
            map.put(id, vec![7]).await.unwrap();
            store.close().await.unwrap();
        }
        let store = LmdbStore::open(temp_dir.path(), 10, 8).unwrap();
        assert!(store.has_map("players").await.unwrap());
        let map = store.open_map("players", &TierOptions::default()).await.unwrap();
        assert_eq!(map.get(id).await.unwrap(), Some(vec![7]));
    }

    #[tokio::test]
    async fn test_remove_map_destroys_data() {
        let (store, _dir) = create_test_store();
        let map = store.open_map("players", &TierOptions::default()).await.unwrap();
        map.put(Uuid::nil(), vec![1]).await.unwrap();

        store.remove_map("players").await.unwrap();
        assert!(map.is_closed());
        assert!(!store.has_map("players").await.unwrap());
        assert!(store.maps().await.unwrap().is_empty());

        let reopened = store.open_map("players", &TierOptions::default()).await.unwrap();
        assert_eq!(reopened.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_map_keeps_data() {
        let (store, _dir) = create_test_store();
        let map = store.open_map("c", &TierOptions::default()).await.unwrap();
        map.put(Uuid::nil(), vec![1]).await.unwrap();
        store.close_map("c").await.unwrap();
        assert!(map.get(Uuid::nil()).await.is_err());

        let reopened = store.open_map("c", &TierOptions::default()).await.unwrap();
        assert_eq!(reopened.get(Uuid::nil()).await.unwrap(), Some(vec![1]));
    }

    #[tokio::test]
    async fn test_reserved_name_rejected() {
        let (store, _dir) = create_test_store();
        let err = store
            .open_map(CATALOG_DB, &TierOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StratumError::Validation(_)));
    }

    #[tokio::test]
    async fn test_closed_store() {
        let (store, _dir) = create_test_store();
        store.close().await.unwrap();
        assert!(store.is_closed());
        assert!(matches!(
            store.open_map("c", &TierOptions::default()).await,
            Err(StratumError::Storage(StorageError::StoreClosed {
                tier: Tier::Durable
            }))
        ));
    }
}
