//! Collection handles.
//!
//! A [`DocumentRepository`] wraps one [`PipelineMap`] and the lock pair the
//! [`LockService`](stratum_core::LockService) hands out for its name. Reads
//! take the shared side, mutations and lifecycle changes take the exclusive
//! side, and every call checks the repository is still open.
//!
//! [`ObjectRepository`] layers serde conversion on top for typed records.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use stratum_core::{
    Document, DocumentCodec, EntityId, LockPair, QueryStrategy, RepositoryError, StorageError,
    StratumError, StratumResult,
};
use stratum_storage::{PipelineMap, PipelineStore};
use tracing::{debug, info};

use crate::find::{Cursor, FindOptions};

/// Lifecycle of a repository. `Closed` and `Dropped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryState {
    Open,
    Closed,
    Dropped,
}

impl RepositoryState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RepositoryState::Open,
            1 => RepositoryState::Closed,
            _ => RepositoryState::Dropped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            RepositoryState::Open => 0,
            RepositoryState::Closed => 1,
            RepositoryState::Dropped => 2,
        }
    }
}

// ============================================================================
// DOCUMENT REPOSITORY
// ============================================================================

/// Handle to one collection of documents.
pub struct DocumentRepository {
    name: String,
    store: Arc<PipelineStore>,
    map: Arc<PipelineMap>,
    lock: LockPair,
    codec: Arc<dyn DocumentCodec>,
    state: AtomicU8,
}

impl std::fmt::Debug for DocumentRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentRepository")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("codec", &self.codec)
            .finish()
    }
}

impl DocumentRepository {
    pub fn new(
        name: impl Into<String>,
        store: Arc<PipelineStore>,
        map: Arc<PipelineMap>,
        lock: LockPair,
        codec: Arc<dyn DocumentCodec>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            map,
            lock,
            codec,
            state: AtomicU8::new(RepositoryState::Open.as_u8()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pipeline map underneath, for tier-level inspection.
    pub fn map(&self) -> &Arc<PipelineMap> {
        &self.map
    }

    pub fn state(&self) -> RepositoryState {
        RepositoryState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Open, with a live map on a live store.
    pub fn is_open(&self) -> bool {
        self.state() == RepositoryState::Open && !self.map.is_closed() && !self.store.is_closed()
    }

    pub fn is_dropped(&self) -> bool {
        self.state() == RepositoryState::Dropped
    }

    fn ensure_open(&self) -> StratumResult<()> {
        match self.state() {
            RepositoryState::Dropped => Err(RepositoryError::Dropped {
                name: self.name.clone(),
            }
            .into()),
            RepositoryState::Closed => Err(RepositoryError::Closed {
                name: self.name.clone(),
            }
            .into()),
            RepositoryState::Open if !self.is_open() => Err(RepositoryError::Closed {
                name: self.name.clone(),
            }
            .into()),
            RepositoryState::Open => Ok(()),
        }
    }

    /// Freshest copy of `id`, or `None`.
    pub async fn get(&self, id: EntityId) -> StratumResult<Option<Document>> {
        let _guard = self.lock.read().await;
        self.ensure_open()?;
        let codec = &self.codec;
        self.map.get_decoded(id, |bytes| codec.decode(bytes)).await
    }

    /// Write `document` under `id` into the tiers `strategy` selects.
    pub async fn insert(
        &self,
        id: EntityId,
        document: &Document,
        strategy: QueryStrategy,
    ) -> StratumResult<()> {
        let _guard = self.lock.write().await;
        self.ensure_open()?;
        let bytes = self.codec.encode(document)?;
        self.map.put(id, bytes, strategy).await?;
        debug!(repository = %self.name, %id, %strategy, "Inserted document");
        Ok(())
    }

    pub async fn exists(&self, id: EntityId, strategy: QueryStrategy) -> StratumResult<bool> {
        let _guard = self.lock.read().await;
        self.ensure_open()?;
        self.map.exists(id, strategy).await
    }

    /// Remove `id` from the tiers `strategy` selects, returning whether any held it.
    pub async fn remove(&self, id: EntityId, strategy: QueryStrategy) -> StratumResult<bool> {
        let _guard = self.lock.write().await;
        self.ensure_open()?;
        let removed = self.map.remove(id, strategy).await?;
        debug!(repository = %self.name, %id, %strategy, removed, "Removed document");
        Ok(removed)
    }

    /// Remove every document from every tier.
    pub async fn clear(&self) -> StratumResult<()> {
        let _guard = self.lock.write().await;
        self.ensure_open()?;
        self.map.clear(QueryStrategy::ALL).await
    }

    /// Number of documents in the durable tier.
    pub async fn size(&self) -> StratumResult<usize> {
        let _guard = self.lock.read().await;
        self.ensure_open()?;
        self.map.size().await
    }

    /// Every durable document.
    pub async fn entries(&self) -> StratumResult<Vec<(EntityId, Document)>> {
        let _guard = self.lock.read().await;
        self.ensure_open()?;
        self.decoded_entries().await
    }

    async fn decoded_entries(&self) -> StratumResult<Vec<(EntityId, Document)>> {
        self.map
            .entries()
            .await?
            .into_iter()
            .map(|(id, bytes)| Ok((id, self.codec.decode(&bytes)?)))
            .collect()
    }

    /// Filter, sort and window the durable documents.
    pub async fn find(&self, options: &FindOptions) -> StratumResult<Cursor<Document>> {
        let _guard = self.lock.read().await;
        self.ensure_open()?;
        let entries = self.decoded_entries().await?;
        let cursor = options.apply(entries);
        debug!(repository = %self.name, results = cursor.size(), "Find completed");
        Ok(cursor)
    }

    /// Release the collection, keeping its data. Idempotent.
    pub async fn close(&self) -> StratumResult<()> {
        let _guard = self.lock.write().await;
        if self.state() != RepositoryState::Open {
            return Ok(());
        }
        self.state
            .store(RepositoryState::Closed.as_u8(), Ordering::SeqCst);
        self.store.close_map(&self.name).await?;
        info!(repository = %self.name, "Closed repository");
        Ok(())
    }

    /// Release the collection and destroy its data. Idempotent.
    pub async fn drop_collection(&self) -> StratumResult<()> {
        let _guard = self.lock.write().await;
        if self.state() != RepositoryState::Open {
            return Ok(());
        }
        self.state
            .store(RepositoryState::Dropped.as_u8(), Ordering::SeqCst);
        self.store.remove_map(&self.name).await?;
        info!(repository = %self.name, "Dropped repository");
        Ok(())
    }
}

// ============================================================================
// OBJECT REPOSITORY
// ============================================================================

/// Typed view of a [`DocumentRepository`].
///
/// Records convert to and from documents through serde; `T` must serialize
/// to a JSON object.
pub struct ObjectRepository<T> {
    inner: Arc<DocumentRepository>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ObjectRepository<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for ObjectRepository<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRepository")
            .field("type", &std::any::type_name::<T>())
            .field("inner", &self.inner)
            .finish()
    }
}

/// Convert a record into a document.
pub fn to_document<T: Serialize>(object: &T) -> StratumResult<Document> {
    let value = serde_json::to_value(object).map_err(|e| {
        StratumError::from(StorageError::Codec {
            reason: e.to_string(),
        })
    })?;
    Document::from_value(value)
}

/// Convert a document back into a record.
pub fn from_document<T: DeserializeOwned>(document: Document) -> StratumResult<T> {
    serde_json::from_value(document.into_value()).map_err(|e| {
        StorageError::Codec {
            reason: e.to_string(),
        }
        .into()
    })
}

impl<T> ObjectRepository<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(inner: Arc<DocumentRepository>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    /// The untyped repository underneath.
    pub fn documents(&self) -> &Arc<DocumentRepository> {
        &self.inner
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    pub fn is_dropped(&self) -> bool {
        self.inner.is_dropped()
    }

    pub async fn get(&self, id: EntityId) -> StratumResult<Option<T>> {
        self.inner.get(id).await?.map(from_document).transpose()
    }

    pub async fn insert(&self, id: EntityId, object: &T, strategy: QueryStrategy) -> StratumResult<()> {
        let document = to_document(object)?;
        self.inner.insert(id, &document, strategy).await
    }

    pub async fn exists(&self, id: EntityId, strategy: QueryStrategy) -> StratumResult<bool> {
        self.inner.exists(id, strategy).await
    }

    pub async fn remove(&self, id: EntityId, strategy: QueryStrategy) -> StratumResult<bool> {
        self.inner.remove(id, strategy).await
    }

    pub async fn clear(&self) -> StratumResult<()> {
        self.inner.clear().await
    }

    pub async fn size(&self) -> StratumResult<usize> {
        self.inner.size().await
    }

    /// Find over the document form; conditions and sort keys name serialized fields.
    pub async fn find(&self, options: &FindOptions) -> StratumResult<Cursor<T>> {
        self.inner.find(options).await?.try_map(from_document)
    }

    pub async fn close(&self) -> StratumResult<()> {
        self.inner.close().await
    }

    pub async fn drop_collection(&self) -> StratumResult<()> {
        self.inner.drop_collection().await
    }
}
