//! Entry point for applications.
//!
//! A [`Pipeline`] owns the tiers, the invalidation channel, the codec and the
//! lock registry, and hands out repositories by name. Build one with
//! [`Pipeline::builder`]:
//!
//! ```ignore
//! let pipeline = Pipeline::builder()
//!     .durable(Arc::new(LmdbStore::open(dir, 64, 128)?))
//!     .shared(Arc::new(MemoryStore::for_tier(Tier::Shared)))
//!     .local(Arc::new(MemoryStore::for_tier(Tier::Local)))
//!     .build()?;
//! let players = pipeline.repository("players", &RepositoryOptions::default()).await?;
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use stratum_core::{
    ConfigError, DocumentCodec, JsonCodec, LockService, PipelineConfig, RepositoryOptions,
    StorageError, StratumResult, Tier, ValidationError,
};
use stratum_events::Updater;
use stratum_storage::{PipelineStore, Store};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::repository::{DocumentRepository, ObjectRepository};

// ============================================================================
// BUILDER
// ============================================================================

/// Builder for [`Pipeline`]. Only the durable tier is required.
#[derive(Default)]
pub struct PipelineBuilder {
    durable: Option<Arc<dyn Store>>,
    shared: Option<Arc<dyn Store>>,
    local: Option<Arc<dyn Store>>,
    updater: Option<Arc<dyn Updater>>,
    codec: Option<Arc<dyn DocumentCodec>>,
    config: Option<PipelineConfig>,
    locks: Option<Arc<LockService>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn durable(mut self, store: Arc<dyn Store>) -> Self {
        self.durable = Some(store);
        self
    }

    pub fn shared(mut self, store: Arc<dyn Store>) -> Self {
        self.shared = Some(store);
        self
    }

    pub fn local(mut self, store: Arc<dyn Store>) -> Self {
        self.local = Some(store);
        self
    }

    /// Invalidation channel for local caches. Ignored without a local tier.
    pub fn updater(mut self, updater: Arc<dyn Updater>) -> Self {
        self.updater = Some(updater);
        self
    }

    /// Codec for stored documents. Defaults to [`JsonCodec`].
    pub fn codec(mut self, codec: Arc<dyn DocumentCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Share a lock registry with other pipelines in the process.
    pub fn lock_service(mut self, locks: Arc<LockService>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Build the pipeline.
    ///
    /// # Errors
    ///
    /// - `ConfigError::MissingRequired` without a durable tier
    /// - `ConfigError::InvalidValue` when the config fails validation
    pub fn build(self) -> StratumResult<Pipeline> {
        let durable = self.durable.ok_or_else(|| ConfigError::MissingRequired {
            field: "durable".to_string(),
        })?;
        let config = self.config.unwrap_or_default();
        config.validate()?;

        if self.updater.is_some() && self.local.is_none() {
            warn!("Updater configured without a local tier, invalidations will not be applied");
        }

        let mut store = PipelineStore::new(durable, config);
        if let Some(shared) = self.shared {
            store = store.with_shared(shared);
        }
        if let Some(local) = self.local {
            store = store.with_local(local);
        }
        if let Some(updater) = self.updater {
            store = store.with_updater(updater);
        }

        Ok(Pipeline {
            store: Arc::new(store),
            codec: self.codec.unwrap_or_else(|| Arc::new(JsonCodec)),
            locks: self.locks.unwrap_or_default(),
            repositories: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Owner of the tiers and every repository opened over them.
pub struct Pipeline {
    store: Arc<PipelineStore>,
    codec: Arc<dyn DocumentCodec>,
    locks: Arc<LockService>,
    repositories: Mutex<HashMap<String, Arc<DocumentRepository>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("store", &self.store)
            .field("codec", &self.codec)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub fn store(&self) -> &Arc<PipelineStore> {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        self.store.config()
    }

    pub fn lock_service(&self) -> &Arc<LockService> {
        &self.locks
    }

    /// True once closed, or when any tier reports closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.store.is_closed()
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
        if name.trim().is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "name".to_string(),
                reason: "repository name must not be empty".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Open the repository `name`, or return the handle already open.
    ///
    /// `options` only apply when the repository is first opened.
    ///
    /// # Errors
    ///
    /// - `ValidationError::InvalidValue` for an empty name
    /// - `StorageError::StoreClosed` after [`close`](Pipeline::close)
    /// - Any tier failure while opening its maps
    pub async fn repository(
        &self,
        name: &str,
        options: &RepositoryOptions,
    ) -> StratumResult<Arc<DocumentRepository>> {
        Self::validate_name(name)?;
        let registry = self.locks.lock_for_type::<Pipeline>();
        let _guard = registry.write().await;
        self.ensure_open()?;

        let mut repositories = self.repositories.lock().await;
        if let Some(existing) = repositories.get(name) {
            if existing.is_open() {
                return Ok(existing.clone());
            }
        }

        let map = self.store.open_map(name, options).await?;
        let repository = Arc::new(DocumentRepository::new(
            name,
            self.store.clone(),
            map,
            self.locks.lock_for(name),
            self.codec.clone(),
        ));
        repositories.insert(name.to_string(), repository.clone());
        info!(repository = %name, "Opened repository");
        Ok(repository)
    }

    /// Open `name` as a typed repository.
    pub async fn object_repository<T>(
        &self,
        name: &str,
        options: &RepositoryOptions,
    ) -> StratumResult<ObjectRepository<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
    {
        Ok(ObjectRepository::new(self.repository(name, options).await?))
    }

    /// Whether a collection named `name` exists in the durable tier.
    pub async fn has_repository(&self, name: &str) -> StratumResult<bool> {
        self.ensure_open()?;
        self.store.has_map(name).await
    }

    /// Every collection in the durable tier, open or not.
    pub async fn list_repositories(&self) -> StratumResult<BTreeSet<String>> {
        self.ensure_open()?;
        self.store.maps().await
    }

    /// Destroy the collection `name`, dropping its open handle if any.
    ///
    /// Returns whether the collection existed.
    pub async fn drop_repository(&self, name: &str) -> StratumResult<bool> {
        let registry = self.locks.lock_for_type::<Pipeline>();
        let _guard = registry.write().await;
        self.ensure_open()?;

        let existed = self.store.has_map(name).await?;
        let open = self.repositories.lock().await.remove(name);
        match open {
            Some(repository) if repository.is_open() => repository.drop_collection().await?,
            _ if existed => self.store.remove_map(name).await?,
            _ => {}
        }
        Ok(existed)
    }

    /// Close every repository and then the tiers. Idempotent.
    ///
    /// Repository failures are logged; the tier shutdown result is returned.
    pub async fn close(&self) -> StratumResult<()> {
        let registry = self.locks.lock_for_type::<Pipeline>();
        let _guard = registry.write().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let repositories: Vec<_> = self
            .repositories
            .lock()
            .await
            .drain()
            .map(|(_, repository)| repository)
            .collect();
        for repository in repositories {
            if let Err(e) = repository.close().await {
                warn!(repository = %repository.name(), error = %e, "Failed to close repository");
            }
        }
        self.store.close().await?;
        info!("Closed pipeline");
        Ok(())
    }
}
