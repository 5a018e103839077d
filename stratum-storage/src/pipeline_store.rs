//! Owner of the tiers of a pipeline.
//!
//! The durable tier is the source of truth for which collections exist;
//! cache tiers are cleaned up on a best-effort basis.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use stratum_core::{PipelineConfig, RepositoryOptions, StorageError, StratumResult, Tier, TierOptions};
use stratum_events::Updater;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::pipeline_map::PipelineMap;
use crate::store::{Store, StoreMap};
use crate::synchronizer::TierMaps;

/// The three tiers plus the optional invalidation channel.
pub struct PipelineStore {
    durable: Arc<dyn Store>,
    shared: Option<Arc<dyn Store>>,
    local: Option<Arc<dyn Store>>,
    updater: Option<Arc<dyn Updater>>,
    config: PipelineConfig,
    open: Mutex<HashMap<String, Arc<PipelineMap>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for PipelineStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineStore")
            .field("durable", &self.durable)
            .field("shared", &self.shared)
            .field("local", &self.local)
            .field("updater", &self.updater.as_ref().map(|u| u.sender_id()))
            .field("config", &self.config)
            .finish()
    }
}

impl PipelineStore {
    pub fn new(durable: Arc<dyn Store>, config: PipelineConfig) -> Self {
        Self {
            durable,
            shared: None,
            local: None,
            updater: None,
            config,
            open: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_shared(mut self, shared: Arc<dyn Store>) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn with_local(mut self, local: Arc<dyn Store>) -> Self {
        self.local = Some(local);
        self
    }

    /// Attach an invalidation channel. Only used by maps with a local tier.
    pub fn with_updater(mut self, updater: Arc<dyn Updater>) -> Self {
        self.updater = Some(updater);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn updater(&self) -> Option<&Arc<dyn Updater>> {
        self.updater.as_ref()
    }

    fn store(&self, tier: Tier) -> Option<&Arc<dyn Store>> {
        match tier {
            Tier::Local => self.local.as_ref(),
            Tier::Shared => self.shared.as_ref(),
            Tier::Durable => Some(&self.durable),
        }
    }

    fn caches(&self) -> impl Iterator<Item = (Tier, &Arc<dyn Store>)> + '_ {
        [Tier::Local, Tier::Shared]
            .into_iter()
            .filter_map(|tier| self.store(tier).map(|store| (tier, store)))
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

    /// Open the cache tier map when the collection asks for it and the tier exists.
    async fn open_cache(
        &self,
        tier: Tier,
        name: &str,
        wanted: bool,
        options: &TierOptions,
    ) -> StratumResult<Option<Arc<dyn StoreMap>>> {
        if !wanted {
            return Ok(None);
        }
        match self.store(tier) {
            Some(store) => Ok(Some(store.open_map(name, options).await?)),
            None => {
                debug!(collection = %name, %tier, "Tier requested but not configured");
                Ok(None)
            }
        }
    }

    /// Open the pipeline map for `name`, or return the one already open.
    pub async fn open_map(&self, name: &str, options: &RepositoryOptions) -> StratumResult<Arc<PipelineMap>> {
        self.ensure_open()?;
        let mut open = self.open.lock().await;
        if let Some(existing) = open.get(name) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
        }

        let durable = self.durable.open_map(name, &TierOptions::default()).await?;
        let shared = self
            .open_cache(Tier::Shared, name, options.global_cache, &options.global)
            .await?;
        let local = self
            .open_cache(Tier::Local, name, options.local_cache, &options.local)
            .await?;
        let updater = if local.is_some() {
            self.updater.clone()
        } else {
            None
        };

        let map = Arc::new(PipelineMap::new(
            name,
            TierMaps {
                local,
                shared,
                durable,
            },
            updater,
            &self.config,
        ));
        open.insert(name.to_string(), map.clone());
        info!(collection = %name, "Opened collection");
        Ok(map)
    }

    /// Close the map for `name` in every tier, keeping its data.
    pub async fn close_map(&self, name: &str) -> StratumResult<()> {
        let removed = self.open.lock().await.remove(name);
        if let Some(map) = removed {
            map.close().await;
        }
        for (tier, store) in self.caches() {
            if let Err(e) = store.close_map(name).await {
                warn!(collection = %name, %tier, error = %e, "Failed to close cache map");
            }
        }
        self.durable.close_map(name).await
    }

    /// Destroy `name`. Cached copies in other processes are told to clear.
    pub async fn remove_map(&self, name: &str) -> StratumResult<()> {
        self.ensure_open()?;
        let removed = self.open.lock().await.remove(name);
        if let Some(map) = removed {
            map.close().await;
        }
        for (tier, store) in self.caches() {
            if let Err(e) = store.remove_map(name).await {
                warn!(collection = %name, %tier, error = %e, "Failed to remove cache map");
            }
        }
        if let Some(updater) = &self.updater {
            if let Err(e) = updater.push_clear(name).await {
                warn!(collection = %name, error = %e, "Failed to broadcast collection removal");
            }
        }
        self.durable.remove_map(name).await?;
        info!(collection = %name, "Removed collection");
        Ok(())
    }

    pub async fn maps(&self) -> StratumResult<BTreeSet<String>> {
        self.ensure_open()?;
        self.durable.maps().await
    }

    pub async fn has_map(&self, name: &str) -> StratumResult<bool> {
        self.ensure_open()?;
        self.durable.has_map(name).await
    }

    /// True once closed, or when any configured tier reports closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
            || self.durable.is_closed()
            || self.caches().any(|(_, store)| store.is_closed())
    }

    /// Close every open map, the updater and the tiers. Idempotent.
    ///
    /// Every step is attempted; the durable tier's failure is returned.
    pub async fn close(&self) -> StratumResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let maps: Vec<_> = self.open.lock().await.drain().map(|(_, map)| map).collect();
        for map in maps {
            map.close().await;
        }
        if let Some(updater) = &self.updater {
            if let Err(e) = updater.close().await {
                warn!(error = %e, "Failed to close updater");
            }
        }
        for (tier, store) in self.caches() {
            if let Err(e) = store.close().await {
                warn!(%tier, error = %e, "Failed to close cache tier");
            }
        }
        self.durable.close().await?;
        info!("Closed pipeline store");
        Ok(())
    }
}
