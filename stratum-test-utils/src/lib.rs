//! Stratum Test Utilities
//!
//! Shared test infrastructure for the Stratum workspace:
//! - Proptest generators for ids, strategies and documents
//! - Fixtures for in-memory tier bundles and multi-process setups
//! - Assertions and polling helpers for eventually-consistent state
//! - Tracing setup for test output

pub use stratum_core::{
    Document, EntityId, PipelineConfig, QueryStrategy, RepositoryOptions, StratumError,
    StratumResult, Tier,
};
pub use stratum_storage::MemoryStore;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Stratum types.

    use super::*;
    use proptest::prelude::*;
    use serde_json::{Map, Value};

    /// Generate a random UUID.
    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    /// Generate any tier set, including the empty one.
    pub fn arb_strategy() -> impl Strategy<Value = QueryStrategy> {
        any::<u8>().prop_map(QueryStrategy::from_bits_truncate)
    }

    /// Generate a tier set with at least one tier.
    pub fn arb_nonempty_strategy() -> impl Strategy<Value = QueryStrategy> {
        (1u8..8).prop_map(QueryStrategy::from_bits_truncate)
    }

    /// Generate a field name without path separators.
    pub fn arb_field_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,7}"
    }

    /// Generate a scalar JSON value.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-zA-Z0-9 ]{0,16}".prop_map(Value::from),
        ]
    }

    /// Generate a JSON value nested up to three levels.
    pub fn arb_value() -> impl Strategy<Value = Value> {
        arb_scalar().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map(arb_field_name(), inner, 0..4)
                    .prop_map(|fields| Value::Object(fields.into_iter().collect::<Map<_, _>>())),
            ]
        })
    }

    /// Generate a document with up to six top-level fields.
    pub fn arb_document() -> impl Strategy<Value = Document> {
        prop::collection::btree_map(arb_field_name(), arb_value(), 0..6)
            .prop_map(|fields| fields.into_iter().collect::<Document>())
    }

    /// Generate a dotted path of one to four segments.
    pub fn arb_path() -> impl Strategy<Value = String> {
        prop::collection::vec(arb_field_name(), 1..4).prop_map(|segments| segments.join("."))
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built tier bundles and pipelines.

    use super::*;
    use stratum_events::{BroadcastHub, HubUpdater, Updater};
    use stratum_repository::Pipeline;

    /// One in-memory store per tier.
    #[derive(Debug, Clone)]
    pub struct MemoryTiers {
        pub local: Arc<MemoryStore>,
        pub shared: Arc<MemoryStore>,
        pub durable: Arc<MemoryStore>,
    }

    impl MemoryTiers {
        pub fn new() -> Self {
            Self {
                local: Arc::new(MemoryStore::for_tier(Tier::Local)),
                shared: Arc::new(MemoryStore::for_tier(Tier::Shared)),
                durable: Arc::new(MemoryStore::for_tier(Tier::Durable)),
            }
        }

        /// Same shared and durable tiers, fresh local tier.
        pub fn with_fresh_local(&self) -> Self {
            Self {
                local: Arc::new(MemoryStore::for_tier(Tier::Local)),
                shared: self.shared.clone(),
                durable: self.durable.clone(),
            }
        }

        pub fn store(&self, tier: Tier) -> &Arc<MemoryStore> {
            match tier {
                Tier::Local => &self.local,
                Tier::Shared => &self.shared,
                Tier::Durable => &self.durable,
            }
        }

        /// Pipeline over all three tiers, with an optional invalidation channel.
        pub fn pipeline(&self, updater: Option<Arc<dyn Updater>>) -> StratumResult<Pipeline> {
            self.pipeline_with(updater, &PipelineConfig::default())
        }

        pub fn pipeline_with(
            &self,
            updater: Option<Arc<dyn Updater>>,
            config: &PipelineConfig,
        ) -> StratumResult<Pipeline> {
            let mut builder = Pipeline::builder()
                .config(config.clone())
                .durable(self.durable.clone())
                .shared(self.shared.clone())
                .local(self.local.clone());
            if let Some(updater) = updater {
                builder = builder.updater(updater);
            }
            builder.build()
        }
    }

    impl Default for MemoryTiers {
        fn default() -> Self {
            Self::new()
        }
    }

    /// One simulated process: its own local tier and updater.
    pub struct Process {
        pub tiers: MemoryTiers,
        pub updater: Arc<HubUpdater>,
        pub pipeline: Pipeline,
    }

    /// Two processes sharing durable and shared tiers and a broadcast hub.
    ///
    /// Must be created inside a tokio runtime; each updater spawns a relay task.
    pub struct TwoProcesses {
        pub hub: BroadcastHub,
        pub first: Process,
        pub second: Process,
    }

    impl TwoProcesses {
        pub fn new() -> StratumResult<Self> {
            Self::with_config(&PipelineConfig::default())
        }

        /// Hub and both buses sized by `config.event_capacity`.
        pub fn with_config(config: &PipelineConfig) -> StratumResult<Self> {
            let hub = BroadcastHub::from_config(config);
            let tiers = MemoryTiers::new();
            let first = Self::process(&hub, tiers.with_fresh_local(), config)?;
            let second = Self::process(&hub, tiers.with_fresh_local(), config)?;
            Ok(Self { hub, first, second })
        }

        fn process(
            hub: &BroadcastHub,
            tiers: MemoryTiers,
            config: &PipelineConfig,
        ) -> StratumResult<Process> {
            let updater = Arc::new(hub.connect_with(config));
            let pipeline = tiers.pipeline_with(Some(updater.clone() as Arc<dyn Updater>), config)?;
            Ok(Process {
                tiers,
                updater,
                pipeline,
            })
        }
    }
}

// ============================================================================
// ASSERTIONS AND HELPERS
// ============================================================================

pub mod assertions {
    //! Checks against tier contents and eventually-consistent state.

    use super::*;
    use stratum_storage::StoreMap;

    /// Whether the open map `collection` of `store` holds `id`.
    pub async fn tier_contains(store: &MemoryStore, collection: &str, id: EntityId) -> bool {
        match store.open_handle(collection) {
            Some(map) => map.contains(id).await.unwrap_or(false),
            None => false,
        }
    }

    /// Raw bytes for `id` in the open map `collection` of `store`.
    pub async fn tier_get(store: &MemoryStore, collection: &str, id: EntityId) -> Option<Vec<u8>> {
        let map = store.open_handle(collection)?;
        map.get(id).await.ok().flatten()
    }

    /// Poll `check` until it returns true or `timeout` passes.
    pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if check().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Assert the error reports a closed or dropped repository.
    pub fn assert_repository_closed<T: std::fmt::Debug>(result: StratumResult<T>) {
        match result {
            Err(e) if e.is_repository_closed() => {}
            other => panic!("expected repository closed error, got {:?}", other),
        }
    }
}

/// Install a tracing subscriber honoring `RUST_LOG`, once per test binary.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
