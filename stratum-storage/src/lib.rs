//! Stratum Storage - Tiers and the Tiered Pipeline
//!
//! Defines the tier contracts ([`Store`], [`StoreMap`]), two tier backends
//! ([`MemoryStore`] for caches and tests, [`LmdbStore`] for durable data),
//! and the machinery that fans a collection's reads and writes across tiers:
//! [`DataSynchronizer`], [`PipelineMap`] and [`PipelineStore`].
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │ PipelineStore (owns tiers + updater)                   │
//! │   open_map(name, options) ─→ PipelineMap               │
//! │        ├─ local  StoreMap ←── listener ←── Updater bus │
//! │        ├─ shared StoreMap                              │
//! │        ├─ durable StoreMap                             │
//! │        └─ DataSynchronizer (background promotion)      │
//! └────────────────────────────────────────────────────────┘
//! ```

mod lmdb;
mod memory;
mod pipeline_map;
mod pipeline_store;
mod store;
mod synchronizer;

pub use lmdb::{LmdbMap, LmdbStore, LmdbStoreError};
pub use memory::{MemoryMap, MemoryStore, TierStats};
pub use pipeline_map::PipelineMap;
pub use pipeline_store::PipelineStore;
pub use store::{Store, StoreMap};
pub use synchronizer::{DataSynchronizer, FenceGuard, TierMaps, WriteFence};
