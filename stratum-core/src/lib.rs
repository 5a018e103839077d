//! Stratum Core - Shared Types
//!
//! Record identifiers, the schema-less [`Document`], query strategies, the
//! error taxonomy, filter/sort expressions, configuration, and the named
//! lock registry. Every other Stratum crate depends on this one.

pub mod codec;
pub mod config;
pub mod document;
pub mod error;
pub mod filter;
pub mod lock;
pub mod strategy;

pub use codec::{DocumentCodec, JsonCodec};
pub use config::{PipelineConfig, RepositoryOptions, TierOptions};
pub use document::{Document, PATH_SEPARATOR};
pub use error::{
    ConfigError, EventError, RepositoryError, StorageError, StratumError, StratumResult,
    ValidationError,
};
pub use filter::{compare_values, Condition, FilterExpr, FilterOperator, Predicate, SortOrder, SortSpec};
pub use lock::{LockKey, LockPair, LockService};
pub use strategy::{QueryStrategy, QueryStrategyParseError, Tier};

use chrono::{DateTime, Utc};
use uuid::Uuid;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Record identifier. The sole primary key in every tier and collection.
pub type EntityId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Opaque tier-level payload.
pub type RawRecord = Vec<u8>;

/// Generate a new UUIDv7 EntityId (timestamp-sortable).
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}
