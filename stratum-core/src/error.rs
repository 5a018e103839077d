//! Error types for Stratum operations

use crate::Tier;
use thiserror::Error;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Backend failure on {tier} tier: {reason}")]
    Backend { tier: Tier, reason: String },

    #[error("Store for {tier} tier is closed")]
    StoreClosed { tier: Tier },

    #[error("Map {name} is closed")]
    MapClosed { name: String },

    #[error("Codec failure: {reason}")]
    Codec { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Repository lifecycle errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("Repository {name} is closed")]
    Closed { name: String },

    #[error("Repository {name} has been dropped")]
    Dropped { name: String },
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Empty query strategy set for {operation}")]
    EmptyStrategy { operation: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Invalid document path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Invalidation channel errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("Invalidation channel closed")]
    ChannelClosed,

    #[error("Failed to encode invalidation message: {reason}")]
    Encode { reason: String },

    #[error("Failed to decode invalidation message: {reason}")]
    Decode { reason: String },
}

/// Master error type for all Stratum errors.
#[derive(Debug, Clone, Error)]
pub enum StratumError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Event error: {0}")]
    Event(#[from] EventError),
}

impl StratumError {
    /// Shorthand for a backend failure on a tier.
    pub fn backend(tier: Tier, reason: impl Into<String>) -> Self {
        StorageError::Backend {
            tier,
            reason: reason.into(),
        }
        .into()
    }

    /// True when the error reports use of a closed or dropped repository.
    pub fn is_repository_closed(&self) -> bool {
        matches!(self, StratumError::Repository(_))
    }
}

/// Result type alias for Stratum operations.
pub type StratumResult<T> = Result<T, StratumError>;

// =============================================================================
// TESTS
// =============================================================================
