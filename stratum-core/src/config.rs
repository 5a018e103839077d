//! Configuration types

use crate::{ConfigError, StratumResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-tier settings for a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierOptions {
    /// Entries older than this are treated as absent. `None` never expires.
    #[serde(default, with = "duration_ms_opt")]
    pub ttl: Option<Duration>,
}

impl TierOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }
}

/// Per-collection tier participation.
///
/// The durable tier always participates; the cache tiers are opt-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryOptions {
    /// Whether the process-local cache participates.
    pub local_cache: bool,
    /// Whether the shared cache participates.
    pub global_cache: bool,
    /// Settings passed to the local cache tier.
    #[serde(default)]
    pub local: TierOptions,
    /// Settings passed to the shared cache tier.
    #[serde(default)]
    pub global: TierOptions,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            local_cache: true,
            global_cache: true,
            local: TierOptions::default(),
            global: TierOptions::default(),
        }
    }
}

impl RepositoryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only the durable tier participates.
    pub fn durable_only() -> Self {
        Self {
            local_cache: false,
            global_cache: false,
            ..Self::default()
        }
    }

    pub fn with_local_cache(mut self, enabled: bool) -> Self {
        self.local_cache = enabled;
        self
    }

    pub fn with_global_cache(mut self, enabled: bool) -> Self {
        self.global_cache = enabled;
        self
    }

    pub fn with_local_ttl(mut self, ttl: Duration) -> Self {
        self.local.ttl = Some(ttl);
        self
    }

    pub fn with_global_ttl(mut self, ttl: Duration) -> Self {
        self.global.ttl = Some(ttl);
        self
    }
}

// ============================================================================
// PIPELINE CONFIGURATION
// ============================================================================

/// Runtime settings for a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Maximum number of concurrently running promotion tasks per collection.
    pub sync_workers: usize,

    /// How long `close` waits for in-flight promotion tasks.
    pub shutdown_timeout: Duration,

    /// Capacity of each event bus broadcast channel.
    pub event_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sync_workers: 4,
            shutdown_timeout: Duration::from_secs(5),
            event_capacity: 1024,
        }
    }
}

impl PipelineConfig {
    /// Create PipelineConfig from environment variables.
    ///
    /// Environment variables:
    /// - `STRATUM_SYNC_WORKERS`: Concurrent promotion tasks per collection (default: 4)
    /// - `STRATUM_SHUTDOWN_TIMEOUT_MS`: Drain timeout on close (default: 5000)
    /// - `STRATUM_EVENT_CAPACITY`: Event bus channel capacity (default: 1024)
    pub fn from_env() -> StratumResult<Self> {
        let defaults = Self::default();

        let sync_workers = parse_env("STRATUM_SYNC_WORKERS")?.unwrap_or(defaults.sync_workers);
        let shutdown_timeout = parse_env::<u64>("STRATUM_SHUTDOWN_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.shutdown_timeout);
        let event_capacity =
            parse_env("STRATUM_EVENT_CAPACITY")?.unwrap_or(defaults.event_capacity);

        let config = Self {
            sync_workers,
            shutdown_timeout,
            event_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> StratumResult<()> {
        if self.sync_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync_workers".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "event_capacity".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub fn with_sync_workers(mut self, workers: usize) -> Self {
        self.sync_workers = workers;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> StratumResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            ConfigError::InvalidValue {
                field: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }
            .into()
        }),
        Err(_) => Ok(None),
    }
}

mod duration_ms_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_options_builder() {
        let options = RepositoryOptions::new()
            .with_global_cache(false)
            .with_local_ttl(Duration::from_secs(30));
        assert!(options.local_cache);
        assert!(!options.global_cache);
        assert_eq!(options.local.ttl, Some(Duration::from_secs(30)));
        assert_eq!(options.global.ttl, None);
    }

    #[test]
    fn test_durable_only() {
        let options = RepositoryOptions::durable_only();
        assert!(!options.local_cache);
        assert!(!options.global_cache);
    }

    #[test]
    fn test_repository_options_serde_ttl_in_millis() {
        let options = RepositoryOptions::new().with_global_ttl(Duration::from_millis(1500));
        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["global"]["ttl"], serde_json::json!(1500));
        let back: RepositoryOptions = serde_json::from_value(json).unwrap();
        assert_eq!(back, options);
    }

    #[test]
    fn test_pipeline_config_validate() {
        assert!(PipelineConfig::default().validate().is_ok());
        assert!(PipelineConfig::default()
            .with_sync_workers(0)
            .validate()
            .is_err());
        assert!(PipelineConfig::default()
            .with_event_capacity(0)
            .validate()
            .is_err());
    }
}
