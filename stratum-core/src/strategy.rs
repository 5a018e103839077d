//! Tier identifiers and request-scoped query strategies.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// TIER
// ============================================================================

/// One of the three backing stores a record may reside in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Process-local cache
    Local,
    /// Shared/distributed cache
    Shared,
    /// Durable store
    Durable,
}

impl Tier {
    /// All tiers, fastest first.
    pub const ALL: [Tier; 3] = [Tier::Local, Tier::Shared, Tier::Durable];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Local => "local",
            Tier::Shared => "shared",
            Tier::Durable => "durable",
        }
    }

    /// The strategy flag that selects this tier.
    pub fn strategy(&self) -> QueryStrategy {
        match self {
            Tier::Local => QueryStrategy::LOCAL_CACHE,
            Tier::Shared => QueryStrategy::GLOBAL_CACHE,
            Tier::Durable => QueryStrategy::GLOBAL_STORAGE,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// QUERY STRATEGY
// ============================================================================

bitflags! {
    /// Set of tiers a single operation is scoped to.
    ///
    /// `ALL` is the union of the three tier flags, so "includes X or ALL"
    /// reduces to `contains(X)`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueryStrategy: u8 {
        /// Process-local cache
        const LOCAL_CACHE = 0b0000_0001;
        /// Shared cache
        const GLOBAL_CACHE = 0b0000_0010;
        /// Durable store
        const GLOBAL_STORAGE = 0b0000_0100;
        /// Every tier
        const ALL = Self::LOCAL_CACHE.bits() | Self::GLOBAL_CACHE.bits() | Self::GLOBAL_STORAGE.bits();
    }
}

impl QueryStrategy {
    /// Whether this strategy selects the given tier.
    pub fn targets(&self, tier: Tier) -> bool {
        self.contains(tier.strategy())
    }

    /// The tiers selected by this strategy, fastest first.
    pub fn tiers(&self) -> impl Iterator<Item = Tier> + '_ {
        Tier::ALL.into_iter().filter(move |tier| self.targets(*tier))
    }
}

impl Default for QueryStrategy {
    fn default() -> Self {
        QueryStrategy::ALL
    }
}

impl From<Tier> for QueryStrategy {
    fn from(tier: Tier) -> Self {
        tier.strategy()
    }
}

impl FromIterator<Tier> for QueryStrategy {
    fn from_iter<I: IntoIterator<Item = Tier>>(iter: I) -> Self {
        iter.into_iter()
            .fold(QueryStrategy::empty(), |acc, tier| acc | tier.strategy())
    }
}

impl fmt::Display for QueryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            return f.write_str("ALL");
        }
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        if names.is_empty() {
            f.write_str("NONE")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// Error when parsing an invalid strategy string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryStrategyParseError(pub String);

impl fmt::Display for QueryStrategyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid query strategy: {}", self.0)
    }
}

impl std::error::Error for QueryStrategyParseError {}

impl FromStr for QueryStrategy {
    type Err = QueryStrategyParseError;

    /// Parses `LOCAL_CACHE`, `GLOBAL_CACHE`, `GLOBAL_STORAGE`, `ALL`, or a
    /// `|`-separated combination (case-insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split('|')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .try_fold(QueryStrategy::empty(), |acc, part| {
                let flag = match part.to_ascii_uppercase().as_str() {
                    "LOCAL_CACHE" => QueryStrategy::LOCAL_CACHE,
                    "GLOBAL_CACHE" => QueryStrategy::GLOBAL_CACHE,
                    "GLOBAL_STORAGE" => QueryStrategy::GLOBAL_STORAGE,
                    "ALL" => QueryStrategy::ALL,
                    _ => return Err(QueryStrategyParseError(s.to_string())),
                };
                Ok(acc | flag)
            })
    }
}

// Manual serde implementation (bitflags 2.x + serde)
impl Serialize for QueryStrategy {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for QueryStrategy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u8::deserialize(deserializer)?;
        QueryStrategy::from_bits(bits)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid strategy bits: {bits:#04b}")))
    }
}
