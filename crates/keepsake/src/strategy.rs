use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Cache-versus-network precedence for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Network only; never read or write the cache.
    #[default]
    NoCache,
    /// Network only; successful responses are written back.
    ForceNetwork,
    /// Cache only; an empty cache delivers [`crate::Delivery::NoCachedData`].
    ForceCache,
    /// Fresh cache entry if present, otherwise the network.
    IfCacheElseNetwork,
    /// Network first; falls back to the cache on failure or a non-2xx status.
    IfNetworkElseCache,
    /// Fresh cache entry first (if any), then always the network.
    CacheAndNetwork,
    /// Reserved. Parses, but is rejected when a policy is resolved.
    CacheAndNetworkDiff,
}

impl Strategy {
    pub const ALL: [Strategy; 7] = [
        Strategy::NoCache,
        Strategy::ForceNetwork,
        Strategy::ForceCache,
        Strategy::IfCacheElseNetwork,
        Strategy::IfNetworkElseCache,
        Strategy::CacheAndNetwork,
        Strategy::CacheAndNetworkDiff,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::NoCache => "no_cache",
            Strategy::ForceNetwork => "force_network",
            Strategy::ForceCache => "force_cache",
            Strategy::IfCacheElseNetwork => "if_cache_else_network",
            Strategy::IfNetworkElseCache => "if_network_else_cache",
            Strategy::CacheAndNetwork => "cache_and_network",
            Strategy::CacheAndNetworkDiff => "cache_and_network_diff",
        }
    }

    /// Successful network responses are stored.
    pub fn writes_back(self) -> bool {
        !matches!(self, Strategy::NoCache | Strategy::ForceCache)
    }

    /// Upper bound on deliveries for one call.
    pub fn max_deliveries(self) -> usize {
        match self {
            Strategy::CacheAndNetwork => 2,
            _ => 1,
        }
    }

    /// Fails for tags without defined semantics.
    pub fn check_implemented(self) -> Result<Self, ConfigError> {
        match self {
            Strategy::CacheAndNetworkDiff => Err(ConfigError::ReservedStrategy(self.as_str())),
            other => Ok(other),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = ConfigError;

    /// Accepts `if_cache_else_network` as well as `IF_CACHE_ELSE_NETWORK`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Strategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == normalized)
            .ok_or_else(|| ConfigError::UnknownStrategy(s.to_string()))
    }
}
