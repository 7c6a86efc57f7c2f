//! Configuration types
//!
//! Every knob has a default; the `with_*` builders exist so deployments
//! override only what they measure.

use crate::entity::AttributeName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Configuration for the cache manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum entries in the in-process L1 tier.
    pub l1_capacity: usize,
    /// L1 TTL for entries with no volatile dependencies.
    pub l1_ttl: Duration,
    /// L1 TTL for entries depending on a volatile attribute.
    pub l1_volatile_ttl: Duration,
    /// L2 TTL, longer than L1 so a fleet shares fall-through work.
    pub l2_ttl: Duration,
    /// Attributes hinted as frequently mutated.
    pub volatile_attributes: BTreeSet<AttributeName>,
    /// How long stampede-guard waiters block before computing themselves.
    pub stampede_timeout: Duration,
    /// Maximum tracked attribute keys in the reverse dependency index,
    /// across all shards.
    pub dependency_capacity: usize,
    /// Lock shards for the reverse dependency index.
    pub dependency_shards: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 10_000,
            l1_ttl: Duration::from_secs(300),
            l1_volatile_ttl: Duration::from_secs(5),
            l2_ttl: Duration::from_secs(3600),
            volatile_attributes: BTreeSet::new(),
            stampede_timeout: Duration::from_secs(2),
            dependency_capacity: 100_000,
            dependency_shards: 16,
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the L1 capacity.
    pub fn with_l1_capacity(mut self, capacity: usize) -> Self {
        self.l1_capacity = capacity;
        self
    }

    /// Set the non-volatile L1 TTL.
    pub fn with_l1_ttl(mut self, ttl: Duration) -> Self {
        self.l1_ttl = ttl;
        self
    }

    /// Set the volatile L1 TTL.
    pub fn with_l1_volatile_ttl(mut self, ttl: Duration) -> Self {
        self.l1_volatile_ttl = ttl;
        self
    }

    /// Set the L2 TTL.
    pub fn with_l2_ttl(mut self, ttl: Duration) -> Self {
        self.l2_ttl = ttl;
        self
    }

    /// Mark an attribute as volatile (short TTL for dependents).
    pub fn with_volatile_attribute(mut self, name: impl Into<AttributeName>) -> Self {
        self.volatile_attributes.insert(name.into());
        self
    }

    /// Set the stampede-guard wait timeout.
    pub fn with_stampede_timeout(mut self, timeout: Duration) -> Self {
        self.stampede_timeout = timeout;
        self
    }

    /// Set the reverse dependency index capacity.
    pub fn with_dependency_capacity(mut self, capacity: usize) -> Self {
        self.dependency_capacity = capacity;
        self
    }

    /// Whether the given attribute carries the volatile hint.
    pub fn is_volatile(&self, name: &str) -> bool {
        self.volatile_attributes.contains(name)
    }
}

/// Configuration for the resolution registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Maximum entries in the hot L1 name map.
    pub l1_capacity: usize,
    /// L1 TTL.
    pub l1_ttl: Duration,
    /// Maximum entries in the larger L2 name map.
    pub l2_capacity: usize,
    /// L2 TTL, longer than L1.
    pub l2_ttl: Duration,
    /// How long a renamed name keeps answering `Renamed` before it
    /// degrades to `NotFound`.
    pub tombstone_grace: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 4_096,
            l1_ttl: Duration::from_secs(60),
            l2_capacity: 65_536,
            l2_ttl: Duration::from_secs(600),
            tombstone_grace: Duration::from_secs(300),
        }
    }
}

impl ResolverConfig {
    /// Create a new resolver config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the L1 capacity.
    pub fn with_l1_capacity(mut self, capacity: usize) -> Self {
        self.l1_capacity = capacity;
        self
    }

    /// Set the L2 capacity.
    pub fn with_l2_capacity(mut self, capacity: usize) -> Self {
        self.l2_capacity = capacity;
        self
    }

    /// Set the rename tombstone grace period.
    pub fn with_tombstone_grace(mut self, grace: Duration) -> Self {
        self.tombstone_grace = grace;
        self
    }
}

/// Configuration for the index advisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisorConfig {
    /// Sliding window over which query-shape frequency is counted.
    pub observation_window: Duration,
    /// Observations within the window before a shape is recommended.
    pub recommendation_threshold: u64,
    /// An active index unused for this long is retired.
    pub retirement_staleness: Duration,
    /// Interval between reconcile runs when driven by the engine loop.
    pub reconcile_interval: Duration,
    /// Maximum distinct shapes tracked; least-recently-seen beyond this
    /// are dropped.
    pub max_tracked_shapes: usize,
    /// Counter lock shards.
    pub shard_count: usize,
    /// A field present on fewer than this fraction of scanned entities is
    /// recommended as a sparse index.
    pub sparse_presence_cutoff: f64,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            observation_window: Duration::from_secs(600),
            recommendation_threshold: 100,
            retirement_staleness: Duration::from_secs(86_400),
            reconcile_interval: Duration::from_secs(60),
            max_tracked_shapes: 1_024,
            shard_count: 16,
            sparse_presence_cutoff: 0.5,
        }
    }
}

impl AdvisorConfig {
    /// Create a new advisor config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the observation window.
    pub fn with_observation_window(mut self, window: Duration) -> Self {
        self.observation_window = window;
        self
    }

    /// Set the recommendation threshold.
    pub fn with_recommendation_threshold(mut self, threshold: u64) -> Self {
        self.recommendation_threshold = threshold;
        self
    }

    /// Set the retirement staleness threshold.
    pub fn with_retirement_staleness(mut self, staleness: Duration) -> Self {
        self.retirement_staleness = staleness;
        self
    }

    /// Set the reconcile interval.
    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }
}

/// Aggregate engine configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Cache manager settings.
    pub cache: CacheConfig,
    /// Resolution registry settings.
    pub resolver: ResolverConfig,
    /// Index advisor settings.
    pub advisor: AdvisorConfig,
}

impl EngineConfig {
    /// Create a new engine config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cache settings.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Replace the resolver settings.
    pub fn with_resolver(mut self, resolver: ResolverConfig) -> Self {
        self.resolver = resolver;
        self
    }

    /// Replace the advisor settings.
    pub fn with_advisor(mut self, advisor: AdvisorConfig) -> Self {
        self.advisor = advisor;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config_builder() {
        let config = CacheConfig::new()
            .with_l1_capacity(500)
            .with_l1_ttl(Duration::from_secs(120))
            .with_l1_volatile_ttl(Duration::from_secs(1))
            .with_l2_ttl(Duration::from_secs(1800))
            .with_volatile_attribute("Health")
            .with_stampede_timeout(Duration::from_millis(250));

        assert_eq!(config.l1_capacity, 500);
        assert_eq!(config.l1_ttl, Duration::from_secs(120));
        assert_eq!(config.l1_volatile_ttl, Duration::from_secs(1));
        assert_eq!(config.l2_ttl, Duration::from_secs(1800));
        assert!(config.is_volatile("Health"));
        assert!(!config.is_volatile("Name"));
        assert_eq!(config.stampede_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_resolver_and_advisor_builders() {
        let resolver = ResolverConfig::new()
            .with_l1_capacity(10)
            .with_tombstone_grace(Duration::from_secs(30));
        assert_eq!(resolver.l1_capacity, 10);
        assert_eq!(resolver.tombstone_grace, Duration::from_secs(30));

        let advisor = AdvisorConfig::new()
            .with_recommendation_threshold(50)
            .with_observation_window(Duration::from_secs(60));
        assert_eq!(advisor.recommendation_threshold, 50);
        assert_eq!(advisor.observation_window, Duration::from_secs(60));
    }

    #[test]
    fn test_engine_config_aggregates() {
        let config = EngineConfig::new()
            .with_cache(CacheConfig::new().with_l1_capacity(7))
            .with_resolver(ResolverConfig::new().with_l1_capacity(9));
        assert_eq!(config.cache.l1_capacity, 7);
        assert_eq!(config.resolver.l1_capacity, 9);
    }
}
