//! Shared-tier trait and cache statistics.

use crate::key::CacheKey;
use async_trait::async_trait;
use plugboard_core::{CacheError, Timestamp};

/// A value as stored in a shared tier: opaque payload bytes plus the time
/// it was cached, for TTL decisions on the read side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierRecord {
    pub payload: Vec<u8>,
    pub cached_at: Timestamp,
}

/// A cache tier shared across process instances (the L2 of the stack).
///
/// Implementations hold serialized bytes; the manager owns serialization.
/// Every method is fallible, and every failure is recovered by the manager
/// falling through to the next tier: a broken L2 costs latency, never
/// correctness.
#[async_trait]
pub trait SharedTier: Send + Sync {
    /// Get a record, or `None` on miss.
    async fn get(&self, key: &CacheKey) -> Result<Option<TierRecord>, CacheError>;

    /// Store a record.
    async fn put(&self, key: &CacheKey, payload: &[u8], cached_at: Timestamp)
        -> Result<(), CacheError>;

    /// Remove a record. Removing an absent key is a no-op.
    async fn remove(&self, key: &CacheKey) -> Result<(), CacheError>;

    /// Drop every record, returning how many were removed.
    async fn clear(&self) -> Result<u64, CacheError>;

    /// Usage counters.
    async fn stats(&self) -> Result<CacheStats, CacheError>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Number of evictions due to capacity.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
