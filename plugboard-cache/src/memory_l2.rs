//! In-memory shared tier.
//!
//! Fills the L2 slot for tests and single-host deployments. Insertion
//! order bounds the map: the oldest record is dropped when capacity is
//! exceeded. A fault-injection switch makes every call fail, for
//! exercising the manager's fall-through path.

use crate::key::CacheKey;
use crate::traits::{CacheStats, SharedTier, TierRecord};
use async_trait::async_trait;
use plugboard_core::{CacheError, Timestamp};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct MemoryTierInner {
    map: HashMap<Vec<u8>, TierRecord>,
    order: VecDeque<Vec<u8>>,
}

/// In-memory [`SharedTier`].
pub struct MemoryTier {
    capacity: usize,
    inner: RwLock<MemoryTierInner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    fail: AtomicBool,
}

impl MemoryTier {
    /// Create a tier bounded to `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(MemoryTierInner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            fail: AtomicBool::new(false),
        }
    }

    /// Fault injection: make every tier call fail until cleared.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn ensure_healthy(&self) -> Result<(), CacheError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CacheError::Backend {
                reason: "memory tier marked failed".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SharedTier for MemoryTier {
    async fn get(&self, key: &CacheKey) -> Result<Option<TierRecord>, CacheError> {
        self.ensure_healthy()?;
        let inner = self.inner.read().await;
        match inner.map.get(&key.encode()) {
            Some(record) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(record.clone()))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn put(
        &self,
        key: &CacheKey,
        payload: &[u8],
        cached_at: Timestamp,
    ) -> Result<(), CacheError> {
        self.ensure_healthy()?;
        let encoded = key.encode();
        let mut inner = self.inner.write().await;
        if inner.map.insert(
            encoded.clone(),
            TierRecord {
                payload: payload.to_vec(),
                cached_at,
            },
        ).is_none()
        {
            inner.order.push_back(encoded);
        }
        while inner.map.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if inner.map.remove(&oldest).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.ensure_healthy()?;
        let mut inner = self.inner.write().await;
        inner.map.remove(&key.encode());
        Ok(())
    }

    async fn clear(&self) -> Result<u64, CacheError> {
        self.ensure_healthy()?;
        let mut inner = self.inner.write().await;
        let removed = inner.map.len() as u64;
        inner.map.clear();
        inner.order.clear();
        Ok(removed)
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        let inner = self.inner.read().await;
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: inner.map.len() as u64,
            evictions: self.evictions.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_put_get_remove() {
        let tier = MemoryTier::new(10);
        let key = CacheKey::derived("a");
        tier.put(&key, b"payload", Utc::now()).await.unwrap();

        let record = tier.get(&key).await.unwrap().unwrap();
        assert_eq!(record.payload, b"payload");

        tier.remove(&key).await.unwrap();
        assert!(tier.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let tier = MemoryTier::new(2);
        let now = Utc::now();
        for n in 0..3 {
            tier.put(&CacheKey::derived(format!("k{n}")), b"v", now)
                .await
                .unwrap();
        }
        assert!(tier.get(&CacheKey::derived("k0")).await.unwrap().is_none());
        assert!(tier.get(&CacheKey::derived("k2")).await.unwrap().is_some());
        assert_eq!(tier.stats().await.unwrap().evictions, 1);
    }

    #[tokio::test]
    async fn test_overwrite_does_not_grow() {
        let tier = MemoryTier::new(2);
        let now = Utc::now();
        let key = CacheKey::derived("k");
        tier.put(&key, b"v1", now).await.unwrap();
        tier.put(&key, b"v2", now).await.unwrap();
        assert_eq!(tier.stats().await.unwrap().entry_count, 1);
        assert_eq!(tier.get(&key).await.unwrap().unwrap().payload, b"v2");
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let tier = MemoryTier::new(2);
        tier.set_fail(true);
        assert!(tier.get(&CacheKey::derived("k")).await.is_err());
        tier.set_fail(false);
        assert!(tier.get(&CacheKey::derived("k")).await.is_ok());
    }
}
