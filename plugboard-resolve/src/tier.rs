//! Bounded in-process map tier with TTL and recency eviction.
//!
//! Same lazy-LRU scheme as the cache manager's L1, kept local to this
//! crate: resolution tiers are keyed by name or id rather than entity
//! content and must never share invalidation traffic with entity caches.

use chrono::Utc;
use plugboard_core::Timestamp;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug)]
struct TierEntry<V> {
    value: V,
    expires_at: Timestamp,
    tick: u64,
}

#[derive(Debug)]
struct TierInner<K, V> {
    map: HashMap<K, TierEntry<V>>,
    recency: VecDeque<(K, u64)>,
    tick: u64,
}

pub(crate) struct TierMap<K, V> {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<TierInner<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TierMap<K, V> {
    pub(crate) fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(TierInner {
                map: HashMap::new(),
                recency: VecDeque::new(),
                tick: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TierInner<K, V>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.lock();
        let now = Utc::now();
        let entry = inner.map.get(key)?;
        if entry.expires_at <= now {
            inner.map.remove(key);
            return None;
        }
        let value = entry.value.clone();
        inner.tick += 1;
        let tick = inner.tick;
        if let Some(entry) = inner.map.get_mut(key) {
            entry.tick = tick;
        }
        inner.recency.push_back((key.clone(), tick));
        Some(value)
    }

    pub(crate) fn insert(&self, key: K, value: V) {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::seconds(0));
        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;
        inner.map.insert(
            key.clone(),
            TierEntry {
                value,
                expires_at,
                tick,
            },
        );
        inner.recency.push_back((key, tick));
        while inner.map.len() > self.capacity {
            let Some((old_key, old_tick)) = inner.recency.pop_front() else {
                break;
            };
            if inner.map.get(&old_key).map(|e| e.tick) == Some(old_tick) {
                inner.map.remove(&old_key);
            }
        }
    }

    pub(crate) fn remove(&self, key: &K) -> Option<V> {
        self.lock().map.remove(key).map(|e| e.value)
    }

    pub(crate) fn clear(&self) {
        let mut inner = self.lock();
        inner.map.clear();
        inner.recency.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn test_insert_get_remove() {
        let tier: TierMap<String, u32> = TierMap::new(4, TTL);
        tier.insert("a".into(), 1);
        assert_eq!(tier.get(&"a".to_string()), Some(1));
        assert_eq!(tier.remove(&"a".to_string()), Some(1));
        assert_eq!(tier.get(&"a".to_string()), None);
    }

    #[test]
    fn test_ttl_expiry() {
        let tier: TierMap<String, u32> = TierMap::new(4, Duration::ZERO);
        tier.insert("a".into(), 1);
        assert_eq!(tier.get(&"a".to_string()), None);
    }

    #[test]
    fn test_capacity_evicts_least_recent() {
        let tier: TierMap<u32, u32> = TierMap::new(2, TTL);
        tier.insert(1, 1);
        tier.insert(2, 2);
        tier.get(&1);
        tier.insert(3, 3);

        assert_eq!(tier.get(&2), None);
        assert_eq!(tier.get(&1), Some(1));
        assert_eq!(tier.get(&3), Some(3));
        assert_eq!(tier.len(), 2);
    }
}
