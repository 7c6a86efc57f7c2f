//! In-process L1 tier.
//!
//! Bounded map with recency-ordered eviction and per-entry TTL. The
//! recency order is kept lazily: every touch pushes a `(key, tick)` pair
//! onto a queue, and eviction pops until it finds a pair whose tick is
//! still the entry's current one. Lookups stay O(1) and eviction is
//! amortized O(1) without a linked list.

use crate::key::CacheKey;
use crate::traits::CacheStats;
use chrono::Utc;
use plugboard_core::{Entity, Timestamp};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// What an L1 slot holds: entities stay deserialized on the hot path,
/// derived values are kept as JSON trees and reified per read.
#[derive(Debug, Clone)]
pub(crate) enum Payload {
    Entity(Entity),
    Json(serde_json::Value),
}

#[derive(Debug)]
struct L1Entry {
    payload: Payload,
    expires_at: Timestamp,
    tick: u64,
}

#[derive(Debug, Default)]
struct L1Inner {
    map: HashMap<CacheKey, L1Entry>,
    recency: VecDeque<(CacheKey, u64)>,
    tick: u64,
}

pub(crate) struct L1Cache {
    capacity: usize,
    inner: Mutex<L1Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl L1Cache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(L1Inner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    // A poisoned lock only means another thread panicked mid-operation;
    // the map itself is still structurally sound, so keep serving.
    fn lock(&self) -> MutexGuard<'_, L1Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn get(&self, key: &CacheKey) -> Option<Payload> {
        let mut inner = self.lock();
        let now = Utc::now();
        let Some(entry) = inner.map.get(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        if entry.expires_at <= now {
            inner.map.remove(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let payload = entry.payload.clone();
        inner.tick += 1;
        let tick = inner.tick;
        if let Some(entry) = inner.map.get_mut(key) {
            entry.tick = tick;
        }
        inner.recency.push_back((key.clone(), tick));
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(payload)
    }

    pub(crate) fn insert(&self, key: CacheKey, payload: Payload, ttl: Duration) {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(0));
        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;
        inner.map.insert(
            key.clone(),
            L1Entry {
                payload,
                expires_at,
                tick,
            },
        );
        inner.recency.push_back((key, tick));
        self.evict_over_capacity(&mut inner);
    }

    fn evict_over_capacity(&self, inner: &mut L1Inner) {
        while inner.map.len() > self.capacity {
            let Some((key, tick)) = inner.recency.pop_front() else {
                break;
            };
            // Stale recency pairs (the entry was touched again, or already
            // removed) are skipped.
            let current = inner.map.get(&key).map(|e| e.tick);
            if current == Some(tick) {
                inner.map.remove(&key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Remove an entry. Returns whether it was present.
    pub(crate) fn remove(&self, key: &CacheKey) -> bool {
        self.lock().map.remove(key).is_some()
    }

    pub(crate) fn clear(&self) -> u64 {
        let mut inner = self.lock();
        let removed = inner.map.len() as u64;
        inner.map.clear();
        inner.recency.clear();
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub(crate) fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.len() as u64,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
