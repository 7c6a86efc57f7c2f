//! Reverse dependency index.
//!
//! Maps `(entity, attribute)` pairs to the cache keys computed from them,
//! so a write can evict exactly its dependents. The index is sharded by
//! entity id to keep write concurrency off a single lock, and each shard
//! is bounded with the same lazy-LRU queue as the L1 tier, so an entity
//! queried once and never again cannot pin index memory forever.
//!
//! Evicting a dependency entry would let its dependents outlive the
//! attributes they were computed from, so eviction returns the orphaned
//! cache keys and the manager drops them from every tier.

use crate::key::CacheKey;
use plugboard_core::{AttributeKey, EntityId};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug)]
struct DepEntry {
    dependents: HashSet<CacheKey>,
    tick: u64,
}

#[derive(Debug, Default)]
struct DepShard {
    map: HashMap<AttributeKey, DepEntry>,
    recency: VecDeque<(AttributeKey, u64)>,
    tick: u64,
}

pub(crate) struct DependencyIndex {
    shards: Vec<Mutex<DepShard>>,
    per_shard_capacity: usize,
}

impl DependencyIndex {
    pub(crate) fn new(shard_count: usize, total_capacity: usize) -> Self {
        let shard_count = shard_count.max(1);
        let per_shard_capacity = (total_capacity / shard_count).max(1);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(DepShard::default())).collect(),
            per_shard_capacity,
        }
    }

    fn shard(&self, entity_id: &EntityId) -> MutexGuard<'_, DepShard> {
        let mut hasher = DefaultHasher::new();
        entity_id.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        match self.shards[index].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record that `key` was computed from `dependency`. Returns cache
    /// keys orphaned by capacity eviction; the caller must drop them from
    /// all tiers.
    pub(crate) fn record(&self, dependency: &AttributeKey, key: &CacheKey) -> Vec<CacheKey> {
        let mut shard = self.shard(&dependency.entity_id);
        shard.tick += 1;
        let tick = shard.tick;
        shard
            .map
            .entry(dependency.clone())
            .and_modify(|entry| {
                entry.dependents.insert(key.clone());
                entry.tick = tick;
            })
            .or_insert_with(|| DepEntry {
                dependents: HashSet::from([key.clone()]),
                tick,
            });
        shard.recency.push_back((dependency.clone(), tick));

        let mut orphaned = Vec::new();
        while shard.map.len() > self.per_shard_capacity {
            let Some((old_key, old_tick)) = shard.recency.pop_front() else {
                break;
            };
            let current = shard.map.get(&old_key).map(|e| e.tick);
            if current == Some(old_tick) {
                if let Some(entry) = shard.map.remove(&old_key) {
                    orphaned.extend(entry.dependents);
                }
            }
        }
        orphaned
    }

    /// Remove and return every dependent of `dependency`.
    pub(crate) fn take_dependents(&self, dependency: &AttributeKey) -> Vec<CacheKey> {
        let mut shard = self.shard(&dependency.entity_id);
        shard
            .map
            .remove(dependency)
            .map(|entry| entry.dependents.into_iter().collect())
            .unwrap_or_default()
    }

    /// Remove and return every dependent of any attribute of `entity_id`.
    /// All of an entity's attribute keys hash to the same shard, so this
    /// is a single-shard scan.
    pub(crate) fn take_dependents_of_entity(&self, entity_id: EntityId) -> Vec<CacheKey> {
        let mut shard = self.shard(&entity_id);
        let matching: Vec<AttributeKey> = shard
            .map
            .keys()
            .filter(|k| k.entity_id == entity_id)
            .cloned()
            .collect();
        let mut dependents = Vec::new();
        for key in matching {
            if let Some(entry) = shard.map.remove(&key) {
                dependents.extend(entry.dependents);
            }
        }
        dependents
    }

    /// Attribute keys currently tracked, across all shards.
    pub(crate) fn tracked(&self) -> usize {
        self.shards
            .iter()
            .map(|s| match s.lock() {
                Ok(guard) => guard.map.len(),
                Err(poisoned) => poisoned.into_inner().map.len(),
            })
            .sum()
    }

    pub(crate) fn clear(&self) {
        for shard in &self.shards {
            let mut shard = match shard.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            shard.map.clear();
            shard.recency.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn dep(id: EntityId, attr: &str) -> AttributeKey {
        AttributeKey::new(id, attr)
    }

    #[test]
    fn test_record_and_take() {
        let index = DependencyIndex::new(4, 100);
        let id = Uuid::now_v7();
        let key_a = CacheKey::derived("a");
        let key_b = CacheKey::derived("b");

        assert!(index.record(&dep(id, "Health"), &key_a).is_empty());
        assert!(index.record(&dep(id, "Health"), &key_b).is_empty());
        assert!(index.record(&dep(id, "Name"), &key_a).is_empty());

        let mut dependents = index.take_dependents(&dep(id, "Health"));
        dependents.sort();
        assert_eq!(dependents, vec![key_a.clone(), key_b]);

        // Taking again is empty: invalidation is idempotent.
        assert!(index.take_dependents(&dep(id, "Health")).is_empty());
        // The Name dependency is untouched.
        assert_eq!(index.take_dependents(&dep(id, "Name")), vec![key_a]);
    }

    #[test]
    fn test_take_for_entity_spans_attributes() {
        let index = DependencyIndex::new(4, 100);
        let id = Uuid::now_v7();
        let other = Uuid::now_v7();
        index.record(&dep(id, "Health"), &CacheKey::derived("a"));
        index.record(&dep(id, "Name"), &CacheKey::derived("b"));
        index.record(&dep(other, "Health"), &CacheKey::derived("c"));

        let mut dependents = index.take_dependents_of_entity(id);
        dependents.sort();
        assert_eq!(
            dependents,
            vec![CacheKey::derived("a"), CacheKey::derived("b")]
        );
        assert_eq!(index.tracked(), 1);
    }

    #[test]
    fn test_capacity_eviction_reports_orphans() {
        // One shard, two slots: the third dependency evicts the oldest.
        let index = DependencyIndex::new(1, 2);
        let id = Uuid::now_v7();
        index.record(&dep(id, "A"), &CacheKey::derived("ka"));
        index.record(&dep(id, "B"), &CacheKey::derived("kb"));
        let orphaned = index.record(&dep(id, "C"), &CacheKey::derived("kc"));

        assert_eq!(orphaned, vec![CacheKey::derived("ka")]);
        assert!(index.take_dependents(&dep(id, "A")).is_empty());
        assert_eq!(index.tracked(), 2);
    }

    #[test]
    fn test_recently_touched_dependency_survives_eviction() {
        let index = DependencyIndex::new(1, 2);
        let id = Uuid::now_v7();
        index.record(&dep(id, "A"), &CacheKey::derived("ka"));
        index.record(&dep(id, "B"), &CacheKey::derived("kb"));
        // Touch A so B is the eviction candidate.
        index.record(&dep(id, "A"), &CacheKey::derived("ka2"));
        let orphaned = index.record(&dep(id, "C"), &CacheKey::derived("kc"));

        assert_eq!(orphaned, vec![CacheKey::derived("kb")]);
        assert_eq!(index.take_dependents(&dep(id, "A")).len(), 2);
    }
}
