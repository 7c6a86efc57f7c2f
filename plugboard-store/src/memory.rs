//! In-memory entity store.
//!
//! The reference `EntityStore` implementation: HashMap tables behind an
//! RwLock, optimistic versioning, a maintained name index, and a broadcast
//! change feed. Used by tests and by single-process deployments that do
//! not need durability.

use crate::change::{Change, ChangeKind, ChangeStream};
use crate::scan::{CursorGuard, EntityScan};
use crate::{EntityStore, IndexDefinition, StoreStatistics};
use async_trait::async_trait;
use chrono::Utc;
use plugboard_core::{
    Entity, EntityId, Filter, PlugboardResult, StoreError, Timestamp, Version,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::broadcast;

const WATCH_BUFFER: usize = 1024;

#[derive(Debug, Default)]
struct MemoryInner {
    entities: HashMap<EntityId, Entity>,
    /// Current `Name` attribute -> holder. The "indexed lookup by name".
    names: HashMap<String, EntityId>,
    /// Deleted ids and when they died. Retained for the grace period so
    /// stale references fail clearly instead of being reassigned.
    tombstones: HashMap<EntityId, Timestamp>,
    indexes: BTreeMap<String, IndexDefinition>,
    sequence: u64,
}

impl MemoryInner {
    fn prune_tombstones(&mut self, grace: Duration) {
        let now = Utc::now();
        self.tombstones
            .retain(|_, died_at| match (now - *died_at).to_std() {
                Ok(age) => age < grace,
                Err(_) => true,
            });
    }
}

/// In-memory [`EntityStore`] with optimistic concurrency and a change feed.
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryInner>>,
    changes: broadcast::Sender<Change>,
    open_cursors: Arc<AtomicU64>,
    tombstone_grace: Duration,
    // Fault injection for tests: simulated outage and index-creation
    // failure.
    unavailable: AtomicBool,
    index_failure: Mutex<Option<String>>,
}

impl MemoryStore {
    /// Create a store with the default deletion grace period.
    pub fn new() -> Self {
        Self::with_tombstone_grace(Duration::from_secs(300))
    }

    /// Create a store with an explicit deletion grace period.
    pub fn with_tombstone_grace(tombstone_grace: Duration) -> Self {
        let (changes, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            inner: Arc::new(RwLock::new(MemoryInner::default())),
            changes,
            open_cursors: Arc::new(AtomicU64::new(0)),
            tombstone_grace,
            unavailable: AtomicBool::new(false),
            index_failure: Mutex::new(None),
        }
    }

    /// Simulate the backend going away: reads and writes fail with
    /// `StoreError::Unavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make subsequent `create_index` calls fail with the given reason.
    pub fn fail_index_creation(&self, reason: Option<String>) {
        if let Ok(mut failure) = self.index_failure.lock() {
            *failure = reason;
        }
    }

    /// Whether the id died recently enough that its tombstone survives.
    pub fn is_tombstoned(&self, id: EntityId) -> bool {
        self.inner
            .read()
            .map(|inner| inner.tombstones.contains_key(&id))
            .unwrap_or(false)
    }

    /// Scans currently holding a cursor.
    pub fn open_cursors(&self) -> u64 {
        self.open_cursors.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> PlugboardResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                reason: "memory store marked unavailable".into(),
            }
            .into());
        }
        Ok(())
    }

    fn read_lock(&self) -> PlugboardResult<RwLockReadGuard<'_, MemoryInner>> {
        self.inner
            .read()
            .map_err(|_| StoreError::LockPoisoned.into())
    }

    fn write_lock(&self) -> PlugboardResult<RwLockWriteGuard<'_, MemoryInner>> {
        self.inner
            .write()
            .map_err(|_| StoreError::LockPoisoned.into())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn get(&self, id: EntityId) -> PlugboardResult<Option<Entity>> {
        self.ensure_available()?;
        let inner = self.read_lock()?;
        Ok(inner.entities.get(&id).cloned())
    }

    async fn put(
        &self,
        mut entity: Entity,
        expected_version: Option<Version>,
    ) -> PlugboardResult<Version> {
        self.ensure_available()?;
        let change;
        let new_version;
        {
            let mut inner = self.write_lock()?;
            inner.prune_tombstones(self.tombstone_grace);

            if inner.tombstones.contains_key(&entity.id) {
                return Err(StoreError::InsertFailed {
                    id: entity.id,
                    reason: "id retired by deletion".into(),
                }
                .into());
            }

            let prior = inner.entities.get(&entity.id).cloned();
            match (&prior, expected_version) {
                (None, None) => {}
                (None, Some(_)) => {
                    return Err(StoreError::Conflict {
                        id: entity.id,
                        expected: expected_version,
                        actual: 0,
                    }
                    .into());
                }
                (Some(current), Some(expected)) if current.version == expected => {}
                (Some(current), _) => {
                    return Err(StoreError::Conflict {
                        id: entity.id,
                        expected: expected_version,
                        actual: current.version,
                    }
                    .into());
                }
            }

            if let Some(name) = entity.name() {
                if let Some(&holder) = inner.names.get(name) {
                    if holder != entity.id {
                        return Err(StoreError::DuplicateName {
                            name: name.to_string(),
                            holder,
                        }
                        .into());
                    }
                }
            }

            new_version = prior.as_ref().map(|p| p.version + 1).unwrap_or(1);
            entity.version = new_version;

            let new_name = entity.name().map(str::to_string);
            if let Some(prior_entity) = &prior {
                if let Some(old_name) = prior_entity.name() {
                    if new_name.as_deref() != Some(old_name) {
                        inner.names.remove(old_name);
                    }
                }
            }
            if let Some(name) = new_name {
                inner.names.insert(name, entity.id);
            }

            let changed_attributes = match &prior {
                Some(prior_entity) => entity.changed_attributes(prior_entity),
                None => entity.attributes.keys().cloned().collect(),
            };

            inner.sequence += 1;
            change = Change {
                sequence: inner.sequence,
                kind: if prior.is_some() {
                    ChangeKind::Update
                } else {
                    ChangeKind::Insert
                },
                id: entity.id,
                changed_attributes,
            };
            inner.entities.insert(entity.id, entity);
        }
        // Publish outside the lock; no subscribers is fine.
        let _ = self.changes.send(change);
        Ok(new_version)
    }

    async fn delete(
        &self,
        id: EntityId,
        expected_version: Option<Version>,
    ) -> PlugboardResult<()> {
        self.ensure_available()?;
        let change;
        {
            let mut inner = self.write_lock()?;
            let Some(current) = inner.entities.get(&id).cloned() else {
                return Err(StoreError::NotFound { id }.into());
            };
            if let Some(expected) = expected_version {
                if current.version != expected {
                    return Err(StoreError::Conflict {
                        id,
                        expected: expected_version,
                        actual: current.version,
                    }
                    .into());
                }
            }

            inner.entities.remove(&id);
            if let Some(name) = current.name() {
                inner.names.remove(name);
            }
            inner.tombstones.insert(id, Utc::now());

            inner.sequence += 1;
            change = Change {
                sequence: inner.sequence,
                kind: ChangeKind::Delete,
                id,
                changed_attributes: current.attributes.keys().cloned().collect(),
            };
        }
        let _ = self.changes.send(change);
        Ok(())
    }

    async fn query(&self, filter: Filter) -> PlugboardResult<EntityScan> {
        self.ensure_available()?;
        let mut matches: Vec<Entity> = {
            let inner = self.read_lock()?;
            inner
                .entities
                .values()
                .filter(|e| filter.matches(e))
                .cloned()
                .collect()
        };
        // Deterministic scan order; UUIDv7 ids sort by creation time.
        matches.sort_by_key(|e| e.id);
        Ok(EntityScan::with_cursor(
            matches,
            CursorGuard::open(Arc::clone(&self.open_cursors)),
        ))
    }

    fn watch(&self) -> ChangeStream {
        ChangeStream::new(self.changes.subscribe())
    }

    async fn find_by_name(&self, name: &str) -> PlugboardResult<Option<(EntityId, Version)>> {
        self.ensure_available()?;
        let inner = self.read_lock()?;
        Ok(inner.names.get(name).map(|id| {
            let version = inner.entities.get(id).map(|e| e.version).unwrap_or(0);
            (*id, version)
        }))
    }

    async fn create_index(&self, definition: IndexDefinition) -> PlugboardResult<()> {
        self.ensure_available()?;
        if let Ok(failure) = self.index_failure.lock() {
            if let Some(reason) = failure.as_ref() {
                return Err(StoreError::Index {
                    index: definition.name,
                    reason: reason.clone(),
                }
                .into());
            }
        }
        let mut inner = self.write_lock()?;
        inner.indexes.insert(definition.name.clone(), definition);
        Ok(())
    }

    async fn drop_index(&self, name: &str) -> PlugboardResult<()> {
        self.ensure_available()?;
        let mut inner = self.write_lock()?;
        inner.indexes.remove(name);
        Ok(())
    }

    async fn list_indexes(&self) -> PlugboardResult<Vec<IndexDefinition>> {
        self.ensure_available()?;
        let inner = self.read_lock()?;
        Ok(inner.indexes.values().cloned().collect())
    }

    async fn health_check(&self) -> PlugboardResult<bool> {
        Ok(!self.unavailable.load(Ordering::SeqCst))
    }

    async fn statistics(&self) -> PlugboardResult<StoreStatistics> {
        let inner = self.read_lock()?;
        Ok(StoreStatistics {
            entity_count: inner.entities.len() as u64,
            tombstone_count: inner.tombstones.len() as u64,
            index_count: inner.indexes.len() as u64,
            open_cursors: self.open_cursors(),
        })
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use plugboard_core::Value;
    use proptest::prelude::*;
    use uuid::Uuid;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Property: versions assigned by a sequence of accepted writes to
        /// one entity are exactly 1..=n.
        #[test]
        fn prop_versions_are_dense(healths in proptest::collection::vec(0.0f64..1000.0, 1..10)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("runtime");
            rt.block_on(async {
                let store = MemoryStore::new();
                let id = Uuid::now_v7();
                let mut expected = None;
                for (i, health) in healths.iter().enumerate() {
                    let entity = Entity::new(id)
                        .with_attribute("Health", Value::number(*health));
                    let version = store.put(entity, expected).await.expect("put");
                    prop_assert_eq!(version, (i + 1) as u64);
                    expected = Some(version);
                }
                Ok(())
            })?;
        }

        /// Property: a stale expected version is always rejected.
        #[test]
        fn prop_stale_writes_rejected(stale in 0u64..100, advance in 1u64..5) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("runtime");
            rt.block_on(async {
                let store = MemoryStore::new();
                let id = Uuid::now_v7();
                let mut version = store
                    .put(Entity::new(id), None)
                    .await
                    .expect("create");
                for _ in 0..advance {
                    version = store
                        .put(Entity::new(id), Some(version))
                        .await
                        .expect("advance");
                }
                if stale != version {
                    let result = store.put(Entity::new(id), Some(stale)).await;
                    prop_assert!(result.is_err());
                }
                Ok(())
            })?;
        }
    }
}
