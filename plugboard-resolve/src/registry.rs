//! The resolution registry.

use crate::tier::TierMap;
use chrono::Utc;
use plugboard_core::{
    attrs, Entity, EntityId, PlugboardResult, ResolveError, ResolverConfig, Timestamp, Value,
    Version,
};
use plugboard_store::{Change, ChangeKind, EntityStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// One name-to-id mapping, as cached in the tiers.
///
/// `version` is the entity version the mapping was observed at; stale
/// lookups surface it so callers can tell how old their view is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionEntry {
    pub name: String,
    pub id: EntityId,
    pub version: Version,
}

/// Input to [`ResolutionRegistry::batch_resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NameOrId {
    Name(String),
    Id(EntityId),
}

/// Per-item outcome of a batch resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// The item resolves to this id.
    Found(EntityId),
    /// The name was recently renamed away; the entity lives on here.
    Renamed(EntityId),
    /// Unknown name or id.
    NotFound,
}

#[derive(Debug, Clone)]
struct NameTombstone {
    id: EntityId,
    expires_at: Timestamp,
}

/// Registry statistics.
#[derive(Debug, Clone, Default)]
pub struct ResolverStats {
    pub l1_entries: usize,
    pub l2_entries: usize,
    pub tombstones: usize,
}

/// Bidirectional name/id resolution with layered caching.
///
/// Tier order on `resolve_to_id`: hot L1 map, larger L2 map, then the
/// store's indexed name lookup, populating L2 then L1 on the way back.
/// Renames write durably first; no cache tier is touched until the store
/// accepts, so a failed rename leaves no dangling optimistic entries.
pub struct ResolutionRegistry {
    store: Arc<dyn EntityStore>,
    l1: TierMap<String, ResolutionEntry>,
    l2: TierMap<String, ResolutionEntry>,
    reverse: TierMap<EntityId, String>,
    tombstones: Mutex<HashMap<String, NameTombstone>>,
    rename_locks: Mutex<HashMap<EntityId, Arc<tokio::sync::Mutex<()>>>>,
    config: ResolverConfig,
}

impl ResolutionRegistry {
    pub fn new(store: Arc<dyn EntityStore>, config: ResolverConfig) -> Self {
        Self {
            store,
            l1: TierMap::new(config.l1_capacity, config.l1_ttl),
            l2: TierMap::new(config.l2_capacity, config.l2_ttl),
            reverse: TierMap::new(config.l2_capacity, config.l2_ttl),
            tombstones: Mutex::new(HashMap::new()),
            rename_locks: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn tombstones_lock(&self) -> MutexGuard<'_, HashMap<String, NameTombstone>> {
        match self.tombstones.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Resolve a name to its current id.
    ///
    /// Distinguishes a name that never existed (`NotFound`) from one that
    /// was recently renamed away (`Renamed` with the live id) for the
    /// duration of the tombstone grace period.
    pub async fn resolve_to_id(&self, name: &str) -> PlugboardResult<EntityId> {
        if let Some(entry) = self.l1.get(&name.to_string()) {
            return Ok(entry.id);
        }
        if let Some(entry) = self.l2.get(&name.to_string()) {
            self.l1.insert(name.to_string(), entry.clone());
            return Ok(entry.id);
        }
        match self.store.find_by_name(name).await? {
            Some((id, version)) => {
                let entry = ResolutionEntry {
                    name: name.to_string(),
                    id,
                    version,
                };
                self.l2.insert(name.to_string(), entry.clone());
                self.l1.insert(name.to_string(), entry);
                self.reverse.insert(id, name.to_string());
                // A re-registered name supersedes any tombstone.
                self.tombstones_lock().remove(name);
                Ok(id)
            }
            None => {
                let mut tombstones = self.tombstones_lock();
                let now = Utc::now();
                tombstones.retain(|_, t| t.expires_at > now);
                match tombstones.get(name) {
                    Some(tombstone) => Err(ResolveError::Renamed {
                        name: name.to_string(),
                        id: tombstone.id,
                    }
                    .into()),
                    None => Err(ResolveError::NotFound {
                        name: name.to_string(),
                    }
                    .into()),
                }
            }
        }
    }

    /// Resolve an id to its current name.
    pub async fn resolve_to_name(&self, id: EntityId) -> PlugboardResult<String> {
        if let Some(name) = self.reverse.get(&id) {
            return Ok(name);
        }
        let Some(entity) = self.store.get(id).await? else {
            return Err(ResolveError::UnknownId { id }.into());
        };
        let Some(name) = entity.name() else {
            return Err(ResolveError::UnknownId { id }.into());
        };
        let entry = ResolutionEntry {
            name: name.to_string(),
            id,
            version: entity.version,
        };
        self.l2.insert(name.to_string(), entry.clone());
        self.l1.insert(name.to_string(), entry);
        self.reverse.insert(id, name.to_string());
        Ok(name.to_string())
    }

    /// Resolve a mixed batch of names and ids in one call.
    pub async fn batch_resolve(
        &self,
        items: &[NameOrId],
    ) -> PlugboardResult<HashMap<NameOrId, ResolveOutcome>> {
        let mut outcomes = HashMap::with_capacity(items.len());
        for item in items {
            let outcome = match item {
                NameOrId::Name(name) => match self.resolve_to_id(name).await {
                    Ok(id) => ResolveOutcome::Found(id),
                    Err(plugboard_core::PlugboardError::Resolve(ResolveError::Renamed {
                        id,
                        ..
                    })) => ResolveOutcome::Renamed(id),
                    Err(plugboard_core::PlugboardError::Resolve(ResolveError::NotFound {
                        ..
                    })) => ResolveOutcome::NotFound,
                    Err(other) => return Err(other),
                },
                NameOrId::Id(id) => match self.resolve_to_name(*id).await {
                    Ok(_) => ResolveOutcome::Found(*id),
                    Err(plugboard_core::PlugboardError::Resolve(ResolveError::UnknownId {
                        ..
                    })) => ResolveOutcome::NotFound,
                    Err(other) => return Err(other),
                },
            };
            outcomes.insert(item.clone(), outcome);
        }
        Ok(outcomes)
    }

    fn id_lock(&self, id: EntityId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.rename_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let lock = locks
            .entry(id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        // Drop lock entries nobody holds anymore (map reference only), so
        // the map tracks in-flight renames rather than every id ever seen.
        locks.retain(|key, l| *key == id || Arc::strong_count(l) > 1);
        lock
    }

    /// Rename an entity: durable write first, then evict the old name and
    /// optimistically pre-populate the new one.
    ///
    /// Concurrent renames of the same id are serialized; renames of
    /// different ids proceed independently.
    pub async fn rename(&self, id: EntityId, old_name: &str, new_name: &str)
        -> PlugboardResult<()>
    {
        let lock = self.id_lock(id);
        let _serialized = lock.lock().await;

        let Some(entity) = self.store.get(id).await? else {
            return Err(ResolveError::UnknownId { id }.into());
        };
        let current = entity.name().unwrap_or_default().to_string();
        if current != old_name {
            return Err(ResolveError::StaleName {
                id,
                current,
                supplied: old_name.to_string(),
            }
            .into());
        }
        if let Some((holder, _)) = self.store.find_by_name(new_name).await? {
            if holder != id {
                return Err(ResolveError::NameTaken {
                    name: new_name.to_string(),
                    holder,
                }
                .into());
            }
        }

        let mut renamed = entity.clone();
        renamed.set_attribute(attrs::NAME, Value::text(new_name));
        // Source of truth first. If this fails, no tier is touched.
        let version = self.store.put(renamed, Some(entity.version)).await?;

        debug!(%id, old_name, new_name, "rename applied");
        self.note_rename(id, Some(old_name), Some(new_name), version);
        Ok(())
    }

    /// Record an already-durable name change: evict the old name, lay a
    /// tombstone, and pre-populate the new mapping. Called by `rename` and
    /// by the engine's write path when a write changes `Name` directly.
    pub fn note_rename(
        &self,
        id: EntityId,
        old_name: Option<&str>,
        new_name: Option<&str>,
        version: Version,
    ) {
        if let Some(old) = old_name {
            self.l1.remove(&old.to_string());
            self.l2.remove(&old.to_string());
            let expires_at = Utc::now()
                + chrono::Duration::from_std(self.config.tombstone_grace)
                    .unwrap_or_else(|_| chrono::Duration::seconds(0));
            self.tombstones_lock()
                .insert(old.to_string(), NameTombstone { id, expires_at });
        }
        match new_name {
            Some(new) => {
                self.tombstones_lock().remove(new);
                let entry = ResolutionEntry {
                    name: new.to_string(),
                    id,
                    version,
                };
                self.l2.insert(new.to_string(), entry.clone());
                self.l1.insert(new.to_string(), entry);
                self.reverse.insert(id, new.to_string());
            }
            None => {
                self.reverse.remove(&id);
            }
        }
    }

    /// Evict everything cached for a deleted entity.
    pub fn note_delete(&self, id: EntityId) {
        if let Some(name) = self.reverse.remove(&id) {
            self.l1.remove(&name);
            self.l2.remove(&name);
        }
    }

    /// Apply a store change notification. Idempotent: re-applying the same
    /// change produces no further state transitions.
    pub fn handle_change(&self, change: &Change) {
        match change.kind {
            ChangeKind::Delete => self.note_delete(change.id),
            ChangeKind::Update | ChangeKind::Insert => {
                if change
                    .changed_attributes
                    .iter()
                    .any(|attr| attr == attrs::NAME)
                {
                    // Another writer changed the name; we only know the
                    // cached (old) mapping. Evict it and let the next
                    // resolve repopulate.
                    if let Some(name) = self.reverse.remove(&change.id) {
                        self.l1.remove(&name);
                        self.l2.remove(&name);
                    }
                }
            }
        }
    }

    /// Register a freshly created entity's name, avoiding a store round
    /// trip on the next resolve.
    pub fn note_insert(&self, entity: &Entity) {
        if let Some(name) = entity.name() {
            self.note_rename(entity.id, None, Some(name), entity.version);
        }
    }

    /// Drop all cached state (watch-stream lag recovery). Everything here
    /// is rebuildable from the store.
    pub fn clear(&self) {
        self.l1.clear();
        self.l2.clear();
        self.reverse.clear();
        self.tombstones_lock().clear();
    }

    /// Cache usage counters.
    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            l1_entries: self.l1.len(),
            l2_entries: self.l2.len(),
            tombstones: self.tombstones_lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugboard_core::{PlugboardError, StoreError};
    use plugboard_store::MemoryStore;
    use std::time::Duration;
    use uuid::Uuid;

    fn named(name: &str) -> Entity {
        Entity::new(Uuid::now_v7()).with_attribute(attrs::NAME, Value::text(name))
    }

    async fn registry_with(
        config: ResolverConfig,
    ) -> (Arc<MemoryStore>, ResolutionRegistry, EntityId) {
        let store = Arc::new(MemoryStore::new());
        let entity = named("Kael");
        let id = entity.id;
        store.put(entity, None).await.unwrap();
        let registry = ResolutionRegistry::new(Arc::clone(&store) as Arc<dyn EntityStore>, config);
        (store, registry, id)
    }

    #[tokio::test]
    async fn test_resolve_falls_through_to_store_and_caches() {
        let (_store, registry, id) = registry_with(ResolverConfig::default()).await;

        assert_eq!(registry.resolve_to_id("Kael").await.unwrap(), id);
        let stats = registry.stats();
        assert_eq!(stats.l1_entries, 1);
        assert_eq!(stats.l2_entries, 1);

        // Second resolve is served from the tiers.
        assert_eq!(registry.resolve_to_id("Kael").await.unwrap(), id);
        assert_eq!(registry.resolve_to_name(id).await.unwrap(), "Kael");
    }

    #[tokio::test]
    async fn test_unknown_name_is_not_found() {
        let (_store, registry, _id) = registry_with(ResolverConfig::default()).await;
        let err = registry.resolve_to_id("Nobody").await.unwrap_err();
        assert!(matches!(
            err,
            PlugboardError::Resolve(ResolveError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_rename_scenario() {
        // resolve "Kael" -> id; rename; "Kael" -> Renamed(id);
        // "Kael the Brave" -> id.
        let (_store, registry, id) = registry_with(ResolverConfig::default()).await;
        assert_eq!(registry.resolve_to_id("Kael").await.unwrap(), id);

        registry.rename(id, "Kael", "Kael the Brave").await.unwrap();

        assert_eq!(
            registry.resolve_to_id("Kael the Brave").await.unwrap(),
            id
        );
        match registry.resolve_to_id("Kael").await.unwrap_err() {
            PlugboardError::Resolve(ResolveError::Renamed { id: hint, .. }) => {
                assert_eq!(hint, id);
            }
            other => panic!("expected Renamed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tombstone_degrades_to_not_found_after_grace() {
        let config = ResolverConfig::default().with_tombstone_grace(Duration::ZERO);
        let (_store, registry, id) = registry_with(config).await;
        registry.rename(id, "Kael", "Kael the Brave").await.unwrap();

        let err = registry.resolve_to_id("Kael").await.unwrap_err();
        assert!(matches!(
            err,
            PlugboardError::Resolve(ResolveError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_rename_with_stale_old_name_conflicts() {
        let (_store, registry, id) = registry_with(ResolverConfig::default()).await;
        let err = registry
            .rename(id, "Somebody Else", "New Name")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PlugboardError::Resolve(ResolveError::StaleName { .. })
        ));
        // The current mapping is untouched.
        assert_eq!(registry.resolve_to_id("Kael").await.unwrap(), id);
    }

    #[tokio::test]
    async fn test_rename_to_taken_name_conflicts() {
        let (store, registry, id) = registry_with(ResolverConfig::default()).await;
        let other = named("Guinevere");
        let other_id = other.id;
        store.put(other, None).await.unwrap();

        let err = registry.rename(id, "Kael", "Guinevere").await.unwrap_err();
        match err {
            PlugboardError::Resolve(ResolveError::NameTaken { holder, .. }) => {
                assert_eq!(holder, other_id);
            }
            other => panic!("expected NameTaken, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_durable_write_touches_no_tier() {
        let (store, registry, id) = registry_with(ResolverConfig::default()).await;
        assert_eq!(registry.resolve_to_id("Kael").await.unwrap(), id);

        store.set_unavailable(true);
        let err = registry.rename(id, "Kael", "Kael the Brave").await.unwrap_err();
        assert!(matches!(
            err,
            PlugboardError::Store(StoreError::Unavailable { .. })
        ));

        // The old mapping still serves from cache, and no tombstone or
        // optimistic new entry exists.
        assert_eq!(registry.resolve_to_id("Kael").await.unwrap(), id);
        assert_eq!(registry.stats().tombstones, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_renames_of_same_id_serialize() {
        let (_store, registry, id) = registry_with(ResolverConfig::default()).await;
        let registry = Arc::new(registry);

        let a = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.rename(id, "Kael", "Kael A").await })
        };
        let b = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.rename(id, "Kael", "Kael B").await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1, "exactly one rename wins: {results:?}");
        let loser = results.iter().find(|r| r.is_err()).unwrap();
        assert!(matches!(
            loser,
            Err(PlugboardError::Resolve(ResolveError::StaleName { .. }))
        ));
    }

    #[tokio::test]
    async fn test_batch_resolve_mixed() {
        let (store, registry, id) = registry_with(ResolverConfig::default()).await;
        let other = named("Guinevere");
        let other_id = other.id;
        store.put(other, None).await.unwrap();
        registry.rename(id, "Kael", "Kael the Brave").await.unwrap();

        let items = vec![
            NameOrId::Name("Kael the Brave".into()),
            NameOrId::Name("Kael".into()),
            NameOrId::Name("Nobody".into()),
            NameOrId::Id(other_id),
            NameOrId::Id(Uuid::now_v7()),
        ];
        let outcomes = registry.batch_resolve(&items).await.unwrap();

        assert_eq!(outcomes[&items[0]], ResolveOutcome::Found(id));
        assert_eq!(outcomes[&items[1]], ResolveOutcome::Renamed(id));
        assert_eq!(outcomes[&items[2]], ResolveOutcome::NotFound);
        assert_eq!(outcomes[&items[3]], ResolveOutcome::Found(other_id));
        assert_eq!(outcomes[&items[4]], ResolveOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_handle_change_is_idempotent() {
        let (_store, registry, id) = registry_with(ResolverConfig::default()).await;
        assert_eq!(registry.resolve_to_id("Kael").await.unwrap(), id);

        let change = Change {
            sequence: 7,
            kind: ChangeKind::Update,
            id,
            changed_attributes: vec![attrs::NAME.to_string()],
        };
        registry.handle_change(&change);
        let stats_once = registry.stats();
        registry.handle_change(&change);
        let stats_twice = registry.stats();

        assert_eq!(stats_once.l1_entries, stats_twice.l1_entries);
        assert_eq!(stats_once.l2_entries, stats_twice.l2_entries);
        // The next resolve repopulates from the store.
        assert_eq!(registry.resolve_to_id("Kael").await.unwrap(), id);
    }

    #[tokio::test]
    async fn test_delete_change_evicts_mapping() {
        let (store, registry, id) = registry_with(ResolverConfig::default()).await;
        assert_eq!(registry.resolve_to_id("Kael").await.unwrap(), id);

        store.delete(id, None).await.unwrap();
        registry.handle_change(&Change {
            sequence: 2,
            kind: ChangeKind::Delete,
            id,
            changed_attributes: vec![attrs::NAME.to_string()],
        });

        let err = registry.resolve_to_id("Kael").await.unwrap_err();
        assert!(matches!(
            err,
            PlugboardError::Resolve(ResolveError::NotFound { .. })
        ));
    }
}
