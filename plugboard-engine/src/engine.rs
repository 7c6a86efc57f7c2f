//! The engine facade.

use plugboard_advisor::{IndexAdvisor, QueryShape, ReconcileReport};
use plugboard_cache::{CacheManager, CacheManagerStats, InvalidationStream, SharedTier};
use plugboard_core::{
    attrs, hash_key_material, AttributeKey, EngineConfig, Entity, EntityId, Filter,
    PlugboardResult, TagGraph, Version,
};
use plugboard_resolve::{NameOrId, ResolutionRegistry, ResolverStats};
use plugboard_store::{EntityStore, StoreStatistics};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Aggregated engine statistics.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub cache: CacheManagerStats,
    pub resolver: ResolverStats,
    pub store: StoreStatistics,
}

/// The pluggable-entity resolution and caching engine.
///
/// Holds the resolution registry, cache manager, and index advisor over a
/// single entity store. Handles are cheap to share: wrap the engine in an
/// `Arc` and clone it into every caller rather than treating it as a
/// global singleton.
pub struct Engine {
    store: Arc<dyn EntityStore>,
    cache: Arc<CacheManager>,
    registry: Arc<ResolutionRegistry>,
    advisor: Arc<IndexAdvisor>,
    /// Tag parent edges, mirrored from the store so cycle checks need no
    /// store round trip. Held across the durable write for entities with
    /// parent edges so concurrent tag writes cannot race past the check.
    tags: tokio::sync::Mutex<TagGraph>,
    config: EngineConfig,
}

impl Engine {
    /// Build an engine with no shared cache tier.
    pub fn new(store: Arc<dyn EntityStore>, config: EngineConfig) -> Self {
        let cache = Arc::new(CacheManager::new(Arc::clone(&store), config.cache.clone()));
        Self::assemble(store, cache, config)
    }

    /// Build an engine with a shared L2 cache tier.
    pub fn with_shared_tier(
        store: Arc<dyn EntityStore>,
        l2: Arc<dyn SharedTier>,
        config: EngineConfig,
    ) -> Self {
        let cache = Arc::new(CacheManager::with_shared_tier(
            Arc::clone(&store),
            l2,
            config.cache.clone(),
        ));
        Self::assemble(store, cache, config)
    }

    fn assemble(store: Arc<dyn EntityStore>, cache: Arc<CacheManager>, config: EngineConfig) -> Self {
        let registry = Arc::new(ResolutionRegistry::new(
            Arc::clone(&store),
            config.resolver.clone(),
        ));
        let advisor = Arc::new(IndexAdvisor::new(config.advisor.clone()));
        Self {
            store,
            cache,
            registry,
            advisor,
            tags: tokio::sync::Mutex::new(TagGraph::new()),
            config,
        }
    }

    /// The underlying store handle.
    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    /// The cache manager, for `get_or_compute` on caller-derived values.
    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// The resolution registry.
    pub fn registry(&self) -> &Arc<ResolutionRegistry> {
        &self.registry
    }

    /// The index advisor.
    pub fn advisor(&self) -> &Arc<IndexAdvisor> {
        &self.advisor
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn tags(&self) -> &tokio::sync::Mutex<TagGraph> {
        &self.tags
    }

    /// Rebuild the tag-graph mirror from the store. Call once on startup;
    /// afterwards the watch pump keeps it current.
    pub async fn bootstrap(&self) -> PlugboardResult<()> {
        let filter = Filter::new().and(plugboard_core::FilterExpr::has_attribute(attrs::PARENT));
        let scan = self.store.query(filter).await?;
        let entities = scan.collect_all().await?;
        let mut tags = self.tags.lock().await;
        for entity in entities {
            // The store is the source of truth; edges already durable are
            // mirrored even if a concurrent writer slipped an odd shape in.
            if let Err(error) = tags.set_parents(entity.id, &entity.parent_ids()) {
                warn!(id = %entity.id, %error, "skipping non-acyclic parent edges");
            }
        }
        Ok(())
    }

    /// Resolve a name or id to a canonical id.
    pub async fn resolve(&self, item: &NameOrId) -> PlugboardResult<EntityId> {
        match item {
            NameOrId::Name(name) => self.registry.resolve_to_id(name).await,
            // Ids are already canonical; existence is checked at read time.
            NameOrId::Id(id) => Ok(*id),
        }
    }

    /// Read an entity through the cache tiers.
    pub async fn read_entity(&self, id: EntityId) -> PlugboardResult<Entity> {
        self.cache.get_entity(id).await
    }

    /// Write an entity with optimistic concurrency.
    ///
    /// Order of operations: tag-cycle validation, durable write, then
    /// cache invalidation and registry bookkeeping. A failed write leaves
    /// no cache state behind, and an acknowledged write is already
    /// invisible to stale reads on this path (read-your-writes).
    pub async fn write_entity(
        &self,
        mut entity: Entity,
        expected_version: Option<Version>,
    ) -> PlugboardResult<Version> {
        let prior = self.store.get(entity.id).await?;
        let changed = match &prior {
            Some(prior_entity) => entity.changed_attributes(prior_entity),
            None => entity.attributes.keys().cloned().collect(),
        };

        let parents = entity.parent_ids();
        let touches_tags =
            !parents.is_empty() || prior.as_ref().is_some_and(|p| !p.parent_ids().is_empty());

        let version = if touches_tags {
            let mut tags = self.tags.lock().await;
            tags.check_parents(entity.id, &parents)?;
            let version = self.store.put(entity.clone(), expected_version).await?;
            if let Err(error) = tags.set_parents(entity.id, &parents) {
                // Unreachable after check_parents under the same lock.
                warn!(id = %entity.id, %error, "tag graph update rejected");
            }
            version
        } else {
            self.store.put(entity.clone(), expected_version).await?
        };
        entity.version = version;

        self.cache.apply_write(&entity, &changed).await;
        for attribute in &changed {
            self.invalidate_query_results(attribute).await;
        }

        let old_name = prior.as_ref().and_then(|p| p.name()).map(str::to_string);
        let new_name = entity.name().map(str::to_string);
        if old_name != new_name {
            self.registry
                .note_rename(entity.id, old_name.as_deref(), new_name.as_deref(), version);
        } else if prior.is_none() {
            self.registry.note_insert(&entity);
        }

        Ok(version)
    }

    /// Delete an entity with optimistic concurrency.
    pub async fn delete_entity(
        &self,
        id: EntityId,
        expected_version: Option<Version>,
    ) -> PlugboardResult<()> {
        let prior = self.store.get(id).await?;
        self.store.delete(id, expected_version).await?;

        self.cache.apply_delete(id).await;
        if let Some(prior) = prior {
            for attribute in prior.attributes.keys() {
                self.invalidate_query_results(attribute).await;
            }
        }
        self.registry.note_delete(id);
        self.tags.lock().await.remove(id);
        Ok(())
    }

    /// Cached query-result entries depend on their filter fields across
    /// all entities, modeled as attribute keys on the nil id. A write to
    /// any entity's `attr` drops every cached result filtered by `attr`.
    pub(crate) async fn invalidate_query_results(&self, attribute: &str) {
        self.cache.invalidate(Uuid::nil(), attribute).await;
    }

    /// Run a filtered query.
    ///
    /// The matching id set is served through the cache manager, keyed by
    /// the filter's content hash; entities are then materialized per id
    /// through the tiers (all-or-nothing per id). The query's shape and
    /// selectivity are reported to the index advisor as a side effect.
    pub async fn query(&self, filter: &Filter) -> PlugboardResult<Vec<Entity>> {
        let shape = QueryShape::of(filter);
        self.advisor.record_query_shape(shape.clone());

        let key = query_cache_key(filter);
        let dependencies: Vec<AttributeKey> = filter
            .fields()
            .into_iter()
            .map(|field| AttributeKey::new(Uuid::nil(), field))
            .collect();

        let ids: Vec<EntityId> = self
            .cache
            .get_or_compute(&key, dependencies, || async {
                let scanned = self.store.statistics().await?.entity_count;
                let scan = self.store.query(filter.clone()).await?;
                let matches = scan.collect_all().await?;
                for field in shape.fields() {
                    self.advisor
                        .record_field_observation(&field, matches.len() as u64, scanned);
                }
                Ok(matches.into_iter().map(|e| e.id).collect())
            })
            .await?;

        let mut entities = Vec::with_capacity(ids.len());
        for id in ids {
            match self.cache.get_entity(id).await {
                Ok(entity) => entities.push(entity),
                // Deleted since the id set was cached; the deletion's own
                // invalidation will drop the cached set.
                Err(plugboard_core::PlugboardError::Store(
                    plugboard_core::StoreError::NotFound { .. },
                )) => continue,
                Err(other) => return Err(other),
            }
        }
        Ok(entities)
    }

    /// Live invalidation feed for one entity.
    pub fn subscribe_invalidations(&self, id: EntityId) -> InvalidationStream {
        self.cache.subscribe(id)
    }

    /// Run one advisor reconciliation immediately.
    pub async fn reconcile_now(&self) -> PlugboardResult<ReconcileReport> {
        self.advisor.reconcile(self.store.as_ref()).await
    }

    /// Aggregated statistics.
    pub async fn stats(&self) -> PlugboardResult<EngineStats> {
        Ok(EngineStats {
            cache: self.cache.stats().await,
            resolver: self.registry.stats(),
            store: self.store.statistics().await?,
        })
    }
}

/// Content-hashed cache key for a filter's result set.
fn query_cache_key(filter: &Filter) -> String {
    let serialized = serde_json::to_vec(filter).unwrap_or_default();
    let digest = hash_key_material(&serialized);
    let mut key = String::with_capacity(6 + digest.len() * 2);
    key.push_str("query:");
    for byte in digest {
        key.push_str(&format!("{byte:02x}"));
    }
    key
}
