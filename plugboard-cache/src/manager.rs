//! The cache manager.
//!
//! Read path: L1 -> L2 -> store, populating bottom-up on the way back.
//! Write path: the store accepts first, then dependents are invalidated
//! and the fresh entity is repopulated, so the writer always reads its own
//! write while other readers may briefly see the pre-write value
//! (read-your-writes, not linearizable).

use crate::deps::DependencyIndex;
use crate::key::CacheKey;
use crate::l1::{L1Cache, Payload};
use crate::stampede::{FlightSlot, StampedeGuard};
use crate::traits::{CacheStats, SharedTier, TierRecord};
use chrono::Utc;
use plugboard_core::{
    AttributeKey, AttributeName, CacheConfig, Entity, EntityId, PlugboardResult, StoreError,
};
use plugboard_store::EntityStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const INVALIDATION_BUFFER: usize = 1024;

/// Attribute name broadcast when every attribute of an entity must be
/// considered invalid (whole-entity invalidation, or subscriber lag).
pub const INVALIDATE_ALL: &str = "*";

/// One invalidation event, as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    pub entity_id: EntityId,
    pub attribute: AttributeName,
}

/// Aggregated cache statistics.
#[derive(Debug, Clone)]
pub struct CacheManagerStats {
    pub l1: CacheStats,
    pub l2: Option<CacheStats>,
    pub tracked_dependencies: usize,
}

/// Multi-tier read-through/write-through cache for entities, derived
/// values, and query results.
pub struct CacheManager {
    store: Arc<dyn EntityStore>,
    l1: L1Cache,
    l2: Option<Arc<dyn SharedTier>>,
    deps: DependencyIndex,
    inflight: StampedeGuard,
    config: CacheConfig,
    invalidations: broadcast::Sender<Invalidation>,
    /// Bumped on every invalidation. A load or compute that started
    /// before an invalidation must not populate the tiers afterwards,
    /// or a write acknowledgment could be followed by a stale
    /// repopulation from a racing reader.
    epoch: AtomicU64,
}

impl CacheManager {
    /// Create a manager with no shared tier (L1 over the store).
    pub fn new(store: Arc<dyn EntityStore>, config: CacheConfig) -> Self {
        Self::build(store, None, config)
    }

    /// Create a manager with a shared L2 tier.
    pub fn with_shared_tier(
        store: Arc<dyn EntityStore>,
        l2: Arc<dyn SharedTier>,
        config: CacheConfig,
    ) -> Self {
        Self::build(store, Some(l2), config)
    }

    fn build(
        store: Arc<dyn EntityStore>,
        l2: Option<Arc<dyn SharedTier>>,
        config: CacheConfig,
    ) -> Self {
        let (invalidations, _) = broadcast::channel(INVALIDATION_BUFFER);
        Self {
            store,
            l1: L1Cache::new(config.l1_capacity),
            l2,
            deps: DependencyIndex::new(config.dependency_shards, config.dependency_capacity),
            inflight: StampedeGuard::new(),
            config,
            invalidations,
            epoch: AtomicU64::new(0),
        }
    }

    /// TTL for a whole-entity entry: short if any attribute is volatile.
    fn entity_ttl(&self, entity: &Entity) -> Duration {
        if entity
            .attributes
            .keys()
            .any(|name| self.config.is_volatile(name))
        {
            self.config.l1_volatile_ttl
        } else {
            self.config.l1_ttl
        }
    }

    /// TTL for a derived entry: short if any dependency is volatile.
    fn deps_ttl(&self, dependencies: &[AttributeKey]) -> Duration {
        if dependencies
            .iter()
            .any(|dep| self.config.is_volatile(&dep.attribute))
        {
            self.config.l1_volatile_ttl
        } else {
            self.config.l1_ttl
        }
    }

    // L2 access never surfaces errors: a broken shared tier is a latency
    // problem, not a correctness problem.

    async fn l2_get(&self, key: &CacheKey) -> Option<TierRecord> {
        let l2 = self.l2.as_ref()?;
        match l2.get(key).await {
            Ok(record) => record.filter(|r| {
                match (Utc::now() - r.cached_at).to_std() {
                    Ok(age) => age <= self.config.l2_ttl,
                    Err(_) => true,
                }
            }),
            Err(error) => {
                warn!(%key, %error, "shared tier read failed, falling through");
                None
            }
        }
    }

    async fn l2_put(&self, key: &CacheKey, payload: &[u8]) {
        if let Some(l2) = self.l2.as_ref() {
            if let Err(error) = l2.put(key, payload, Utc::now()).await {
                warn!(%key, %error, "shared tier write failed");
            }
        }
    }

    async fn l2_remove(&self, key: &CacheKey) {
        if let Some(l2) = self.l2.as_ref() {
            if let Err(error) = l2.remove(key).await {
                warn!(%key, %error, "shared tier removal failed");
            }
        }
    }

    /// Drop a key from every tier.
    async fn drop_key(&self, key: &CacheKey) {
        self.l1.remove(key);
        self.l2_remove(key).await;
    }

    /// Read an entity through the tiers, falling through to the store.
    ///
    /// Reads are all-or-nothing per id: the caller gets the full entity or
    /// `StoreError::NotFound`, never a partial attribute set.
    pub async fn get_entity(&self, id: EntityId) -> PlugboardResult<Entity> {
        let key = CacheKey::Entity(id);
        let deadline = Instant::now() + self.config.stampede_timeout;
        loop {
            if let Some(Payload::Entity(entity)) = self.l1.get(&key) {
                return Ok(entity);
            }
            if let Some(record) = self.l2_get(&key).await {
                match serde_json::from_slice::<Entity>(&record.payload) {
                    Ok(entity) => {
                        let ttl = self.entity_ttl(&entity);
                        self.l1
                            .insert(key.clone(), Payload::Entity(entity.clone()), ttl);
                        return Ok(entity);
                    }
                    Err(error) => {
                        warn!(%key, %error, "corrupt shared-tier record dropped");
                        self.l2_remove(&key).await;
                    }
                }
            }
            match self.inflight.begin(&key) {
                FlightSlot::Owner(_guard) => {
                    return self.load_entity(id).await;
                }
                FlightSlot::Waiter(notify) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        // De-duplication is best-effort: stop waiting and
                        // compute ourselves.
                        return self.load_entity(id).await;
                    }
                    let _ = tokio::time::timeout(remaining, notify.notified()).await;
                }
            }
        }
    }

    /// L3 fall-through: fetch from the store and populate tiers bottom-up.
    /// The fetched value is only cached if no invalidation landed while
    /// the fetch was in flight.
    async fn load_entity(&self, id: EntityId) -> PlugboardResult<Entity> {
        let started = self.epoch.load(Ordering::SeqCst);
        match self.store.get(id).await? {
            Some(entity) => {
                if self.epoch.load(Ordering::SeqCst) == started {
                    self.populate_entity(&entity).await;
                }
                Ok(entity)
            }
            None => Err(StoreError::NotFound { id }.into()),
        }
    }

    async fn populate_entity(&self, entity: &Entity) {
        let key = CacheKey::Entity(entity.id);
        match serde_json::to_vec(entity) {
            Ok(bytes) => self.l2_put(&key, &bytes).await,
            Err(error) => warn!(%key, %error, "entity serialization failed"),
        }
        self.l1
            .insert(key, Payload::Entity(entity.clone()), self.entity_ttl(entity));
    }

    /// Get a derived value, computing it on miss.
    ///
    /// `dependencies` are the exact attribute keys the computation reads;
    /// the value is evicted when any of them changes. At most one caller
    /// computes a given key concurrently; peers wait up to the configured
    /// stampede timeout, then compute themselves.
    pub async fn get_or_compute<V, F, Fut>(
        &self,
        key: &str,
        dependencies: Vec<AttributeKey>,
        compute: F,
    ) -> PlugboardResult<V>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = PlugboardResult<V>>,
    {
        let cache_key = CacheKey::derived(key);
        let ttl = self.deps_ttl(&dependencies);
        let deadline = Instant::now() + self.config.stampede_timeout;
        loop {
            if let Some(Payload::Json(tree)) = self.l1.get(&cache_key) {
                match serde_json::from_value::<V>(tree) {
                    Ok(value) => return Ok(value),
                    Err(_) => {
                        // The key is being reused with a different value
                        // type; treat as a miss.
                        self.l1.remove(&cache_key);
                    }
                }
            }
            if let Some(record) = self.l2_get(&cache_key).await {
                match serde_json::from_slice::<V>(&record.payload) {
                    Ok(value) => {
                        if let Ok(tree) = serde_json::to_value(&value) {
                            self.l1.insert(cache_key.clone(), Payload::Json(tree), ttl);
                        }
                        return Ok(value);
                    }
                    Err(_) => self.l2_remove(&cache_key).await,
                }
            }
            match self.inflight.begin(&cache_key) {
                FlightSlot::Owner(_guard) => {
                    let started = self.epoch.load(Ordering::SeqCst);
                    let value = compute().await?;
                    self.store_derived(&cache_key, &dependencies, &value, ttl, started)
                        .await;
                    return Ok(value);
                }
                FlightSlot::Waiter(notify) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        let started = self.epoch.load(Ordering::SeqCst);
                        let value = compute().await?;
                        self.store_derived(&cache_key, &dependencies, &value, ttl, started)
                            .await;
                        return Ok(value);
                    }
                    let _ = tokio::time::timeout(remaining, notify.notified()).await;
                }
            }
        }
    }

    async fn store_derived<V: Serialize>(
        &self,
        cache_key: &CacheKey,
        dependencies: &[AttributeKey],
        value: &V,
        ttl: Duration,
        started_epoch: u64,
    ) {
        // An invalidation landed mid-compute: the value may already be
        // stale, so hand it to the caller uncached.
        if self.epoch.load(Ordering::SeqCst) != started_epoch {
            return;
        }
        let mut orphaned = Vec::new();
        for dependency in dependencies {
            orphaned.extend(self.deps.record(dependency, cache_key));
        }
        match serde_json::to_value(value) {
            Ok(tree) => {
                match serde_json::to_vec(value) {
                    Ok(bytes) => self.l2_put(cache_key, &bytes).await,
                    Err(error) => warn!(key = %cache_key, %error, "derived serialization failed"),
                }
                self.l1.insert(cache_key.clone(), Payload::Json(tree), ttl);
            }
            Err(error) => warn!(key = %cache_key, %error, "derived serialization failed"),
        }
        // Dependency entries evicted by the bounded reverse index orphan
        // their dependents; drop those values so nothing outlives the
        // attributes it was computed from.
        for key in orphaned {
            self.drop_key(&key).await;
        }
    }

    /// Warm the tiers with an entity known fresh (post-write population).
    pub async fn put_entity(&self, entity: &Entity) {
        self.populate_entity(entity).await;
    }

    /// Invalidate one attribute: drops the whole-entity entry and every
    /// derived entry depending on `(entity_id, attribute)`. Idempotent.
    pub async fn invalidate(&self, entity_id: EntityId, attribute: &str) {
        debug!(%entity_id, attribute, "invalidate");
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.drop_key(&CacheKey::Entity(entity_id)).await;
        let dependency = AttributeKey::new(entity_id, attribute);
        for key in self.deps.take_dependents(&dependency) {
            self.drop_key(&key).await;
        }
        let _ = self.invalidations.send(Invalidation {
            entity_id,
            attribute: attribute.to_string(),
        });
    }

    /// Invalidate every attribute of an entity.
    pub async fn invalidate_all(&self, entity_id: EntityId) {
        debug!(%entity_id, "invalidate all");
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.drop_key(&CacheKey::Entity(entity_id)).await;
        for key in self.deps.take_dependents_of_entity(entity_id) {
            self.drop_key(&key).await;
        }
        let _ = self.invalidations.send(Invalidation {
            entity_id,
            attribute: INVALIDATE_ALL.to_string(),
        });
    }

    /// Write-through invalidation: the store has already acknowledged the
    /// write; evict dependents of the changed attributes, then repopulate
    /// the entity so the writer reads its own write.
    pub async fn apply_write(&self, entity: &Entity, changed_attributes: &[AttributeName]) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        for attribute in changed_attributes {
            let dependency = AttributeKey::new(entity.id, attribute.clone());
            for key in self.deps.take_dependents(&dependency) {
                self.drop_key(&key).await;
            }
        }
        // The acknowledged entity itself is fresh by definition.
        self.populate_entity(entity).await;
        for attribute in changed_attributes {
            let _ = self.invalidations.send(Invalidation {
                entity_id: entity.id,
                attribute: attribute.clone(),
            });
        }
    }

    /// Invalidation for a deleted entity.
    pub async fn apply_delete(&self, entity_id: EntityId) {
        self.invalidate_all(entity_id).await;
    }

    /// Live invalidation feed for one entity, for collaborators that want
    /// change notifications without polling.
    pub fn subscribe(&self, entity_id: EntityId) -> InvalidationStream {
        InvalidationStream {
            entity_id,
            rx: self.invalidations.subscribe(),
        }
    }

    /// Drop everything, in every tier. Used when the watch stream lags and
    /// cached state can no longer be trusted.
    pub async fn clear(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.l1.clear();
        self.deps.clear();
        if let Some(l2) = self.l2.as_ref() {
            if let Err(error) = l2.clear().await {
                warn!(%error, "shared tier clear failed");
            }
        }
    }

    /// Usage statistics across tiers.
    pub async fn stats(&self) -> CacheManagerStats {
        let l2 = match self.l2.as_ref() {
            Some(l2) => l2.stats().await.ok(),
            None => None,
        };
        CacheManagerStats {
            l1: self.l1.stats(),
            l2,
            tracked_dependencies: self.deps.tracked(),
        }
    }
}

/// Per-entity invalidation subscription.
pub struct InvalidationStream {
    entity_id: EntityId,
    rx: broadcast::Receiver<Invalidation>,
}

impl InvalidationStream {
    /// Next invalidated attribute for the subscribed entity. Yields
    /// [`INVALIDATE_ALL`] when events were missed (treat all attributes as
    /// changed). `None` once the manager is gone.
    pub async fn next(&mut self) -> Option<AttributeName> {
        loop {
            match self.rx.recv().await {
                Ok(invalidation) if invalidation.entity_id == self.entity_id => {
                    return Some(invalidation.attribute);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    return Some(INVALIDATE_ALL.to_string());
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
