//! Plugboard Engine - Upstream API Surface
//!
//! Wires the four components together behind the surface collaborators
//! consume: resolve a name or id, read an entity through the cache tiers,
//! write with optimistic concurrency and write-through invalidation, run
//! filtered queries with result caching and index-shape observation, and
//! subscribe to per-entity invalidation feeds.
//!
//! None of the engine's own state is durable: caches, resolution entries
//! and advisor counters all rebuild from the store and its change stream
//! after a restart.

mod engine;
mod pump;

pub use engine::{Engine, EngineStats};

pub use plugboard_advisor::{IndexAdvisor, IndexSpec, IndexState, QueryShape, ReconcileReport};
pub use plugboard_cache::{
    CacheManager, CacheManagerStats, InvalidationStream, LmdbTier, MemoryTier, SharedTier,
    INVALIDATE_ALL,
};
pub use plugboard_core::{
    attrs, AdvisorConfig, AttributeKey, AttributeName, CacheConfig, EngineConfig, Entity, EntityId,
    Filter, FilterExpr, FilterOperator, PlugboardError, PlugboardResult, ResolverConfig, Scalar,
    TagGraph, Value, Version,
};
pub use plugboard_resolve::{NameOrId, ResolutionRegistry, ResolveOutcome};
pub use plugboard_store::{
    Change, ChangeKind, ChangeStream, EntityStore, IndexDefinition, MemoryStore, WatchEvent,
};
