//! Plugboard Cache - Multi-Tier Cache Manager
//!
//! Serves entity and derived-value reads through a layered cache with
//! strict coherence rules:
//!
//! - **L1** is a bounded in-process map with volatility-aware TTLs.
//! - **L2** is a pluggable shared tier (in-memory or LMDB) so a fleet of
//!   processes shares fall-through work. L2 failures are recovered by
//!   falling through, never surfaced.
//! - **L3** is the entity store itself, the only suspension point.
//!
//! Invalidation is dependency-driven, not key-driven: every derived entry
//! records the `(entity, attribute)` pairs it was computed from, and a
//! write to a pair evicts exactly its dependents via a bounded, sharded
//! reverse index. A stampede guard keeps concurrent misses on one key down
//! to a single compute.

mod deps;
mod key;
mod l1;
mod lmdb_l2;
mod manager;
mod memory_l2;
mod stampede;
mod traits;

pub use key::CacheKey;
pub use lmdb_l2::LmdbTier;
pub use manager::{CacheManager, CacheManagerStats, Invalidation, InvalidationStream, INVALIDATE_ALL};
pub use memory_l2::MemoryTier;
pub use traits::{CacheStats, SharedTier, TierRecord};
