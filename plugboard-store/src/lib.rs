//! Plugboard Store - Entity Store Boundary
//!
//! Defines the durable-store abstraction the rest of the engine consumes:
//! point lookup, optimistic writes, filtered scans, a change-notification
//! stream, and online secondary-index management. The backend's own
//! internals (B-trees, WAL, replication) are out of scope; `MemoryStore`
//! is the reference implementation used in tests and single-process
//! deployments.

pub mod change;
pub mod memory;
pub mod scan;

pub use change::{Change, ChangeKind, ChangeStream, WatchEvent};
pub use memory::MemoryStore;
pub use scan::EntityScan;

use async_trait::async_trait;
use plugboard_core::{Entity, EntityId, Filter, PlugboardResult, Version};
use serde::{Deserialize, Serialize};

/// Definition of a secondary index, as handed to the store.
///
/// The advisor owns recommendation and lifecycle; the store owns the index
/// itself. Index changes must be online: they never block concurrent reads
/// or writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Store-unique index name.
    pub name: String,
    /// Indexed attributes, in order.
    pub fields: Vec<String>,
    /// Sparse indexes omit entities lacking the indexed attribute.
    pub sparse: bool,
}

impl IndexDefinition {
    /// Create a new index definition with the conventional name
    /// `idx_<field>_<field>...`.
    pub fn new(fields: Vec<String>, sparse: bool) -> Self {
        let name = format!("idx_{}", fields.join("_"));
        Self {
            name,
            fields,
            sparse,
        }
    }
}

/// Storage statistics for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct StoreStatistics {
    pub entity_count: u64,
    pub tombstone_count: u64,
    pub index_count: u64,
    pub open_cursors: u64,
}

/// The entity store boundary.
///
/// All methods may suspend; these calls are the engine's only suspension
/// points. `put` and `delete` are optimistic: the caller supplies the
/// version it last read (`None` for creation) and a mismatch fails with
/// [`StoreError::Conflict`](plugboard_core::StoreError::Conflict) rather
/// than silently overwriting a concurrent write.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Point lookup by id. `Ok(None)` for unknown or deleted ids.
    async fn get(&self, id: EntityId) -> PlugboardResult<Option<Entity>>;

    /// Optimistic write. Returns the newly assigned version.
    async fn put(&self, entity: Entity, expected_version: Option<Version>)
        -> PlugboardResult<Version>;

    /// Optimistic delete. The id is never reused; a tombstone is retained
    /// for a grace period so stale references resolve to a clear miss.
    async fn delete(&self, id: EntityId, expected_version: Option<Version>)
        -> PlugboardResult<()>;

    /// Filtered scan. The result is a lazy, finite sequence; dropping it
    /// mid-iteration releases the underlying cursor promptly.
    async fn query(&self, filter: Filter) -> PlugboardResult<EntityScan>;

    /// Subscribe to the change stream: at-least-once delivery, ordered per
    /// id. Consumers must tolerate duplicates (idempotent invalidation).
    fn watch(&self) -> ChangeStream;

    /// Indexed lookup of the entity currently holding `Name == name`.
    /// Returns the id and its current version.
    async fn find_by_name(&self, name: &str) -> PlugboardResult<Option<(EntityId, Version)>>;

    /// Create a secondary index. Idempotent: re-creating an identical
    /// index is a no-op. Must not block concurrent reads.
    async fn create_index(&self, definition: IndexDefinition) -> PlugboardResult<()>;

    /// Drop a secondary index by name. Dropping an unknown index is a
    /// no-op.
    async fn drop_index(&self, name: &str) -> PlugboardResult<()>;

    /// List the currently active secondary indexes.
    async fn list_indexes(&self) -> PlugboardResult<Vec<IndexDefinition>>;

    /// Whether the backend is reachable.
    async fn health_check(&self) -> PlugboardResult<bool>;

    /// Diagnostic counters.
    async fn statistics(&self) -> PlugboardResult<StoreStatistics>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_definition_name_convention() {
        let def = IndexDefinition::new(vec!["Tag".into(), "Health".into()], true);
        assert_eq!(def.name, "idx_Tag_Health");
        assert!(def.sparse);
    }
}
