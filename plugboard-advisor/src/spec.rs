//! Index specifications.

use chrono::{DateTime, Utc};
use plugboard_core::AttributeName;
use plugboard_store::IndexDefinition;
use serde::{Deserialize, Serialize};

/// Lifecycle state of an index the advisor tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexState {
    /// Recommended, not yet created against the store.
    Proposed,
    /// Created and serving queries.
    Active,
    /// Dropped for staleness.
    Retired,
}

/// A recommended or active secondary index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Indexed fields in final order (equality fields before range fields,
    /// most selective first).
    pub fields: Vec<AttributeName>,
    /// Whether entities lacking the indexed attribute are omitted.
    pub sparse: bool,
    /// Queries served (or observed) against this field set.
    pub usage_count: u64,
    /// Last time a query matched this field set.
    pub last_used_at: DateTime<Utc>,
    /// Lifecycle state.
    pub state: IndexState,
}

impl IndexSpec {
    /// The store-facing name for this index.
    pub fn index_name(&self) -> String {
        format!("idx_{}", self.fields.join("_"))
    }

    /// The store-facing definition.
    pub fn definition(&self) -> IndexDefinition {
        IndexDefinition {
            name: self.index_name(),
            fields: self.fields.clone(),
            sparse: self.sparse,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_name_follows_field_order() {
        let spec = IndexSpec {
            fields: vec!["Tag".into(), "Health".into()],
            sparse: true,
            usage_count: 0,
            last_used_at: Utc::now(),
            state: IndexState::Proposed,
        };
        assert_eq!(spec.index_name(), "idx_Tag_Health");
        let def = spec.definition();
        assert_eq!(def.name, "idx_Tag_Health");
        assert!(def.sparse);
    }
}
