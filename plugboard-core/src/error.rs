//! Error types for plugboard operations

use crate::entity::AttributeName;
use crate::identity::{EntityId, Version};
use thiserror::Error;

/// Entity store errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("entity not found: {id}")]
    NotFound { id: EntityId },

    #[error("version conflict on {id}: expected {expected:?}, actual {actual}")]
    Conflict {
        id: EntityId,
        expected: Option<Version>,
        actual: Version,
    },

    #[error("insert failed for {id}: {reason}")]
    InsertFailed { id: EntityId, reason: String },

    #[error("name {name:?} already held by {holder}")]
    DuplicateName { name: String, holder: EntityId },

    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("index error on {index}: {reason}")]
    Index { index: String, reason: String },

    #[error("store lock poisoned")]
    LockPoisoned,
}

/// Resolution registry errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// The name is not, and was not recently, assigned to any entity.
    #[error("no entity named {name:?}")]
    NotFound { name: String },

    /// The name was valid until a recent rename; the entity lives on
    /// under `id`. Degrades to `NotFound` once the tombstone expires.
    #[error("{name:?} was renamed; entity is now {id}")]
    Renamed { name: String, id: EntityId },

    #[error("id not found: {id}")]
    UnknownId { id: EntityId },

    #[error("name {name:?} already held by {holder}")]
    NameTaken { name: String, holder: EntityId },

    /// The caller's idea of the current name is stale.
    #[error("rename conflict on {id}: current name is {current:?}, not {supplied:?}")]
    StaleName {
        id: EntityId,
        current: String,
        supplied: String,
    },
}

/// Cache tier errors. These are recovered internally by falling through to
/// the next tier and are only surfaced in logs and statistics.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache backend error: {reason}")]
    Backend { reason: String },

    #[error("cache serialization error: {reason}")]
    Serialization { reason: String },

    #[error("cache lock poisoned")]
    LockPoisoned,
}

/// Index advisor errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdvisorError {
    #[error("reconcile failed for index {index}: {reason}")]
    ReconcileFailed { index: String, reason: String },
}

/// Validation errors, raised before a write reaches the store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The write would close a cycle in the tag parent graph.
    #[error("cycle detected in tag graph: {ids:?}")]
    CycleDetected { ids: Vec<EntityId> },

    #[error("invalid value for attribute {attribute:?}: {reason}")]
    InvalidAttribute {
        attribute: AttributeName,
        reason: String,
    },
}

/// Master error type for all plugboard operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlugboardError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("advisor error: {0}")]
    Advisor(#[from] AdvisorError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl PlugboardError {
    /// Whether the caller can recover by re-reading and retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PlugboardError::Store(StoreError::Conflict { .. }))
    }
}

/// Result type alias for plugboard operations.
pub type PlugboardResult<T> = Result<T, PlugboardError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::NotFound { id: Uuid::nil() };
        assert!(format!("{err}").contains("entity not found"));

        let err = StoreError::Conflict {
            id: Uuid::nil(),
            expected: Some(3),
            actual: 4,
        };
        let msg = format!("{err}");
        assert!(msg.contains("version conflict"));
        assert!(msg.contains("3"));
        assert!(msg.contains("4"));
    }

    #[test]
    fn test_resolve_error_distinguishes_renamed_from_not_found() {
        let not_found = ResolveError::NotFound {
            name: "Kael".into(),
        };
        let renamed = ResolveError::Renamed {
            name: "Kael".into(),
            id: Uuid::nil(),
        };
        assert_ne!(not_found, renamed);
        assert!(format!("{renamed}").contains("renamed"));
    }

    #[test]
    fn test_master_error_from_conversions() {
        let err: PlugboardError = StoreError::LockPoisoned.into();
        assert!(matches!(err, PlugboardError::Store(_)));

        let err: PlugboardError = ValidationError::CycleDetected { ids: vec![] }.into();
        assert!(matches!(err, PlugboardError::Validation(_)));
    }

    #[test]
    fn test_conflict_is_retryable() {
        let conflict: PlugboardError = StoreError::Conflict {
            id: Uuid::nil(),
            expected: None,
            actual: 1,
        }
        .into();
        assert!(conflict.is_retryable());

        let not_found: PlugboardError = StoreError::NotFound { id: Uuid::nil() }.into();
        assert!(!not_found.is_retryable());
    }
}
