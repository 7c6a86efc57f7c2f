//! Identity types for plugboard entities

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Entity identifier using UUIDv7 for timestamp-sortable IDs.
/// UUIDv7 embeds a Unix timestamp, making IDs naturally sortable by creation time.
pub type EntityId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Optimistic-concurrency version number, assigned by the store.
/// Starts at 1 on first save and increments on every accepted write.
pub type Version = u64;

/// SHA-256 digest used to fold variable-length cache key material into a
/// fixed-width binary key.
pub type KeyHash = [u8; 32];

/// Generate a new UUIDv7 EntityId (timestamp-sortable).
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}

/// Compute the SHA-256 hash of key material.
pub fn hash_key_material(content: &[u8]) -> KeyHash {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entity_ids_are_unique() {
        let a = new_entity_id();
        let b = new_entity_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_key_material_is_stable() {
        let h1 = hash_key_material(b"query:Tag=U_warrior");
        let h2 = hash_key_material(b"query:Tag=U_warrior");
        assert_eq!(h1, h2);

        let h3 = hash_key_material(b"query:Tag=U_mage");
        assert_ne!(h1, h3);
    }
}
