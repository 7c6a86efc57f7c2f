//! The entity record and attribute addressing.
//!
//! An entity is a stable id plus an open-ended attribute map. Components
//! depend on "does this entity have attribute X" rather than a nominal
//! type; the predicates here are the whole capability contract.

use crate::identity::{EntityId, Version};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Attribute names are free-form strings; conventions live in [`attrs`].
pub type AttributeName = String;

/// Well-known attribute names. These are conventions, not schema: nothing
/// in the engine requires an entity to carry any of them.
pub mod attrs {
    /// Human-assigned name, the resolution registry's lookup key.
    pub const NAME: &str = "Name";
    /// List of references to tag entities.
    pub const TAG: &str = "Tag";
    /// List of references to parent tags (tag DAG edges).
    pub const PARENT: &str = "Parent";
}

/// A schemaless entity: a stable id and a bag of named attributes.
///
/// `id` is immutable for the entity's lifetime and never reused, even after
/// deletion. `version` is assigned by the store (0 before first save).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identifier, assigned once at creation.
    pub id: EntityId,
    /// Store-assigned optimistic concurrency version.
    pub version: Version,
    /// The attribute bag. BTreeMap keeps iteration deterministic.
    pub attributes: BTreeMap<AttributeName, Value>,
}

impl Entity {
    /// Create a new, unsaved entity with the given id.
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            version: 0,
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style attribute insertion.
    pub fn with_attribute(mut self, name: impl Into<AttributeName>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Capability predicate: does this entity carry the attribute?
    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    /// Get an attribute value.
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Set an attribute, returning the prior value if any.
    pub fn set_attribute(&mut self, name: impl Into<AttributeName>, value: Value) -> Option<Value> {
        self.attributes.insert(name.into(), value)
    }

    /// Remove an attribute, returning the prior value if any.
    pub fn remove_attribute(&mut self, name: &str) -> Option<Value> {
        self.attributes.remove(name)
    }

    /// The entity's human-assigned name, if it has one.
    pub fn name(&self) -> Option<&str> {
        self.attribute(attrs::NAME).and_then(Value::as_text)
    }

    /// Ids referenced from the `Tag` attribute.
    pub fn tag_ids(&self) -> Vec<EntityId> {
        self.attribute(attrs::TAG)
            .map(Value::referenced_ids)
            .unwrap_or_default()
    }

    /// Ids referenced from the `Parent` attribute (tag DAG edges).
    pub fn parent_ids(&self) -> Vec<EntityId> {
        self.attribute(attrs::PARENT)
            .map(Value::referenced_ids)
            .unwrap_or_default()
    }

    /// Attribute names whose values differ between `self` and `other`,
    /// including names present on only one side.
    pub fn changed_attributes(&self, other: &Entity) -> Vec<AttributeName> {
        let mut changed = Vec::new();
        for (name, value) in &self.attributes {
            if other.attributes.get(name) != Some(value) {
                changed.push(name.clone());
            }
        }
        for name in other.attributes.keys() {
            if !self.attributes.contains_key(name) {
                changed.push(name.clone());
            }
        }
        changed.sort();
        changed.dedup();
        changed
    }
}

/// Separator byte between the entity id and the attribute name in the
/// binary encoding. Never occurs in UTF-8, so decoding is unambiguous.
const SEPARATOR: u8 = 0xFF;

/// Address of one attribute on one entity.
///
/// This is the unit of dependency tracking: cache entries record the exact
/// `AttributeKey`s they were computed from, and writes invalidate by
/// `AttributeKey`. The binary encoding is used as a shared-tier key prefix
/// and in the reverse dependency index.
///
/// # Binary format
///
/// - Bytes 0-15: entity id (UUID bytes)
/// - Byte 16: separator (0xFF)
/// - Bytes 17..: attribute name (UTF-8)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributeKey {
    /// The entity the attribute lives on.
    pub entity_id: EntityId,
    /// The attribute name.
    pub attribute: AttributeName,
}

impl AttributeKey {
    /// Create a new attribute key.
    pub fn new(entity_id: EntityId, attribute: impl Into<AttributeName>) -> Self {
        Self {
            entity_id,
            attribute: attribute.into(),
        }
    }

    /// Encode to bytes: `[entity_id: 16][separator: 1][attribute: utf-8]`.
    pub fn encode(&self) -> Vec<u8> {
        let name = self.attribute.as_bytes();
        let mut bytes = Vec::with_capacity(17 + name.len());
        bytes.extend_from_slice(self.entity_id.as_bytes());
        bytes.push(SEPARATOR);
        bytes.extend_from_slice(name);
        bytes
    }

    /// Decode from bytes produced by [`encode`](Self::encode).
    ///
    /// Returns `None` if the slice is too short, the separator is missing,
    /// or the name is not valid UTF-8.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 17 || bytes[16] != SEPARATOR {
            return None;
        }
        let entity_id = uuid::Uuid::from_slice(&bytes[0..16]).ok()?;
        let attribute = std::str::from_utf8(&bytes[17..]).ok()?.to_string();
        Some(Self {
            entity_id,
            attribute,
        })
    }

    /// Prefix matching every attribute key of one entity.
    pub fn entity_prefix(entity_id: EntityId) -> [u8; 17] {
        let mut prefix = [0u8; 17];
        prefix[0..16].copy_from_slice(entity_id.as_bytes());
        prefix[16] = SEPARATOR;
        prefix
    }
}

impl std::fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entity_id, self.attribute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_entity_attribute_roundtrip() {
        let mut entity = Entity::new(Uuid::now_v7())
            .with_attribute(attrs::NAME, Value::text("Kael"))
            .with_attribute("Health", Value::number(100.0));

        assert!(entity.has_attribute("Health"));
        assert_eq!(entity.name(), Some("Kael"));
        assert_eq!(
            entity.attribute("Health").and_then(Value::as_number),
            Some(100.0)
        );

        let prior = entity.set_attribute("Health", Value::number(80.0));
        assert_eq!(prior, Some(Value::number(100.0)));
        assert_eq!(entity.remove_attribute("Health"), Some(Value::number(80.0)));
        assert!(!entity.has_attribute("Health"));
    }

    #[test]
    fn test_tag_and_parent_ids() {
        let tag = Uuid::now_v7();
        let parent = Uuid::now_v7();
        let entity = Entity::new(Uuid::now_v7())
            .with_attribute(attrs::TAG, Value::references([tag]))
            .with_attribute(attrs::PARENT, Value::references([parent]));

        assert_eq!(entity.tag_ids(), vec![tag]);
        assert_eq!(entity.parent_ids(), vec![parent]);
        assert!(Entity::new(Uuid::now_v7()).tag_ids().is_empty());
    }

    #[test]
    fn test_changed_attributes() {
        let id = Uuid::now_v7();
        let before = Entity::new(id)
            .with_attribute("Name", Value::text("Kael"))
            .with_attribute("Health", Value::number(100.0));
        let mut after = before.clone();
        after.set_attribute("Health", Value::number(80.0));
        after.set_attribute("Mana", Value::number(50.0));
        after.remove_attribute("Name");

        let changed = after.changed_attributes(&before);
        assert_eq!(changed, vec!["Health", "Mana", "Name"]);
        assert!(before.changed_attributes(&before.clone()).is_empty());
    }

    #[test]
    fn test_attribute_key_roundtrip() {
        let key = AttributeKey::new(Uuid::now_v7(), "Health");
        let encoded = key.encode();
        assert_eq!(encoded[16], 0xFF);
        assert_eq!(AttributeKey::decode(&encoded), Some(key));
    }

    #[test]
    fn test_attribute_key_decode_rejects_garbage() {
        assert!(AttributeKey::decode(&[0u8; 10]).is_none());

        let mut bytes = AttributeKey::new(Uuid::now_v7(), "x").encode();
        bytes[16] = 0x00;
        assert!(AttributeKey::decode(&bytes).is_none());
    }

    #[test]
    fn test_entity_prefix_is_prefix() {
        let id = Uuid::now_v7();
        let key = AttributeKey::new(id, "Health");
        let prefix = AttributeKey::entity_prefix(id);
        assert_eq!(&key.encode()[0..17], &prefix[..]);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn uuid_strategy() -> impl Strategy<Value = uuid::Uuid> {
        any::<[u8; 16]>().prop_map(uuid::Uuid::from_bytes)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        /// Property: encode/decode roundtrip preserves the key.
        #[test]
        fn prop_attribute_key_roundtrip(
            entity_id in uuid_strategy(),
            attribute in "[A-Za-z][A-Za-z0-9_]{0,24}",
        ) {
            let key = AttributeKey::new(entity_id, attribute);
            let decoded = AttributeKey::decode(&key.encode());
            prop_assert_eq!(decoded, Some(key));
        }

        /// Property: different keys encode to different bytes.
        #[test]
        fn prop_attribute_key_encoding_injective(
            id1 in uuid_strategy(),
            id2 in uuid_strategy(),
            attr1 in "[A-Za-z]{1,8}",
            attr2 in "[A-Za-z]{1,8}",
        ) {
            let key1 = AttributeKey::new(id1, attr1);
            let key2 = AttributeKey::new(id2, attr2);
            if key1 == key2 {
                prop_assert_eq!(key1.encode(), key2.encode());
            } else {
                prop_assert_ne!(key1.encode(), key2.encode());
            }
        }

        /// Property: the entity prefix matches the first 17 encoded bytes.
        #[test]
        fn prop_entity_prefix_matches(
            entity_id in uuid_strategy(),
            attribute in "[A-Za-z]{1,16}",
        ) {
            let key = AttributeKey::new(entity_id, attribute);
            let encoded = key.encode();
            let prefix = AttributeKey::entity_prefix(entity_id);
            prop_assert_eq!(&encoded[0..17], &prefix[..]);
        }
    }
}
