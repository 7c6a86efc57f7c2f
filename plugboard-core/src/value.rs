//! The attribute value union.
//!
//! Plugboard is schemaless: an attribute's value is one of a small set of
//! shapes rather than an instance of a declared type. The union is explicit
//! (no reflection, no dynamic typing) so that every consumer can match on
//! exactly the cases that exist.

use crate::identity::EntityId;
use serde::{Deserialize, Serialize};

/// A single scalar value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    /// UTF-8 text.
    Text(String),
    /// Numeric value. Schemaless stores take JSON numbers, so this is f64;
    /// NaN never matches any filter.
    Number(f64),
    /// Boolean value.
    Bool(bool),
}

impl Scalar {
    /// Get the text content, if this is a text scalar.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get the numeric content, if this is a number scalar.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Get the boolean content, if this is a bool scalar.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Text(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Text(s)
    }
}

impl From<f64> for Scalar {
    fn from(n: f64) -> Self {
        Scalar::Number(n)
    }
}

impl From<i64> for Scalar {
    fn from(n: i64) -> Self {
        Scalar::Number(n as f64)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

/// An attribute value: a scalar, an ordered list of scalars, or a reference
/// to another entity (resolved lazily by the caller).
///
/// Reference lists get their own arm rather than widening `Scalar`: the
/// `Tag` convention stores lists of entity references, and keeping
/// references out of `Scalar` preserves the "references are resolved
/// lazily" typing for every list consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// A single scalar.
    Scalar(Scalar),
    /// An ordered list of scalars.
    List(Vec<Scalar>),
    /// A reference to another entity by id.
    Reference(EntityId),
    /// An ordered list of entity references.
    ReferenceList(Vec<EntityId>),
}

impl Value {
    /// Build a text scalar value.
    pub fn text(s: impl Into<String>) -> Self {
        Value::Scalar(Scalar::Text(s.into()))
    }

    /// Build a number scalar value.
    pub fn number(n: f64) -> Self {
        Value::Scalar(Scalar::Number(n))
    }

    /// Build a boolean scalar value.
    pub fn boolean(b: bool) -> Self {
        Value::Scalar(Scalar::Bool(b))
    }

    /// Build a reference value.
    pub fn reference(id: EntityId) -> Self {
        Value::Reference(id)
    }

    /// Build a reference-list value.
    pub fn references(ids: impl IntoIterator<Item = EntityId>) -> Self {
        Value::ReferenceList(ids.into_iter().collect())
    }

    /// Build a list-of-scalars value.
    pub fn list(items: impl IntoIterator<Item = Scalar>) -> Self {
        Value::List(items.into_iter().collect())
    }

    /// Get the scalar, if this is a single scalar.
    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Value::Scalar(s) => Some(s),
            _ => None,
        }
    }

    /// Get the text content, if this is a text scalar.
    pub fn as_text(&self) -> Option<&str> {
        self.as_scalar().and_then(Scalar::as_text)
    }

    /// Get the numeric content, if this is a number scalar.
    pub fn as_number(&self) -> Option<f64> {
        self.as_scalar().and_then(Scalar::as_number)
    }

    /// Get the boolean content, if this is a bool scalar.
    pub fn as_bool(&self) -> Option<bool> {
        self.as_scalar().and_then(Scalar::as_bool)
    }

    /// Every entity id this value refers to. Empty for scalar shapes.
    pub fn referenced_ids(&self) -> Vec<EntityId> {
        match self {
            Value::Reference(id) => vec![*id],
            Value::ReferenceList(ids) => ids.clone(),
            _ => Vec::new(),
        }
    }
}
