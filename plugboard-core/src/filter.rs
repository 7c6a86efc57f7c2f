//! Filter expressions for entity queries.
//!
//! A filter is a conjunction of per-attribute comparisons. The same type
//! serves three consumers: the store evaluates it against entities, the
//! cache manager hashes it into a query cache key, and the index advisor
//! classifies its fields into equality and range sets.

use crate::entity::{AttributeName, Entity};
use crate::value::{Scalar, Value};
use serde::{Deserialize, Serialize};

/// Filter operator for attribute comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    /// Equal to. For list-valued attributes this is membership: the filter
    /// value matches if any element equals it.
    Eq,
    /// Not equal to (the attribute must exist).
    Ne,
    /// Greater than
    Gt,
    /// Less than
    Lt,
    /// Greater than or equal
    Gte,
    /// Less than or equal
    Lte,
    /// Contains substring (text) or member (list)
    Contains,
    /// In list of values
    In,
    /// Attribute exists, regardless of value
    HasAttribute,
}

impl FilterOperator {
    /// Whether this operator pins the attribute to a point value.
    /// Equality-class fields are ordered before range-class fields in
    /// compound index recommendations.
    pub fn is_equality(&self) -> bool {
        matches!(self, FilterOperator::Eq | FilterOperator::In)
    }
}

/// One attribute comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterExpr {
    /// Attribute to filter on
    pub field: AttributeName,
    /// Operator to apply
    pub operator: FilterOperator,
    /// Value to compare against. `None` only for `HasAttribute`.
    pub value: Option<Value>,
}

impl FilterExpr {
    /// Create a new filter expression.
    pub fn new(field: impl Into<AttributeName>, operator: FilterOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value: Some(value),
        }
    }

    /// Create an equality filter.
    pub fn eq(field: impl Into<AttributeName>, value: Value) -> Self {
        Self::new(field, FilterOperator::Eq, value)
    }

    /// Create a contains filter.
    pub fn contains(field: impl Into<AttributeName>, value: Value) -> Self {
        Self::new(field, FilterOperator::Contains, value)
    }

    /// Create a greater-than filter.
    pub fn gt(field: impl Into<AttributeName>, value: Value) -> Self {
        Self::new(field, FilterOperator::Gt, value)
    }

    /// Create a less-than filter.
    pub fn lt(field: impl Into<AttributeName>, value: Value) -> Self {
        Self::new(field, FilterOperator::Lt, value)
    }

    /// Create an in-list filter.
    pub fn in_list(field: impl Into<AttributeName>, values: impl IntoIterator<Item = Scalar>) -> Self {
        Self::new(field, FilterOperator::In, Value::list(values))
    }

    /// Create an attribute-existence filter.
    pub fn has_attribute(field: impl Into<AttributeName>) -> Self {
        Self {
            field: field.into(),
            operator: FilterOperator::HasAttribute,
            value: None,
        }
    }

    /// Evaluate this expression against an entity's attribute bag.
    pub fn matches(&self, entity: &Entity) -> bool {
        let Some(attr) = entity.attribute(&self.field) else {
            return false;
        };
        match self.operator {
            FilterOperator::HasAttribute => true,
            FilterOperator::Eq => self
                .value
                .as_ref()
                .is_some_and(|v| value_equals(attr, v)),
            FilterOperator::Ne => self
                .value
                .as_ref()
                .is_some_and(|v| !value_equals(attr, v)),
            FilterOperator::Gt => compare(attr, self.value.as_ref())
                .is_some_and(|ord| ord == std::cmp::Ordering::Greater),
            FilterOperator::Lt => compare(attr, self.value.as_ref())
                .is_some_and(|ord| ord == std::cmp::Ordering::Less),
            FilterOperator::Gte => compare(attr, self.value.as_ref())
                .is_some_and(|ord| ord != std::cmp::Ordering::Less),
            FilterOperator::Lte => compare(attr, self.value.as_ref())
                .is_some_and(|ord| ord != std::cmp::Ordering::Greater),
            FilterOperator::Contains => self.value.as_ref().is_some_and(|v| contains(attr, v)),
            FilterOperator::In => match self.value.as_ref() {
                Some(Value::List(candidates)) => match attr.as_scalar() {
                    Some(s) => candidates.iter().any(|c| scalar_equals(s, c)),
                    None => false,
                },
                Some(Value::ReferenceList(candidates)) => attr
                    .referenced_ids()
                    .iter()
                    .any(|id| candidates.contains(id)),
                _ => false,
            },
        }
    }
}

/// Equality with document-store list semantics: a list-valued attribute
/// matches a scalar or reference filter value if any element matches.
fn value_equals(attr: &Value, filter: &Value) -> bool {
    match (attr, filter) {
        (Value::List(items), Value::Scalar(s)) => items.iter().any(|i| scalar_equals(i, s)),
        (Value::ReferenceList(ids), Value::Reference(id)) => ids.contains(id),
        (a, f) => values_identical(a, f),
    }
}

fn values_identical(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Scalar(x), Value::Scalar(y)) => scalar_equals(x, y),
        (Value::List(x), Value::List(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(i, j)| scalar_equals(i, j))
        }
        (Value::Reference(x), Value::Reference(y)) => x == y,
        (Value::ReferenceList(x), Value::ReferenceList(y)) => x == y,
        _ => false,
    }
}

fn scalar_equals(a: &Scalar, b: &Scalar) -> bool {
    match (a, b) {
        (Scalar::Text(x), Scalar::Text(y)) => x == y,
        // NaN never matches, by partial-equality.
        (Scalar::Number(x), Scalar::Number(y)) => x == y,
        (Scalar::Bool(x), Scalar::Bool(y)) => x == y,
        _ => false,
    }
}

/// Ordering for range operators: numbers by numeric order, text
/// lexicographically. Other shapes are unordered.
fn compare(attr: &Value, filter: Option<&Value>) -> Option<std::cmp::Ordering> {
    match (attr.as_scalar()?, filter?.as_scalar()?) {
        (Scalar::Number(a), Scalar::Number(b)) => a.partial_cmp(b),
        (Scalar::Text(a), Scalar::Text(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}

fn contains(attr: &Value, filter: &Value) -> bool {
    match attr {
        Value::Scalar(Scalar::Text(haystack)) => filter
            .as_text()
            .is_some_and(|needle| haystack.contains(needle)),
        Value::List(items) => filter
            .as_scalar()
            .is_some_and(|s| items.iter().any(|i| scalar_equals(i, s))),
        Value::ReferenceList(ids) => match filter {
            Value::Reference(id) => ids.contains(id),
            _ => false,
        },
        _ => false,
    }
}

/// A conjunction of filter expressions. An empty filter matches everything.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Filter {
    /// All expressions must match.
    pub exprs: Vec<FilterExpr>,
}

impl Filter {
    /// Create an empty (match-all) filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style conjunction.
    pub fn and(mut self, expr: FilterExpr) -> Self {
        self.exprs.push(expr);
        self
    }

    /// Evaluate against an entity.
    pub fn matches(&self, entity: &Entity) -> bool {
        self.exprs.iter().all(|e| e.matches(entity))
    }

    /// The set of fields this filter touches, deduplicated and sorted.
    pub fn fields(&self) -> Vec<AttributeName> {
        let mut fields: Vec<_> = self.exprs.iter().map(|e| e.field.clone()).collect();
        fields.sort();
        fields.dedup();
        fields
    }
}
