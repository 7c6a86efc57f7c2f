//! Query shapes.
//!
//! A shape is what remains of a filter once concrete values are erased:
//! which fields it touches and whether each is pinned to a point value
//! (equality class) or constrained to a range. Shapes are the unit of
//! frequency counting and the input to compound index field ordering.

use plugboard_core::{AttributeName, Filter};
use std::collections::BTreeSet;

/// The value-erased form of a filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryShape {
    /// Fields compared with equality-class operators (`Eq`, `In`).
    pub equality: BTreeSet<AttributeName>,
    /// Fields compared with range-class operators (everything else).
    pub range: BTreeSet<AttributeName>,
}

impl QueryShape {
    /// Extract the shape of a filter. A field used by both an equality and
    /// a range expression counts as equality (the stronger constraint).
    pub fn of(filter: &Filter) -> Self {
        let mut equality = BTreeSet::new();
        let mut range = BTreeSet::new();
        for expr in &filter.exprs {
            if expr.operator.is_equality() {
                equality.insert(expr.field.clone());
            } else {
                range.insert(expr.field.clone());
            }
        }
        range.retain(|field| !equality.contains(field));
        Self { equality, range }
    }

    /// Whether the shape touches any field at all.
    pub fn is_empty(&self) -> bool {
        self.equality.is_empty() && self.range.is_empty()
    }

    /// All fields, equality first, both sets in lexicographic order.
    pub fn fields(&self) -> Vec<AttributeName> {
        self.equality.iter().chain(self.range.iter()).cloned().collect()
    }

    /// Canonical shape key: stable across observation order, used for
    /// frequency counting.
    pub fn key(&self) -> String {
        let eq: Vec<&str> = self.equality.iter().map(String::as_str).collect();
        let rng: Vec<&str> = self.range.iter().map(String::as_str).collect();
        format!("eq:{}|rng:{}", eq.join(","), rng.join(","))
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use plugboard_core::{FilterExpr, Value};
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// Property: the shape key is invariant under expression order.
        #[test]
        fn prop_shape_key_order_independent(
            mut fields in proptest::collection::vec("[A-Za-z]{1,8}", 1..6),
        ) {
            let forward = fields
                .iter()
                .fold(Filter::new(), |f, field| {
                    f.and(FilterExpr::eq(field.clone(), Value::number(1.0)))
                });
            fields.reverse();
            let backward = fields
                .iter()
                .fold(Filter::new(), |f, field| {
                    f.and(FilterExpr::eq(field.clone(), Value::number(1.0)))
                });
            prop_assert_eq!(QueryShape::of(&forward).key(), QueryShape::of(&backward).key());
        }
    }
}
