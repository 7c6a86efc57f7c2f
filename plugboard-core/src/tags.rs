//! Tag parent graph with write-time cycle rejection.
//!
//! Tags are ordinary entities; what makes them a graph is the `Parent`
//! attribute referencing other tags. The graph is kept as an arena of id
//! sets rather than linked nodes, and every edge mutation runs an explicit
//! reachability check so the DAG invariant holds at all times.

use crate::error::ValidationError;
use crate::identity::EntityId;
use std::collections::{BTreeSet, HashMap};

/// Directed graph over entity ids: child -> set of parents.
#[derive(Debug, Clone, Default)]
pub struct TagGraph {
    edges: HashMap<EntityId, BTreeSet<EntityId>>,
}

impl TagGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes with outgoing (parent) edges.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Whether the graph has no edges.
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// The recorded parents of `id`.
    pub fn parents(&self, id: EntityId) -> impl Iterator<Item = EntityId> + '_ {
        self.edges.get(&id).into_iter().flatten().copied()
    }

    /// Check whether replacing `id`'s parents with `parents` would close a
    /// cycle, without mutating the graph. Used to validate a write before
    /// it is sent to the store.
    pub fn check_parents(&self, id: EntityId, parents: &[EntityId]) -> Result<(), ValidationError> {
        match self.cycle_path(id, parents) {
            Some(path) => Err(ValidationError::CycleDetected { ids: path }),
            None => Ok(()),
        }
    }

    /// Replace the parent set of `id`, rejecting the write if it would
    /// close a cycle. On rejection the graph is unchanged.
    pub fn set_parents(
        &mut self,
        id: EntityId,
        parents: &[EntityId],
    ) -> Result<(), ValidationError> {
        if let Some(path) = self.cycle_path(id, parents) {
            return Err(ValidationError::CycleDetected { ids: path });
        }
        if parents.is_empty() {
            self.edges.remove(&id);
        } else {
            self.edges.insert(id, parents.iter().copied().collect());
        }
        Ok(())
    }

    /// Drop a node and its outgoing edges (on entity deletion). Incoming
    /// edges from other tags simply dangle; a dangling parent reference
    /// cannot create a cycle.
    pub fn remove(&mut self, id: EntityId) {
        self.edges.remove(&id);
    }

    /// All transitive ancestors of `id` under the current edges.
    pub fn ancestors(&self, id: EntityId) -> BTreeSet<EntityId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<EntityId> = self.parents(id).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend(self.parents(next));
            }
        }
        seen
    }

    /// If replacing `id`'s parents with `parents` would close a cycle,
    /// return an offending path from `id` back to itself.
    fn cycle_path(&self, id: EntityId, parents: &[EntityId]) -> Option<Vec<EntityId>> {
        for &parent in parents {
            if parent == id {
                return Some(vec![id, id]);
            }
            // Walk up from the proposed parent over existing edges;
            // `id`'s own outgoing edges are being replaced, so a path
            // through them does not count.
            let mut stack = vec![(parent, vec![id, parent])];
            let mut seen = BTreeSet::new();
            while let Some((node, path)) = stack.pop() {
                if !seen.insert(node) {
                    continue;
                }
                for ancestor in self.parents(node) {
                    if ancestor == id {
                        let mut cycle = path.clone();
                        cycle.push(id);
                        return Some(cycle);
                    }
                    if ancestor != node {
                        let mut next_path = path.clone();
                        next_path.push(ancestor);
                        stack.push((ancestor, next_path));
                    }
                }
            }
        }
        None
    }
}
