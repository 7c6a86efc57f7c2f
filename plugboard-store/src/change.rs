//! Change notifications from the store.
//!
//! The watch stream is the coherence backbone for caches owned by other
//! processes: every accepted write or delete is published with the set of
//! attributes it touched, in a per-id order matching the store's version
//! order. Delivery is at-least-once; consumers apply changes idempotently.

use plugboard_core::{AttributeName, EntityId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// What kind of mutation a change describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One mutation, as delivered to watchers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Monotonically increasing store sequence number.
    pub sequence: u64,
    /// Mutation kind.
    pub kind: ChangeKind,
    /// The entity that changed.
    pub id: EntityId,
    /// Attributes touched by the mutation. For deletes, every attribute
    /// the entity carried.
    pub changed_attributes: Vec<AttributeName>,
}

/// An event observed on a [`ChangeStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// A mutation notification.
    Change(Change),
    /// The subscriber fell behind and `skipped` notifications were
    /// dropped. The correct reaction is to treat all cached state as
    /// suspect (drop caches and resync) rather than to continue applying
    /// later changes as if nothing was missed.
    Lagged { skipped: u64 },
}

/// Subscription to the store's change feed.
///
/// Backed by a bounded broadcast channel, so a slow subscriber observes
/// [`WatchEvent::Lagged`] instead of stalling writers.
pub struct ChangeStream {
    rx: broadcast::Receiver<Change>,
}

impl ChangeStream {
    pub(crate) fn new(rx: broadcast::Receiver<Change>) -> Self {
        Self { rx }
    }

    /// Wait for the next event. Returns `None` once the store side has
    /// gone away and the buffer is drained.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        match self.rx.recv().await {
            Ok(change) => Some(WatchEvent::Change(change)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                Some(WatchEvent::Lagged { skipped })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Non-blocking poll used by tests and by pump shutdown paths.
    pub fn try_next(&mut self) -> Option<WatchEvent> {
        match self.rx.try_recv() {
            Ok(change) => Some(WatchEvent::Change(change)),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                Some(WatchEvent::Lagged { skipped })
            }
            _ => None,
        }
    }
}
