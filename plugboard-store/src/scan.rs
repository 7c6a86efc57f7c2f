//! Lazy query scans with scoped cursor release.

use futures_util::Stream;
use plugboard_core::{Entity, PlugboardResult};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

/// Keeps the store's open-cursor count honest: incremented when a scan is
/// opened, decremented when the scan is dropped, however early.
#[derive(Debug)]
pub(crate) struct CursorGuard {
    open_cursors: Arc<AtomicU64>,
}

impl CursorGuard {
    pub(crate) fn open(open_cursors: Arc<AtomicU64>) -> Self {
        open_cursors.fetch_add(1, Ordering::SeqCst);
        Self { open_cursors }
    }
}

impl Drop for CursorGuard {
    fn drop(&mut self) {
        self.open_cursors.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A finite, lazy sequence of matching entities.
///
/// The scan holds its cursor resource for as long as it is alive;
/// abandoning iteration mid-stream (dropping the scan) releases it
/// promptly.
pub struct EntityScan {
    entities: std::vec::IntoIter<Entity>,
    _cursor: Option<CursorGuard>,
}

impl EntityScan {
    /// Build a scan over an already-materialized snapshot. Store adapters
    /// whose backends hand back full result sets use this directly.
    pub fn new(entities: Vec<Entity>) -> Self {
        Self {
            entities: entities.into_iter(),
            _cursor: None,
        }
    }

    /// Build a scan tied to a cursor counter (in-memory store internals).
    pub(crate) fn with_cursor(entities: Vec<Entity>, cursor: CursorGuard) -> Self {
        Self {
            entities: entities.into_iter(),
            _cursor: Some(cursor),
        }
    }

    /// Matching entities remaining in the scan.
    pub fn remaining(&self) -> usize {
        self.entities.len()
    }

    /// Drain the scan into a vector, releasing the cursor.
    pub async fn collect_all(mut self) -> PlugboardResult<Vec<Entity>> {
        let mut out = Vec::with_capacity(self.entities.len());
        for entity in self.entities.by_ref() {
            out.push(entity);
        }
        Ok(out)
    }
}

impl Stream for EntityScan {
    type Item = PlugboardResult<Entity>;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.entities.next().map(Ok))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugboard_core::Value;
    use tokio_stream::StreamExt;
    use uuid::Uuid;

    fn entities(n: usize) -> Vec<Entity> {
        (0..n)
            .map(|i| Entity::new(Uuid::now_v7()).with_attribute("N", Value::number(i as f64)))
            .collect()
    }

    #[tokio::test]
    async fn test_scan_streams_all_entities() {
        let counter = Arc::new(AtomicU64::new(0));
        let scan = EntityScan::with_cursor(entities(3), CursorGuard::open(Arc::clone(&counter)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let collected: Vec<_> = scan.collect::<Vec<_>>().await;
        assert_eq!(collected.len(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_early_drop_releases_cursor() {
        let counter = Arc::new(AtomicU64::new(0));
        let mut scan =
            EntityScan::with_cursor(entities(10), CursorGuard::open(Arc::clone(&counter)));

        // Take one item, then abandon the rest.
        let first = scan.next().await;
        assert!(first.is_some());
        assert_eq!(scan.remaining(), 9);
        drop(scan);

        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_snapshot_scan_without_cursor() {
        let scan = EntityScan::new(entities(2));
        let collected = scan.collect_all().await.unwrap();
        assert_eq!(collected.len(), 2);
    }
}
