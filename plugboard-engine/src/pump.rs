//! Background pumps: watch-stream invalidation and advisor reconciliation.
//!
//! The watch pump is what keeps this process coherent with writes made by
//! *other* processes sharing the store: every change notification is
//! applied as an idempotent invalidation, in the per-id order the store
//! delivers. Local writes invalidate synchronously on the write path and
//! then again when their own notification arrives; the second application
//! is a no-op by design.

use crate::engine::Engine;
use plugboard_core::attrs;
use plugboard_store::{Change, ChangeKind, EntityStore, WatchEvent};
use std::sync::Arc;
use tracing::{debug, warn};

impl Engine {
    /// Spawn the watch-stream pump. Runs until the store side closes.
    pub fn spawn_watch_pump(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut stream = engine.store().watch();
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                engine.apply_watch_event(event).await;
            }
            debug!("watch stream closed, pump exiting");
        })
    }

    /// Spawn the periodic advisor reconcile loop.
    pub fn spawn_reconcile_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.config().advisor.reconcile_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                // Reconcile failures never block reads or writes; log and
                // let the next tick retry.
                if let Err(error) = engine.reconcile_now().await {
                    warn!(%error, "reconcile failed, retrying next interval");
                }
            }
        })
    }

    /// Apply one watch event.
    pub async fn apply_watch_event(&self, event: WatchEvent) {
        match event {
            WatchEvent::Change(change) => self.apply_change(&change).await,
            WatchEvent::Lagged { skipped } => {
                // Missed notifications mean cached state can no longer be
                // trusted; everything is rebuildable, so start over.
                warn!(skipped, "watch stream lagged, dropping caches");
                self.cache().clear().await;
                self.registry().clear();
                if let Err(error) = self.bootstrap().await {
                    warn!(%error, "tag graph rebuild failed after lag");
                }
            }
        }
    }

    /// Apply one change notification. Idempotent: at-least-once delivery
    /// means the same change may arrive more than once, and local writes
    /// are observed here after having already invalidated synchronously.
    pub async fn apply_change(&self, change: &Change) {
        match change.kind {
            ChangeKind::Delete => {
                self.cache().apply_delete(change.id).await;
                for attribute in &change.changed_attributes {
                    self.invalidate_query_results(attribute).await;
                }
                self.registry().note_delete(change.id);
                self.tags_remove(change.id).await;
            }
            ChangeKind::Insert | ChangeKind::Update => {
                for attribute in &change.changed_attributes {
                    self.cache().invalidate(change.id, attribute).await;
                    self.invalidate_query_results(attribute).await;
                }
                self.registry().handle_change(change);
                if change
                    .changed_attributes
                    .iter()
                    .any(|attribute| attribute == attrs::PARENT)
                {
                    self.refresh_tag_edges(change.id).await;
                }
            }
        }
    }

    async fn tags_remove(&self, id: plugboard_core::EntityId) {
        self.tags().lock().await.remove(id);
    }

    /// Re-mirror one entity's parent edges from the store.
    async fn refresh_tag_edges(&self, id: plugboard_core::EntityId) {
        match self.store().get(id).await {
            Ok(Some(entity)) => {
                let mut tags = self.tags().lock().await;
                if let Err(error) = tags.set_parents(id, &entity.parent_ids()) {
                    // The store accepted these edges, so another writer won
                    // a race; the mirror keeps its acyclic view and the
                    // next bootstrap reconverges.
                    warn!(%id, %error, "parent edge refresh rejected");
                }
            }
            Ok(None) => {
                self.tags().lock().await.remove(id);
            }
            Err(error) => {
                warn!(%id, %error, "parent edge refresh failed");
            }
        }
    }
}
