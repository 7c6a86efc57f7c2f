//! The index advisor.

use crate::shape::QueryShape;
use crate::spec::{IndexSpec, IndexState};
use chrono::{DateTime, Utc};
use plugboard_core::{AdvisorConfig, AttributeName, PlugboardResult};
use plugboard_store::EntityStore;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug)]
struct ShapeRecord {
    shape: QueryShape,
    observations: VecDeque<DateTime<Utc>>,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ShapeShard {
    shapes: HashMap<String, ShapeRecord>,
}

#[derive(Debug, Default, Clone, Copy)]
struct FieldStat {
    matched_total: u64,
    scanned_total: u64,
}

/// Outcome of one reconcile run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Index names created this run.
    pub created: Vec<String>,
    /// Index names retired this run.
    pub retired: Vec<String>,
    /// Index names whose creation or removal failed (retried next run).
    pub failed: Vec<String>,
    /// True when another reconcile was already in flight and this call
    /// was a no-op.
    pub skipped: bool,
}

/// Resets the in-progress flag even when reconcile exits early.
struct ReconcileFlag<'a>(&'a AtomicBool);

impl Drop for ReconcileFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Observes query shapes and manages secondary-index lifecycle.
///
/// Frequency counters and per-field selectivity statistics are sharded by
/// key hash so concurrent query paths do not contend on one lock. All
/// state here is non-durable and rebuilt from observation after restart;
/// active indexes are re-adopted from the store on the first reconcile.
pub struct IndexAdvisor {
    config: AdvisorConfig,
    shape_shards: Vec<Mutex<ShapeShard>>,
    field_shards: Vec<Mutex<HashMap<AttributeName, FieldStat>>>,
    active: Mutex<BTreeMap<String, IndexSpec>>,
    reconciling: AtomicBool,
}

impl IndexAdvisor {
    pub fn new(config: AdvisorConfig) -> Self {
        let shards = config.shard_count.max(1);
        Self {
            config,
            shape_shards: (0..shards).map(|_| Mutex::new(ShapeShard::default())).collect(),
            field_shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
            active: Mutex::new(BTreeMap::new()),
            reconciling: AtomicBool::new(false),
        }
    }

    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shape_shards.len()
    }

    fn shape_shard(&self, key: &str) -> MutexGuard<'_, ShapeShard> {
        let shard = &self.shape_shards[self.shard_index(key)];
        match shard.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn field_shard(&self, field: &str) -> MutexGuard<'_, HashMap<AttributeName, FieldStat>> {
        let shard = &self.field_shards[self.shard_index(field)];
        match shard.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn active_lock(&self) -> MutexGuard<'_, BTreeMap<String, IndexSpec>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record one observed query shape.
    pub fn record_query_shape(&self, shape: QueryShape) {
        if shape.is_empty() {
            return;
        }
        let now = Utc::now();
        let key = shape.key();
        let window = chrono::Duration::from_std(self.config.observation_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(0));
        {
            let mut shard = self.shape_shard(&key);
            let record = shard.shapes.entry(key).or_insert_with(|| ShapeRecord {
                shape: shape.clone(),
                observations: VecDeque::new(),
                last_seen: now,
            });
            record.observations.push_back(now);
            record.last_seen = now;
            while let Some(oldest) = record.observations.front() {
                if now - *oldest > window {
                    record.observations.pop_front();
                } else {
                    break;
                }
            }
            self.enforce_shape_bound(&mut shard);
        }
        // Bump usage of active indexes this shape can be served by: any
        // index whose leading field the shape constrains.
        let fields = shape.fields();
        let mut active = self.active_lock();
        for spec in active.values_mut() {
            if spec
                .fields
                .first()
                .is_some_and(|first| fields.contains(first))
            {
                spec.usage_count += 1;
                spec.last_used_at = now;
            }
        }
    }

    fn enforce_shape_bound(&self, shard: &mut ShapeShard) {
        let per_shard = (self.config.max_tracked_shapes / self.shape_shards.len()).max(1);
        while shard.shapes.len() > per_shard {
            let Some(oldest) = shard
                .shapes
                .iter()
                .min_by_key(|(_, record)| record.last_seen)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            shard.shapes.remove(&oldest);
        }
    }

    /// Record the outcome of a query against one of its fields: how many
    /// entities matched out of how many were scanned. Feeds the
    /// selectivity ordering of compound recommendations.
    pub fn record_field_observation(&self, field: &str, matched: u64, scanned: u64) {
        let mut shard = self.field_shard(field);
        let stat = shard.entry(field.to_string()).or_default();
        stat.matched_total += matched;
        stat.scanned_total += scanned;
    }

    /// Observed match fraction for a field: lower is more selective.
    /// Fields with no history rank last (1.0).
    fn selectivity(&self, field: &str) -> f64 {
        let shard = self.field_shard(field);
        match shard.get(field) {
            Some(stat) if stat.scanned_total > 0 => {
                stat.matched_total as f64 / stat.scanned_total as f64
            }
            _ => 1.0,
        }
    }

    /// Deterministic compound ordering: equality fields before range
    /// fields; within each class, most selective first, ties broken
    /// lexicographically. Reproducible from the same observation history
    /// by construction: nothing depends on observation arrival order.
    fn order_fields(&self, shape: &QueryShape) -> Vec<AttributeName> {
        let rank = |fields: &std::collections::BTreeSet<AttributeName>| {
            let mut ranked: Vec<AttributeName> = fields.iter().cloned().collect();
            ranked.sort_by(|a, b| {
                self.selectivity(a)
                    .partial_cmp(&self.selectivity(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.cmp(b))
            });
            ranked
        };
        let mut fields = rank(&shape.equality);
        fields.extend(rank(&shape.range));
        fields
    }

    /// Whether a field set should be indexed sparsely: every field's
    /// observed match fraction stays under the presence cutoff, meaning
    /// most entities do not participate in these queries at all.
    fn is_sparse(&self, fields: &[AttributeName]) -> bool {
        !fields.is_empty()
            && fields
                .iter()
                .all(|field| self.selectivity(field) < self.config.sparse_presence_cutoff)
    }

    /// Field sets whose in-window frequency is at least `min_frequency`,
    /// as ready-to-create index specs in deterministic order.
    pub fn get_recommendations(&self, min_frequency: u64) -> Vec<IndexSpec> {
        let now = Utc::now();
        let window = chrono::Duration::from_std(self.config.observation_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(0));
        let active = self.active_lock();
        let mut specs = Vec::new();
        for shard in &self.shape_shards {
            let mut shard = match shard.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            for record in shard.shapes.values_mut() {
                while let Some(oldest) = record.observations.front() {
                    if now - *oldest > window {
                        record.observations.pop_front();
                    } else {
                        break;
                    }
                }
                let frequency = record.observations.len() as u64;
                if frequency < min_frequency {
                    continue;
                }
                let fields = self.order_fields(&record.shape);
                let sparse = self.is_sparse(&fields);
                let mut spec = IndexSpec {
                    fields,
                    sparse,
                    usage_count: frequency,
                    last_used_at: record.last_seen,
                    state: IndexState::Proposed,
                };
                if active.contains_key(&spec.index_name()) {
                    spec.state = IndexState::Active;
                }
                specs.push(spec);
            }
        }
        specs.sort_by_key(IndexSpec::index_name);
        specs
    }

    /// Currently active (store-backed) index specs.
    pub fn active_indexes(&self) -> Vec<IndexSpec> {
        self.active_lock().values().cloned().collect()
    }

    /// Idempotently create recommended indexes and retire stale ones.
    ///
    /// Safe to call concurrently with itself (the second call is a no-op)
    /// and with in-flight queries (the store's index changes are online).
    /// Creation failures are logged and retried on the next run, never
    /// surfaced to query or write paths.
    pub async fn reconcile(&self, store: &dyn EntityStore) -> PlugboardResult<ReconcileReport> {
        if self
            .reconciling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("reconcile already in flight, skipping");
            return Ok(ReconcileReport {
                skipped: true,
                ..Default::default()
            });
        }
        let _flag = ReconcileFlag(&self.reconciling);
        let mut report = ReconcileReport::default();
        let now = Utc::now();

        // Adopt indexes that already exist in the store (restart recovery:
        // advisor state is non-durable, the store is the record).
        let existing = store.list_indexes().await?;
        {
            let mut active = self.active_lock();
            for definition in &existing {
                active.entry(definition.name.clone()).or_insert_with(|| IndexSpec {
                    fields: definition.fields.clone(),
                    sparse: definition.sparse,
                    usage_count: 0,
                    last_used_at: now,
                    state: IndexState::Active,
                });
            }
        }
        let existing_names: Vec<String> = existing.into_iter().map(|d| d.name).collect();

        for mut spec in self.get_recommendations(self.config.recommendation_threshold) {
            let name = spec.index_name();
            if existing_names.contains(&name) {
                continue;
            }
            match store.create_index(spec.definition()).await {
                Ok(()) => {
                    info!(index = %name, "index created");
                    spec.state = IndexState::Active;
                    spec.last_used_at = now;
                    self.active_lock().insert(name.clone(), spec);
                    report.created.push(name);
                }
                Err(error) => {
                    warn!(index = %name, %error, "index creation failed, will retry");
                    report.failed.push(name);
                }
            }
        }

        // Retire indexes that have not served a query for too long.
        let staleness = chrono::Duration::from_std(self.config.retirement_staleness)
            .unwrap_or_else(|_| chrono::Duration::seconds(0));
        let stale: Vec<String> = self
            .active_lock()
            .iter()
            .filter(|(_, spec)| now - spec.last_used_at > staleness)
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            match store.drop_index(&name).await {
                Ok(()) => {
                    info!(index = %name, "stale index retired");
                    self.active_lock().remove(&name);
                    report.retired.push(name);
                }
                Err(error) => {
                    warn!(index = %name, %error, "index retirement failed, will retry");
                    report.failed.push(name);
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugboard_core::{Filter, FilterExpr, Value};
    use plugboard_store::MemoryStore;
    use std::time::Duration;
    use uuid::Uuid;

    fn tag_filter() -> Filter {
        Filter::new().and(FilterExpr::eq("Tag", Value::reference(Uuid::now_v7())))
    }

    fn advisor() -> IndexAdvisor {
        IndexAdvisor::new(AdvisorConfig::default())
    }

    #[test]
    fn test_threshold_scenario() {
        // 150 observations of {Tag} with threshold 100: the Tag index is
        // recommended.
        let advisor = advisor();
        for _ in 0..150 {
            advisor.record_query_shape(QueryShape::of(&tag_filter()));
            advisor.record_field_observation("Tag", 10, 1000);
        }
        let recommendations = advisor.get_recommendations(100);
        assert_eq!(recommendations.len(), 1);
        assert_eq!(recommendations[0].fields, vec!["Tag"]);
        assert!(recommendations[0].sparse);
        assert!(recommendations[0].usage_count >= 150);
    }

    #[test]
    fn test_below_threshold_not_recommended() {
        let advisor = advisor();
        for _ in 0..99 {
            advisor.record_query_shape(QueryShape::of(&tag_filter()));
        }
        assert!(advisor.get_recommendations(100).is_empty());
    }

    #[test]
    fn test_compound_ordering_equality_before_range_by_selectivity() {
        let advisor = advisor();
        let filter = Filter::new()
            .and(FilterExpr::eq("Zone", Value::text("north")))
            .and(FilterExpr::eq("Tag", Value::reference(Uuid::now_v7())))
            .and(FilterExpr::gt("Health", Value::number(50.0)));
        // Tag is far more selective than Zone.
        for _ in 0..10 {
            advisor.record_query_shape(QueryShape::of(&filter));
            advisor.record_field_observation("Tag", 5, 1000);
            advisor.record_field_observation("Zone", 400, 1000);
            advisor.record_field_observation("Health", 600, 1000);
        }
        let recommendations = advisor.get_recommendations(10);
        assert_eq!(recommendations.len(), 1);
        assert_eq!(recommendations[0].fields, vec!["Tag", "Zone", "Health"]);
    }

    #[test]
    fn test_recommendation_determinism() {
        // The same observation history, replayed into a fresh advisor,
        // yields identical field ordering.
        let run = || {
            let advisor = advisor();
            let filter = Filter::new()
                .and(FilterExpr::eq("A", Value::number(1.0)))
                .and(FilterExpr::eq("B", Value::number(2.0)))
                .and(FilterExpr::lt("C", Value::number(3.0)));
            for i in 0..50u64 {
                advisor.record_query_shape(QueryShape::of(&filter));
                advisor.record_field_observation("A", 100 + i, 1000);
                advisor.record_field_observation("B", 100 + i, 1000);
                advisor.record_field_observation("C", 900, 1000);
            }
            advisor
                .get_recommendations(50)
                .into_iter()
                .map(|s| s.fields)
                .collect::<Vec<_>>()
        };
        let first = run();
        let second = run();
        assert_eq!(first, second);
        // A and B have identical selectivity: lexicographic tie-break.
        assert_eq!(first[0], vec!["A", "B", "C"]);
    }

    #[test]
    fn test_window_expiry_drops_observations() {
        let config = AdvisorConfig::default().with_observation_window(Duration::ZERO);
        let advisor = IndexAdvisor::new(config);
        for _ in 0..500 {
            advisor.record_query_shape(QueryShape::of(&tag_filter()));
        }
        // A zero-width window retains at most the instantaneous burst;
        // after the pruning in get_recommendations, nothing survives.
        assert!(advisor.get_recommendations(500).is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_creates_recommended_indexes() {
        let store = MemoryStore::new();
        let advisor = IndexAdvisor::new(
            AdvisorConfig::default().with_recommendation_threshold(10),
        );
        for _ in 0..20 {
            advisor.record_query_shape(QueryShape::of(&tag_filter()));
        }

        let report = advisor.reconcile(&store).await.unwrap();
        assert_eq!(report.created, vec!["idx_Tag".to_string()]);
        assert!(!report.skipped);
        assert_eq!(store.list_indexes().await.unwrap().len(), 1);

        // Idempotent: a second run creates nothing new.
        let report = advisor.reconcile(&store).await.unwrap();
        assert!(report.created.is_empty());
        assert_eq!(store.list_indexes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_failure_logged_and_retried() {
        let store = MemoryStore::new();
        let advisor = IndexAdvisor::new(
            AdvisorConfig::default().with_recommendation_threshold(10),
        );
        for _ in 0..20 {
            advisor.record_query_shape(QueryShape::of(&tag_filter()));
        }

        store.fail_index_creation(Some("no capacity".into()));
        let report = advisor.reconcile(&store).await.unwrap();
        assert_eq!(report.failed, vec!["idx_Tag".to_string()]);
        assert!(report.created.is_empty());

        // Next run succeeds once the store recovers.
        store.fail_index_creation(None);
        let report = advisor.reconcile(&store).await.unwrap();
        assert_eq!(report.created, vec!["idx_Tag".to_string()]);
    }

    #[tokio::test]
    async fn test_reconcile_retires_unused_indexes() {
        let store = MemoryStore::new();
        let advisor = IndexAdvisor::new(
            AdvisorConfig::default()
                .with_recommendation_threshold(10)
                .with_retirement_staleness(Duration::ZERO),
        );
        for _ in 0..20 {
            advisor.record_query_shape(QueryShape::of(&tag_filter()));
        }
        advisor.reconcile(&store).await.unwrap();
        assert_eq!(store.list_indexes().await.unwrap().len(), 1);

        // A fresh advisor (restart) adopts the index from the store on its
        // first run, then retires it on the next once it stays unused past
        // the zero staleness threshold.
        let idle = IndexAdvisor::new(
            AdvisorConfig::default().with_retirement_staleness(Duration::ZERO),
        );
        let report = idle.reconcile(&store).await.unwrap();
        assert!(report.retired.is_empty());
        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = idle.reconcile(&store).await.unwrap();
        assert_eq!(report.retired, vec!["idx_Tag".to_string()]);
        assert!(store.list_indexes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_adopts_existing_indexes() {
        let store = MemoryStore::new();
        store
            .create_index(plugboard_store::IndexDefinition::new(
                vec!["Zone".into()],
                false,
            ))
            .await
            .unwrap();

        let advisor = advisor();
        advisor.reconcile(&store).await.unwrap();
        let active = advisor.active_indexes();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].fields, vec!["Zone"]);
        assert_eq!(active[0].state, IndexState::Active);
    }

    #[test]
    fn test_usage_tracking_touches_matching_active_indexes() {
        let advisor = advisor();
        {
            let mut active = advisor.active_lock();
            active.insert(
                "idx_Tag".into(),
                IndexSpec {
                    fields: vec!["Tag".into()],
                    sparse: true,
                    usage_count: 0,
                    last_used_at: Utc::now() - chrono::Duration::hours(1),
                    state: IndexState::Active,
                },
            );
        }
        advisor.record_query_shape(QueryShape::of(&tag_filter()));
        let active = advisor.active_indexes();
        assert_eq!(active[0].usage_count, 1);
        assert!(Utc::now() - active[0].last_used_at < chrono::Duration::seconds(5));
    }
}
