//! Snapshot reconciliation

use super::entity::{EntityState, IllegalTransition, ReconciledEntity};
use crate::error::{Error, MappingError, PoolClosed};
use crate::pool::WorkerPool;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// One item of a complete upstream snapshot, not yet mapped
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry<K, R> {
    pub key: K,
    pub version: Option<String>,
    pub raw: R,
}

impl<K, R> SnapshotEntry<K, R> {
    pub fn new(key: K, version: Option<String>, raw: R) -> Self {
        Self { key, version, raw }
    }
}

/// Per-entity post-processing run after mapping (health checks and the like)
#[async_trait]
pub trait Enricher<K, V>: Send + Sync
where
    K: Sync,
    V: Send + Sync + 'static,
{
    async fn enrich(&self, key: &K, value: &V) -> anyhow::Result<V>;

    /// Best-effort value stored when `enrich` fails
    fn degrade(&self, _key: &K, value: V) -> V {
        value
    }
}

/// Stores mapped values as they are
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEnrichment;

#[async_trait]
impl<K, V> Enricher<K, V> for NoEnrichment
where
    K: Sync,
    V: Clone + Send + Sync + 'static,
{
    async fn enrich(&self, _key: &K, value: &V) -> anyhow::Result<V> {
        Ok(value.clone())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    PoolClosed(#[from] PoolClosed),

    #[error(transparent)]
    Transition(#[from] IllegalTransition),
}

/// What a reconciliation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport<K> {
    pub generation: u64,
    pub added: Vec<K>,
    pub changed: Vec<K>,
    pub unchanged: Vec<K>,
    pub evicted: Vec<K>,
    /// Entities stored in their degraded form
    pub enrichment_failures: Vec<K>,
}

impl<K> ReconcileReport<K> {
    fn empty(generation: u64) -> Self {
        Self {
            generation,
            added: Vec::new(),
            changed: Vec::new(),
            unchanged: Vec::new(),
            evicted: Vec::new(),
            enrichment_failures: Vec::new(),
        }
    }
}

/// One published snapshot
pub type Entries<K, V> = HashMap<K, ReconciledEntity<K, V>>;

struct Pending<K, V> {
    key: K,
    version: Option<String>,
    value: V,
    added: bool,
}

/// Keyed store replaced wholesale, one complete snapshot at a time
///
/// Readers always see exactly one snapshot: the next one is staged off to the
/// side (mapped and enriched) and published with a single pointer swap.
pub struct ReconcilingCache<K, V> {
    name: String,
    entries: RwLock<Arc<Entries<K, V>>>,
    generation: AtomicU64,
    reconciling: Mutex<()>,
}

impl<K, V> ReconcilingCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: RwLock::new(Arc::new(HashMap::new())),
            generation: AtomicU64::new(0),
            reconciling: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.entries.read().await.get(key).map(|e| e.value.clone())
    }

    /// Like `get`, but a missing key is a `NotFound` error
    pub async fn require(&self, key: &K) -> Result<V, Error>
    where
        K: fmt::Display,
    {
        self.get(key).await.ok_or_else(|| Error::NotFound {
            resource_type: self.name.clone(),
            id: key.to_string(),
        })
    }

    pub async fn entity(&self, key: &K) -> Option<ReconciledEntity<K, V>> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn keys(&self) -> Vec<K> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Consistent view of the current snapshot
    pub async fn snapshot(&self) -> Arc<Entries<K, V>> {
        self.entries.read().await.clone()
    }

    /// Generation of the published snapshot (0 before the first one)
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Replace the cached contents with a complete snapshot
    ///
    /// Entries whose version token matches the cached one are carried over
    /// untouched. Everything else is mapped and enriched on `pool`; a failed
    /// enrichment stores the enricher's degraded value. Keys missing from
    /// `entries` are evicted. A mapping error aborts before anything is
    /// published.
    pub async fn reconcile_snapshot<R, M, E>(
        &self,
        entries: Vec<SnapshotEntry<K, R>>,
        mapper: M,
        enricher: &E,
        pool: &WorkerPool,
    ) -> Result<ReconcileReport<K>, ReconcileError>
    where
        M: Fn(&K, R) -> Result<V, MappingError>,
        E: Enricher<K, V> + ?Sized,
    {
        let _guard = self.reconciling.lock().await;

        let current = self.snapshot().await;
        let generation = self.generation() + 1;
        let mut report = ReconcileReport::empty(generation);
        let mut next: Entries<K, V> = HashMap::with_capacity(entries.len());
        let mut pending = Vec::new();
        let mut seen = HashSet::with_capacity(entries.len());

        for entry in entries {
            if !seen.insert(entry.key.clone()) {
                tracing::warn!(cache = %self.name, "Duplicate key in snapshot, keeping the last one");
                pending.retain(|p: &Pending<K, V>| p.key != entry.key);
                next.remove(&entry.key);
                report.unchanged.retain(|k| k != &entry.key);
            }

            match current.get(&entry.key) {
                Some(cached) if cached.is_current(entry.version.as_deref()) => {
                    next.insert(entry.key.clone(), cached.clone());
                    report.unchanged.push(entry.key);
                },
                cached => {
                    let value = mapper(&entry.key, entry.raw)?;
                    pending.push(Pending {
                        added: cached.is_none(),
                        key: entry.key,
                        version: entry.version,
                        value,
                    });
                },
            }
        }

        let enriched = pool
            .run_all_settled(pending.iter().map(|p| enricher.enrich(&p.key, &p.value)))
            .await;

        for (p, outcome) in pending.into_iter().zip(enriched) {
            let value = match outcome? {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(cache = %self.name, "Enrichment failed, storing degraded value: {:#}", e);
                    report.enrichment_failures.push(p.key.clone());
                    enricher.degrade(&p.key, p.value)
                },
            };

            let mut entity = ReconciledEntity::new(p.key.clone(), value, p.version, generation);
            entity.transition(EntityState::Enriched)?;
            entity.transition(EntityState::Cached)?;

            if p.added {
                report.added.push(p.key.clone());
            } else {
                report.changed.push(p.key.clone());
            }
            next.insert(p.key, entity);
        }

        for (key, cached) in current.iter() {
            if !next.contains_key(key) {
                let mut gone = cached.clone();
                gone.transition(EntityState::Evicted)?;
                report.evicted.push(gone.key);
            }
        }

        *self.entries.write().await = Arc::new(next);
        self.generation.store(generation, Ordering::Release);

        tracing::debug!(
            cache = %self.name,
            generation,
            added = report.added.len(),
            changed = report.changed.len(),
            unchanged = report.unchanged.len(),
            evicted = report.evicted.len(),
            "Published snapshot"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, version: &str, raw: i64) -> SnapshotEntry<String, i64> {
        SnapshotEntry::new(key.to_string(), Some(version.to_string()), raw)
    }

    fn identity(_: &String, raw: i64) -> Result<i64, MappingError> {
        Ok(raw)
    }

    fn sorted(mut keys: Vec<String>) -> Vec<String> {
        keys.sort();
        keys
    }

    struct FailOdd;

    #[async_trait]
    impl Enricher<String, i64> for FailOdd {
        async fn enrich(&self, _key: &String, value: &i64) -> anyhow::Result<i64> {
            if value % 2 == 1 {
                anyhow::bail!("odd");
            }
            Ok(value * 10)
        }

        fn degrade(&self, _key: &String, _value: i64) -> i64 {
            -1
        }
    }

    #[tokio::test]
    async fn test_second_snapshot_replaces_first() {
        let cache = ReconcilingCache::new("widgets");
        let pool = WorkerPool::new("widgets", 2);

        cache
            .reconcile_snapshot(
                vec![entry("a", "1", 1), entry("b", "1", 2), entry("c", "1", 3)],
                identity,
                &NoEnrichment,
                &pool,
            )
            .await
            .unwrap();

        let report = cache
            .reconcile_snapshot(
                vec![entry("b", "1", 2), entry("c", "1", 3), entry("d", "1", 4)],
                identity,
                &NoEnrichment,
                &pool,
            )
            .await
            .unwrap();

        assert_eq!(sorted(cache.keys().await), vec!["b", "c", "d"]);
        assert_eq!(report.evicted, vec!["a".to_string()]);
        assert_eq!(report.added, vec!["d".to_string()]);
        assert_eq!(sorted(report.unchanged), vec!["b", "c"]);
        assert!(report.changed.is_empty());
        assert_eq!(cache.generation(), 2);
    }

    #[tokio::test]
    async fn test_unchanged_entity_is_not_remapped() {
        let cache = ReconcilingCache::new("widgets");
        let pool = WorkerPool::new("widgets", 2);
        cache
            .reconcile_snapshot(vec![entry("a", "1", 1)], identity, &NoEnrichment, &pool)
            .await
            .unwrap();

        // same version, different raw: cached value wins
        cache
            .reconcile_snapshot(vec![entry("a", "1", 99)], identity, &NoEnrichment, &pool)
            .await
            .unwrap();
        let kept = cache.entity(&"a".to_string()).await.unwrap();
        assert_eq!(kept.value, 1);
        assert_eq!(kept.generation, 1);

        let report = cache
            .reconcile_snapshot(vec![entry("a", "2", 99)], identity, &NoEnrichment, &pool)
            .await
            .unwrap();
        assert_eq!(report.changed, vec!["a".to_string()]);
        assert_eq!(cache.get(&"a".to_string()).await, Some(99));
    }

    #[tokio::test]
    async fn test_mapping_failure_publishes_nothing() {
        let cache = ReconcilingCache::new("widgets");
        let pool = WorkerPool::new("widgets", 2);
        cache
            .reconcile_snapshot(vec![entry("a", "1", 1)], identity, &NoEnrichment, &pool)
            .await
            .unwrap();
        let before = cache.snapshot().await;

        let result = cache
            .reconcile_snapshot(
                vec![entry("b", "1", 2), entry("c", "1", -1)],
                |_: &String, raw: i64| {
                    if raw < 0 {
                        Err(MappingError::new("widgets", "negative"))
                    } else {
                        Ok(raw)
                    }
                },
                &NoEnrichment,
                &pool,
            )
            .await;

        assert!(matches!(result, Err(ReconcileError::Mapping(_))));
        assert_eq!(*cache.snapshot().await, *before);
        assert_eq!(cache.generation(), 1);
    }

    #[tokio::test]
    async fn test_enrichment_failure_degrades_single_entity() {
        let cache = ReconcilingCache::new("widgets");
        let pool = WorkerPool::new("widgets", 4);
        let report = cache
            .reconcile_snapshot(
                vec![entry("a", "1", 1), entry("b", "1", 2)],
                identity,
                &FailOdd,
                &pool,
            )
            .await
            .unwrap();

        assert_eq!(report.enrichment_failures, vec!["a".to_string()]);
        assert_eq!(cache.get(&"a".to_string()).await, Some(-1));
        assert_eq!(cache.get(&"b".to_string()).await, Some(20));
        let entity = cache.entity(&"b".to_string()).await.unwrap();
        assert_eq!(entity.state, EntityState::Cached);
    }

    #[tokio::test]
    async fn test_missing_version_always_refreshes() {
        let cache = ReconcilingCache::new("widgets");
        let pool = WorkerPool::new("widgets", 1);
        let unversioned = || vec![SnapshotEntry::new("a".to_string(), None, 5i64)];
        cache
            .reconcile_snapshot(unversioned(), identity, &NoEnrichment, &pool)
            .await
            .unwrap();
        let report = cache
            .reconcile_snapshot(unversioned(), identity, &NoEnrichment, &pool)
            .await
            .unwrap();
        assert_eq!(report.changed, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_require_reports_not_found() {
        let cache: ReconcilingCache<String, i64> = ReconcilingCache::new("widgets");
        let err = cache.require(&"w-9".to_string()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { ref resource_type, ref id } if resource_type == "widgets" && id == "w-9"));
    }

    #[tokio::test]
    async fn test_empty_snapshot_evicts_everything() {
        let cache = ReconcilingCache::new("widgets");
        let pool = WorkerPool::new("widgets", 1);
        cache
            .reconcile_snapshot(vec![entry("a", "1", 1)], identity, &NoEnrichment, &pool)
            .await
            .unwrap();
        let report = cache
            .reconcile_snapshot(Vec::new(), identity, &NoEnrichment, &pool)
            .await
            .unwrap();
        assert_eq!(report.evicted, vec!["a".to_string()]);
        assert!(cache.is_empty().await);
    }
}
