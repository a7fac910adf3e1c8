//! Polling agent cycle

use super::source::ResourceSource;
use crate::cache::{Enricher, ReconcileError, ReconcileReport, ReconcilingCache};
use crate::error::{Error, PoolClosed};
use crate::metrics::MetricsSink;
use crate::pool::WorkerPool;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of one successful cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub resource_type: String,
    pub generation: u64,
    pub listed: usize,
    pub added: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub evicted: usize,
    pub enrichment_failures: usize,
    pub duration: Duration,
}

impl CycleReport {
    fn new(resource_type: &str, listed: usize, report: &ReconcileReport<String>, duration: Duration) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            generation: report.generation,
            listed,
            added: report.added.len(),
            changed: report.changed.len(),
            unchanged: report.unchanged.len(),
            evicted: report.evicted.len(),
            enrichment_failures: report.enrichment_failures.len(),
            duration,
        }
    }
}

/// Why a cycle was abandoned; the published snapshot is untouched in every case
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("listing {resource_type} failed: {source}")]
    List {
        resource_type: String,
        #[source]
        source: Error,
    },

    #[error("fetching {resource_type} '{id}' failed: {source}")]
    Fetch {
        resource_type: String,
        id: String,
        #[source]
        source: Error,
    },

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    PoolClosed(#[from] PoolClosed),

    /// The upstream handed back a page token it already returned
    #[error("listing {resource_type} looped: page token '{token}' repeated")]
    RepeatedPageToken { resource_type: String, token: String },

    #[error("{resource_type} cycle timed out after {timeout:?}")]
    TimedOut { resource_type: String, timeout: Duration },
}

impl CycleError {
    /// Short reason tag for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            CycleError::List { source, .. } | CycleError::Fetch { source, .. } if source.is_mapping() => "mapping",
            CycleError::List { .. } | CycleError::RepeatedPageToken { .. } => "list",
            CycleError::Fetch { .. } => "fetch",
            CycleError::Reconcile(ReconcileError::Mapping(_)) => "mapping",
            CycleError::Reconcile(_) | CycleError::PoolClosed(_) => "internal",
            CycleError::TimedOut { .. } => "timeout",
        }
    }
}

/// Scheduler-facing view of an agent
#[async_trait]
pub trait CachingAgent: Send + Sync {
    fn name(&self) -> String;

    async fn run_cycle(&self) -> Result<CycleReport, CycleError>;
}

/// Lists, fetches and reconciles one resource type
pub struct PollingAgent<S: ResourceSource> {
    source: Arc<S>,
    cache: Arc<ReconcilingCache<String, S::Value>>,
    pool: WorkerPool,
    enricher: Arc<dyn Enricher<String, S::Value>>,
    metrics: Arc<dyn MetricsSink>,
}

impl<S: ResourceSource + 'static> PollingAgent<S> {
    pub fn new(
        source: Arc<S>,
        cache: Arc<ReconcilingCache<String, S::Value>>,
        pool: WorkerPool,
        enricher: Arc<dyn Enricher<String, S::Value>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            source,
            cache,
            pool,
            enricher,
            metrics,
        }
    }

    pub fn cache(&self) -> &Arc<ReconcilingCache<String, S::Value>> {
        &self.cache
    }

    /// Every id across every page, first occurrence order
    async fn list_all(&self) -> Result<Vec<String>, CycleError> {
        let mut ids = Vec::new();
        let mut seen_ids = HashSet::new();
        let mut seen_tokens = HashSet::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = self
                .source
                .list_page(page_token.as_deref())
                .await
                .map_err(|source| CycleError::List {
                    resource_type: self.source.resource_type().to_string(),
                    source,
                })?;

            ids.extend(page.items.into_iter().filter(|id| seen_ids.insert(id.clone())));

            match page.next_token {
                Some(token) if seen_tokens.insert(token.clone()) => page_token = Some(token),
                Some(token) => {
                    return Err(CycleError::RepeatedPageToken {
                        resource_type: self.source.resource_type().to_string(),
                        token,
                    });
                },
                None => break,
            }
        }

        Ok(ids)
    }

    async fn cycle(&self) -> Result<CycleReport, CycleError> {
        let started = Instant::now();
        let resource_type = self.source.resource_type();

        let ids = self.list_all().await?;
        tracing::debug!(scope = %self.source.scope(), listed = ids.len(), "Listed ids");

        let fetched = self
            .pool
            .try_run_all(ids.iter().map(|id| async move {
                self.source
                    .fetch(id)
                    .await
                    .map_err(|source| CycleError::Fetch {
                        resource_type: resource_type.to_string(),
                        id: id.clone(),
                        source,
                    })
            }))
            .await?;
        let entries: Vec<_> = fetched.into_iter().flatten().collect();

        let source = &self.source;
        let report = self
            .cache
            .reconcile_snapshot(
                entries,
                |id: &String, raw| source.map(id, raw),
                self.enricher.as_ref(),
                &self.pool,
            )
            .await?;

        Ok(CycleReport::new(resource_type, ids.len(), &report, started.elapsed()))
    }

    fn record(&self, report: &CycleReport) {
        let tags = [("resource_type", report.resource_type.as_str())];
        self.metrics.increment("agent.cycle.added", &tags, report.added as u64);
        self.metrics.increment("agent.cycle.changed", &tags, report.changed as u64);
        self.metrics.increment("agent.cycle.unchanged", &tags, report.unchanged as u64);
        self.metrics.increment("agent.cycle.evicted", &tags, report.evicted as u64);
        self.metrics.increment(
            "agent.cycle.enrichment_failures",
            &tags,
            report.enrichment_failures as u64,
        );
        self.metrics.record_duration("agent.cycle", &tags, report.duration);
    }

    /// Run one cycle; on failure nothing is published and the next cycle starts over
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        match self.cycle().await {
            Ok(report) => {
                self.record(&report);
                tracing::info!(
                    scope = %self.source.scope(),
                    generation = report.generation,
                    added = report.added,
                    changed = report.changed,
                    evicted = report.evicted,
                    "Cycle complete"
                );
                Ok(report)
            },
            Err(e) => {
                self.metrics.increment(
                    "agent.cycle.aborted",
                    &[
                        ("resource_type", self.source.resource_type()),
                        ("reason", e.reason()),
                    ],
                    1,
                );
                tracing::error!(scope = %self.source.scope(), "Cycle aborted: {}", e);
                Err(e)
            },
        }
    }
}

#[async_trait]
impl<S: ResourceSource + 'static> CachingAgent for PollingAgent<S> {
    fn name(&self) -> String {
        self.source.scope()
    }

    async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        PollingAgent::run_cycle(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::source::Page;
    use crate::cache::{NoEnrichment, SnapshotEntry};
    use crate::error::{BackendError, MappingError};
    use crate::metrics::InMemoryMetrics;
    use std::collections::HashMap;

    /// Pages of (id, version) with optional injected failures
    struct Scripted {
        pages: Vec<Vec<(&'static str, &'static str)>>,
        failing_page: Option<usize>,
        failing_fetch: Option<&'static str>,
        /// Page that hands back its own token instead of the next one
        looping_page: Option<usize>,
    }

    fn unavailable(resource_type: &str) -> Error {
        Error::UpstreamUnavailable(BackendError {
            url: "http://cache.internal/v2/aws/widgets".to_string(),
            resource_type: resource_type.to_string(),
            id: None,
            attempts: 3,
            reason: "HTTP 503".to_string(),
        })
    }

    #[async_trait]
    impl ResourceSource for Scripted {
        type Raw = String;
        type Value = String;

        fn resource_type(&self) -> &str {
            "widgets"
        }

        async fn list_page(&self, page_token: Option<&str>) -> Result<Page<String>, Error> {
            let index: usize = page_token.map(|t| t.parse().unwrap()).unwrap_or(0);
            if self.failing_page == Some(index) {
                return Err(unavailable("widgets"));
            }
            let next_token = if self.looping_page == Some(index) {
                Some(index.to_string())
            } else {
                (index + 1 < self.pages.len()).then(|| (index + 1).to_string())
            };
            Ok(Page {
                items: self.pages[index].iter().map(|(id, _)| id.to_string()).collect(),
                next_token,
            })
        }

        async fn fetch(&self, id: &str) -> Result<Option<SnapshotEntry<String, String>>, Error> {
            if self.failing_fetch == Some(id) {
                return Err(unavailable("widgets"));
            }
            let versions: HashMap<_, _> = self.pages.iter().flatten().copied().collect();
            Ok(versions.get(id).map(|version| {
                SnapshotEntry::new(id.to_string(), Some(version.to_string()), format!("{}@{}", id, version))
            }))
        }

        fn map(&self, _id: &str, raw: String) -> Result<String, MappingError> {
            Ok(raw)
        }
    }

    fn agent(source: Scripted, cache: Arc<ReconcilingCache<String, String>>) -> (PollingAgent<Scripted>, Arc<InMemoryMetrics>) {
        let metrics = Arc::new(InMemoryMetrics::new());
        let agent = PollingAgent::new(
            Arc::new(source),
            cache,
            WorkerPool::new("widgets", 4),
            Arc::new(NoEnrichment),
            metrics.clone(),
        );
        (agent, metrics)
    }

    #[tokio::test]
    async fn test_pages_are_concatenated() {
        let cache = Arc::new(ReconcilingCache::new("widgets"));
        let (agent, metrics) = agent(
            Scripted {
                pages: vec![vec![("a", "1"), ("b", "1")], vec![("c", "1")]],
                failing_page: None,
                failing_fetch: None,
                looping_page: None,
            },
            cache.clone(),
        );

        let report = agent.run_cycle().await.unwrap();
        assert_eq!(report.listed, 3);
        assert_eq!(report.added, 3);
        assert_eq!(cache.get(&"c".to_string()).await, Some("c@1".to_string()));
        assert_eq!(metrics.counter("agent.cycle.added", &[("resource_type", "widgets")]), 3);
    }

    #[tokio::test]
    async fn test_failed_page_leaves_cache_untouched() {
        let cache = Arc::new(ReconcilingCache::new("widgets"));
        let (first, _) = agent(
            Scripted {
                pages: vec![vec![("a", "1")], vec![("b", "1")]],
                failing_page: None,
                failing_fetch: None,
                looping_page: None,
            },
            cache.clone(),
        );
        first.run_cycle().await.unwrap();
        let before = cache.snapshot().await;

        let (second, metrics) = agent(
            Scripted {
                pages: vec![vec![("c", "1")], vec![("d", "1")]],
                failing_page: Some(1),
                failing_fetch: None,
                looping_page: None,
            },
            cache.clone(),
        );
        let err = second.run_cycle().await.unwrap_err();
        assert!(matches!(err, CycleError::List { .. }));
        assert_eq!(*cache.snapshot().await, *before);
        assert_eq!(
            metrics.counter("agent.cycle.aborted", &[("resource_type", "widgets"), ("reason", "list")]),
            1
        );
    }

    #[tokio::test]
    async fn test_failed_fetch_aborts_cycle() {
        let cache = Arc::new(ReconcilingCache::new("widgets"));
        let (agent, _) = agent(
            Scripted {
                pages: vec![vec![("a", "1"), ("b", "1")]],
                failing_page: None,
                failing_fetch: Some("b"),
                looping_page: None,
            },
            cache.clone(),
        );
        let err = agent.run_cycle().await.unwrap_err();
        assert!(matches!(err, CycleError::Fetch { ref id, .. } if id == "b"));
        assert!(cache.is_empty().await);
        assert_eq!(cache.generation(), 0);
    }

    #[tokio::test]
    async fn test_looping_listing_aborts_without_eviction() {
        let cache = Arc::new(ReconcilingCache::new("widgets"));
        let (first, _) = agent(
            Scripted {
                pages: vec![vec![("a", "1")], vec![("b", "1")]],
                failing_page: None,
                failing_fetch: None,
                looping_page: None,
            },
            cache.clone(),
        );
        first.run_cycle().await.unwrap();
        let before = cache.snapshot().await;

        let (second, metrics) = agent(
            Scripted {
                pages: vec![vec![("a", "1")], vec![("c", "1")]],
                failing_page: None,
                failing_fetch: None,
                looping_page: Some(1),
            },
            cache.clone(),
        );
        let err = second.run_cycle().await.unwrap_err();
        assert!(matches!(err, CycleError::RepeatedPageToken { ref token, .. } if token == "1"));
        assert_eq!(err.reason(), "list");
        assert_eq!(*cache.snapshot().await, *before);
        assert_eq!(cache.generation(), 1);
        assert_eq!(
            metrics.counter("agent.cycle.aborted", &[("resource_type", "widgets"), ("reason", "list")]),
            1
        );
    }
}
