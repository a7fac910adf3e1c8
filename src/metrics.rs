//! Metrics sinks
//!
//! Counters and timers are handed to a [`MetricsSink`]; where they end up is
//! up to the hosting process.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Tag list attached to a metric
pub type Tags<'a> = &'a [(&'a str, &'a str)];

/// Destination for counters and timings
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str, tags: Tags<'_>, by: u64);

    fn record_duration(&self, name: &str, tags: Tags<'_>, elapsed: Duration);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &str, _tags: Tags<'_>, _by: u64) {}

    fn record_duration(&self, _name: &str, _tags: Tags<'_>, _elapsed: Duration) {}
}

/// Emits metrics as tracing events on the `cloudcache::metrics` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment(&self, name: &str, tags: Tags<'_>, by: u64) {
        tracing::debug!(target: "cloudcache::metrics", metric = name, tags = ?tags, by, "counter");
    }

    fn record_duration(&self, name: &str, tags: Tags<'_>, elapsed: Duration) {
        tracing::debug!(
            target: "cloudcache::metrics",
            metric = name,
            tags = ?tags,
            elapsed_ms = elapsed.as_millis() as u64,
            "timer"
        );
    }
}

/// Keeps counter totals in memory, keyed by metric name and sorted tags
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<BTreeMap<String, u64>>,
    timers: Mutex<BTreeMap<String, Vec<Duration>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total for a counter with exactly these tags
    pub fn counter(&self, name: &str, tags: Tags<'_>) -> u64 {
        let key = metric_key(name, tags);
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    /// Total for a counter summed over every tag combination
    pub fn counter_total(&self, name: &str) -> u64 {
        let prefix = format!("{}{{", name);
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, value)| *value)
            .sum()
    }

    /// Number of recorded timings for a timer with exactly these tags
    pub fn timer_count(&self, name: &str, tags: Tags<'_>) -> usize {
        let key = metric_key(name, tags);
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &str, tags: Tags<'_>, by: u64) {
        let key = metric_key(name, tags);
        *self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_insert(0) += by;
    }

    fn record_duration(&self, name: &str, tags: Tags<'_>, elapsed: Duration) {
        let key = metric_key(name, tags);
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default()
            .push(elapsed);
    }
}

fn metric_key(name: &str, tags: Tags<'_>) -> String {
    let mut sorted: Vec<_> = tags.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    sorted.sort();
    format!("{}{{{}}}", name, sorted.join(","))
}
