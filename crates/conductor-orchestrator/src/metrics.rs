use conductor_core::ErrorKind;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Upper bounds (inclusive, milliseconds) of the duration histogram buckets.
/// A final overflow bucket catches everything above the last bound.
pub const DURATION_BUCKETS_MS: [u64; 7] = [10, 50, 100, 250, 500, 1000, 5000];

const ERROR_KINDS: [ErrorKind; 8] = [
    ErrorKind::Validation,
    ErrorKind::NoCapableAgent,
    ErrorKind::Resource,
    ErrorKind::Timeout,
    ErrorKind::AgentExecution,
    ErrorKind::Cancelled,
    ErrorKind::Config,
    ErrorKind::Internal,
];

fn kind_index(kind: ErrorKind) -> usize {
    match kind {
        ErrorKind::Validation => 0,
        ErrorKind::NoCapableAgent => 1,
        ErrorKind::Resource => 2,
        ErrorKind::Timeout => 3,
        ErrorKind::AgentExecution => 4,
        ErrorKind::Cancelled => 5,
        ErrorKind::Config => 6,
        ErrorKind::Internal => 7,
    }
}

#[derive(Default)]
struct Histogram {
    buckets: [AtomicU64; DURATION_BUCKETS_MS.len() + 1],
    count: AtomicU64,
    sum_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl Histogram {
    fn observe(&self, ms: u64) {
        let idx = DURATION_BUCKETS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(DURATION_BUCKETS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            count: self.count.load(Ordering::Relaxed),
            sum_ms: self.sum_ms.load(Ordering::Relaxed),
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of one duration histogram.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    /// Counts per bucket, aligned with [`DURATION_BUCKETS_MS`] plus overflow.
    pub buckets: Vec<u64>,
    pub count: u64,
    pub sum_ms: u64,
    pub max_ms: u64,
}

impl HistogramSnapshot {
    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_ms as f64 / self.count as f64
        }
    }
}

/// Read-only projection of the collector's state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub workflows_started: u64,
    pub workflows_completed: u64,
    pub workflows_failed: u64,
    /// Started but not yet terminal.
    pub workflows_active: u64,
    pub tasks_total: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    /// Terminal task failures by kind. Kinds never seen are omitted.
    pub errors_by_kind: BTreeMap<ErrorKind, u64>,
    /// Agent-invocation duration per required capability.
    pub task_duration_ms: BTreeMap<String, HistogramSnapshot>,
}

/// Counters and histograms updated from every task completion path.
///
/// All updates are atomic increments. The histogram map takes a write lock
/// only the first time a capability is seen.
#[derive(Default)]
pub struct MetricsCollector {
    workflows_started: AtomicU64,
    workflows_completed: AtomicU64,
    workflows_failed: AtomicU64,
    tasks_total: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_retried: AtomicU64,
    errors_by_kind: [AtomicU64; ERROR_KINDS.len()],
    durations: RwLock<HashMap<String, Arc<Histogram>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workflow_started(&self) {
        self.workflows_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn workflow_completed(&self) {
        self.workflows_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn workflow_failed(&self) {
        self.workflows_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count tasks entering execution (one per task, not per attempt).
    pub fn tasks_submitted(&self, n: usize) {
        self.tasks_total.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn task_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_failed(&self, kind: ErrorKind) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        self.errors_by_kind[kind_index(kind)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_retried(&self) {
        self.tasks_retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one task's duration under each of its capabilities.
    pub fn record_duration<'a>(
        &self,
        capabilities: impl IntoIterator<Item = &'a str>,
        duration: Duration,
    ) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        for cap in capabilities {
            self.histogram(cap).observe(ms);
        }
    }

    fn histogram(&self, capability: &str) -> Arc<Histogram> {
        if let Some(h) = self.durations.read().get(capability) {
            return h.clone();
        }
        self.durations
            .write()
            .entry(capability.to_string())
            .or_default()
            .clone()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let started = self.workflows_started.load(Ordering::Relaxed);
        let completed = self.workflows_completed.load(Ordering::Relaxed);
        let failed = self.workflows_failed.load(Ordering::Relaxed);

        let errors_by_kind = ERROR_KINDS
            .iter()
            .zip(self.errors_by_kind.iter())
            .filter_map(|(kind, count)| {
                let n = count.load(Ordering::Relaxed);
                (n > 0).then_some((*kind, n))
            })
            .collect();

        let task_duration_ms = self
            .durations
            .read()
            .iter()
            .map(|(cap, h)| (cap.clone(), h.snapshot()))
            .collect();

        MetricsSnapshot {
            workflows_started: started,
            workflows_completed: completed,
            workflows_failed: failed,
            workflows_active: started.saturating_sub(completed + failed),
            tasks_total: self.tasks_total.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_retried: self.tasks_retried.load(Ordering::Relaxed),
            errors_by_kind,
            task_duration_ms,
        }
    }

    /// Serialize the current snapshot as JSON (for dashboards and exporters).
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_snapshot_is_zero() {
        let metrics = MetricsCollector::new();
        let snap = metrics.snapshot();
        assert_eq!(snap, MetricsSnapshot::default());
    }

    #[test]
    fn test_counters_and_active_gauge() {
        let metrics = MetricsCollector::new();
        metrics.workflow_started();
        metrics.workflow_started();
        metrics.workflow_completed();
        metrics.tasks_submitted(3);
        metrics.task_completed();
        metrics.task_failed(ErrorKind::Resource);
        metrics.task_failed(ErrorKind::NoCapableAgent);
        metrics.task_retried();

        let snap = metrics.snapshot();
        assert_eq!(snap.workflows_started, 2);
        assert_eq!(snap.workflows_active, 1);
        assert_eq!(snap.tasks_total, 3);
        assert_eq!(snap.tasks_failed, 2);
        assert_eq!(snap.tasks_retried, 1);
        assert_eq!(snap.errors_by_kind.get(&ErrorKind::Resource), Some(&1));
        assert_eq!(snap.errors_by_kind.get(&ErrorKind::NoCapableAgent), Some(&1));
        assert!(!snap.errors_by_kind.contains_key(&ErrorKind::Timeout));
    }

    #[test]
    fn test_histogram_buckets() {
        let metrics = MetricsCollector::new();
        for ms in [5, 10, 11, 300, 9_000] {
            metrics.record_duration(["code_gen"], Duration::from_millis(ms));
        }
        let snap = metrics.snapshot();
        let h = &snap.task_duration_ms["code_gen"];
        assert_eq!(h.count, 5);
        assert_eq!(h.max_ms, 9_000);
        assert_eq!(h.sum_ms, 9_326);
        assert_eq!(h.buckets, vec![2, 1, 0, 0, 1, 0, 0, 1]);
    }

    #[test]
    fn test_concurrent_updates() {
        let metrics = Arc::new(MetricsCollector::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.task_completed();
                        m.record_duration(["x", "y"], Duration::from_millis(1));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.tasks_completed, 8000);
        assert_eq!(snap.task_duration_ms["x"].count, 8000);
        assert_eq!(snap.task_duration_ms["y"].count, 8000);
    }

    #[test]
    fn test_to_json() {
        let metrics = MetricsCollector::new();
        metrics.task_failed(ErrorKind::Timeout);
        let json = metrics.to_json();
        assert_eq!(json["tasks_failed"], 1);
        assert_eq!(json["errors_by_kind"]["timeout"], 1);
    }
}
