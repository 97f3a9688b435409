use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default number of entries retained in memory.
pub const DEFAULT_AUDIT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    /// Who acted: `"engine"`, an agent id, `"registry"`, ...
    pub actor: String,
    /// Dotted action name, e.g. `task.retry`.
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    pub details: serde_json::Value,
    pub outcome: AuditOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    Info,
}

impl AuditEntry {
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        details: serde_json::Value,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            actor: actor.into(),
            action: action.into(),
            workflow_id: None,
            details,
            outcome,
        }
    }

    pub fn for_workflow(mut self, workflow_id: Uuid) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }
}

/// External destination for audit entries (SIEM, file, message bus).
///
/// Forwarding is fire-and-forget from the caller's point of view: errors
/// returned here are counted and recorded locally, never propagated.
#[async_trait]
pub trait AuditSink: Send + Sync {
    fn name(&self) -> &str;

    async fn forward(&self, entry: &AuditEntry) -> ConductorResult<()>;
}

/// Appends each entry as one JSON line to a file.
pub struct JsonlFileSink {
    path: PathBuf,
}

impl JsonlFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AuditSink for JsonlFileSink {
    fn name(&self) -> &str {
        "jsonl-file"
    }

    async fn forward(&self, entry: &AuditEntry) -> ConductorResult<()> {
        use tokio::io::AsyncWriteExt;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

/// Read-only selection over the retained entries. Unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub actor: Option<String>,
    pub action_prefix: Option<String>,
    pub workflow_id: Option<Uuid>,
    pub since: Option<DateTime<Utc>>,
    /// Keep only the most recent `limit` matches.
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn workflow(workflow_id: Uuid) -> Self {
        Self {
            workflow_id: Some(workflow_id),
            ..Self::default()
        }
    }

    pub fn action(prefix: impl Into<String>) -> Self {
        Self {
            action_prefix: Some(prefix.into()),
            ..Self::default()
        }
    }

    fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(actor) = &self.actor {
            if &entry.actor != actor {
                return false;
            }
        }
        if let Some(prefix) = &self.action_prefix {
            if !entry.action.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(id) = self.workflow_id {
            if entry.workflow_id != Some(id) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.timestamp < since {
                return false;
            }
        }
        true
    }
}

struct Ring {
    entries: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
    forward_failures: AtomicU64,
}

impl Ring {
    fn push(&self, entry: AuditEntry) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    fn record_forward_failure(&self, sink: &str, entry: &AuditEntry, err: &ConductorError) {
        self.forward_failures.fetch_add(1, Ordering::Relaxed);
        warn!(sink = %sink, action = %entry.action, error = %err, "Audit forward failed");
        let mut local = AuditEntry::new(
            "audit",
            "audit.forward_failed",
            serde_json::json!({
                "sink": sink,
                "action": entry.action,
                "error": err.to_string(),
            }),
            AuditOutcome::Failure,
        );
        local.workflow_id = entry.workflow_id;
        self.push(local);
    }
}

/// Bounded, append-only audit trail of orchestration actions.
///
/// Holds the most recent `capacity` entries; the oldest is evicted on each
/// insert once full. With a sink attached every appended entry is also
/// queued for a background task that forwards it. The queue holds at most
/// `capacity` entries; anything that does not fit is dropped and counted
/// as a forward failure.
pub struct AuditLog {
    ring: Arc<Ring>,
    tx: Option<mpsc::Sender<AuditEntry>>,
}

impl AuditLog {
    /// Create an in-memory audit log. A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Arc::new(Ring {
                entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
                capacity: capacity.max(1),
                forward_failures: AtomicU64::new(0),
            }),
            tx: None,
        }
    }

    /// Create an audit log that also forwards every entry to `sink`.
    ///
    /// Spawns the forwarding task on the current tokio runtime and fails
    /// with a config error when called outside one.
    pub fn with_sink(capacity: usize, sink: Arc<dyn AuditSink>) -> ConductorResult<Self> {
        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            ConductorError::Config(format!("audit sink requires a tokio runtime: {e}"))
        })?;

        let mut log = Self::new(capacity);
        let (tx, mut rx) = mpsc::channel::<AuditEntry>(log.ring.capacity);
        let ring = log.ring.clone();

        handle.spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(e) = sink.forward(&entry).await {
                    ring.record_forward_failure(sink.name(), &entry, &e);
                }
            }
            debug!(sink = %sink.name(), "Audit forwarder stopped");
        });

        log.tx = Some(tx);
        Ok(log)
    }

    /// Append an entry. Never blocks on the sink and never fails.
    pub fn append(&self, entry: AuditEntry) {
        info!(
            actor = %entry.actor,
            action = %entry.action,
            outcome = ?entry.outcome,
            "audit"
        );
        if let Some(tx) = &self.tx {
            let reason = match tx.try_send(entry.clone()) {
                Ok(()) => None,
                Err(mpsc::error::TrySendError::Full(_)) => Some("audit forward queue is full"),
                Err(mpsc::error::TrySendError::Closed(_)) => Some("audit forwarder is gone"),
            };
            if let Some(reason) = reason {
                self.ring.record_forward_failure(
                    "channel",
                    &entry,
                    &ConductorError::Internal(reason.into()),
                );
            }
        }
        self.ring.push(entry);
    }

    pub fn log_action(
        &self,
        actor: impl Into<String>,
        action: impl Into<String>,
        workflow_id: Option<Uuid>,
        details: serde_json::Value,
        outcome: AuditOutcome,
    ) {
        let mut entry = AuditEntry::new(actor, action, details, outcome);
        entry.workflow_id = workflow_id;
        self.append(entry);
    }

    /// Entries matching `filter`, oldest first.
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        let entries = self.ring.entries.lock();
        let mut matched: Vec<AuditEntry> = entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }

    pub fn len(&self) -> usize {
        self.ring.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }

    /// Number of entries the sink (or channel) failed to accept.
    pub fn forward_failures(&self) -> u64 {
        self.ring.forward_failures.load(Ordering::Relaxed)
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn entry(i: usize) -> AuditEntry {
        AuditEntry::new(
            "engine",
            format!("action_{i}"),
            serde_json::json!({ "index": i }),
            AuditOutcome::Info,
        )
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let log = AuditLog::new(3);
        for i in 0..5 {
            log.append(entry(i));
        }
        assert_eq!(log.len(), 3);
        let actions: Vec<String> = log
            .query(&AuditFilter::default())
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["action_2", "action_3", "action_4"]);
    }

    #[test]
    fn test_filter_by_workflow_and_prefix() {
        let log = AuditLog::new(10);
        let wf = Uuid::new_v4();
        log.append(entry(0).for_workflow(wf));
        log.append(AuditEntry::new(
            "engine",
            "task.retry",
            serde_json::json!({}),
            AuditOutcome::Info,
        ));
        log.append(
            AuditEntry::new("engine", "task.failed", serde_json::json!({}), AuditOutcome::Failure)
                .for_workflow(wf),
        );

        assert_eq!(log.query(&AuditFilter::workflow(wf)).len(), 2);
        assert_eq!(log.query(&AuditFilter::action("task.")).len(), 2);

        let both = AuditFilter {
            workflow_id: Some(wf),
            action_prefix: Some("task.".into()),
            ..AuditFilter::default()
        };
        let hits = log.query(&both);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].action, "task.failed");
    }

    #[test]
    fn test_limit_keeps_most_recent() {
        let log = AuditLog::new(10);
        for i in 0..6 {
            log.append(entry(i));
        }
        let filter = AuditFilter {
            limit: Some(2),
            ..AuditFilter::default()
        };
        let hits = log.query(&filter);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].action, "action_4");
        assert_eq!(hits[1].action, "action_5");
    }

    #[test]
    fn test_zero_capacity_is_bumped() {
        let log = AuditLog::new(0);
        log.append(entry(0));
        log.append(entry(1));
        assert_eq!(log.capacity(), 1);
        assert_eq!(log.len(), 1);
    }

    struct StalledSink;

    #[async_trait]
    impl AuditSink for StalledSink {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn forward(&self, _entry: &AuditEntry) -> ConductorResult<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stalled_sink_drops_overflow_without_blocking() {
        let log = AuditLog::with_sink(4, Arc::new(StalledSink)).unwrap();
        let started = std::time::Instant::now();
        for i in 0..20 {
            log.append(entry(i));
        }
        // Let the forwarder pick up its first entry and stall on it.
        tokio::task::yield_now().await;
        for i in 20..40 {
            log.append(entry(i));
        }
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        assert!(log.forward_failures() >= 20);
        assert_eq!(log.len(), 4);
        let dropped = log.query(&AuditFilter::action("audit.forward_failed"));
        assert!(!dropped.is_empty());
        assert_eq!(dropped[0].actor, "audit");
    }

    #[test]
    fn test_with_sink_needs_runtime() {
        let sink = Arc::new(JsonlFileSink::new("/tmp/never-written.jsonl"));
        assert!(AuditLog::with_sink(4, sink).is_err());
    }
}
