//! Staged workflow execution over a registry of capability-tagged agents.
//!
//! A submission is compiled into a [`Workflow`] of ordered stages. The
//! [`ExecutionEngine`] runs the stages one after another, resolving every
//! task to an agent through the [`CapabilityRegistry`] and running the tasks
//! of a stage concurrently. Each invocation is wrapped by the
//! [`RetryManager`], and every step lands in the metrics, the audit trail and
//! the queryable workflow store.
//!
//! # Main types
//!
//! - [`ExecutionEngine`] — Drives workflows stage by stage and answers status queries.
//! - [`WorkflowCompiler`] — Validates submissions and builds executable workflows.
//! - [`CapabilityRegistry`] — Maps required capabilities to eligible [`Agent`]s.
//! - [`RetryManager`] — Classifies failures and schedules backoff retries.
//! - [`MetricsCollector`] — Atomic counters and per-capability duration histograms.
//! - [`EngineConfig`] — The single configuration value an engine is built from.

/// Submission format and workflow compilation.
pub mod compiler;
/// Engine configuration.
pub mod config;
/// Stage-by-stage execution engine.
pub mod engine;
/// Counters and duration histograms.
pub mod metrics;
/// Agent contract and capability registry.
pub mod registry;
/// Failure classification and backoff.
pub mod retry;
/// In-memory workflow state, keyed by workflow id.
pub mod store;
/// Workflow, stage and task model plus result types.
pub mod types;

pub use compiler::{StageSpec, TaskSpec, WorkflowCompiler, WorkflowSpec};
pub use config::{AuditConfig, EngineConfig, StageFailurePolicy};
pub use engine::ExecutionEngine;
pub use metrics::{HistogramSnapshot, MetricsCollector, MetricsSnapshot, DURATION_BUCKETS_MS};
pub use registry::{Agent, CapabilityRegistry};
pub use retry::{InvocationOutcome, RetryEvent, RetryManager, RetryPolicy};
pub use store::{WorkflowStore, WorkflowSummary};
pub use types::{
    Stage, StageReport, Status, Task, TaskFailure, TaskOutcome, Workflow, WorkflowResult,
    WorkflowStatusReport,
};
