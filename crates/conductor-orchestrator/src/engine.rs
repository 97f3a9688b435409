use crate::compiler::{WorkflowCompiler, WorkflowSpec};
use crate::config::{EngineConfig, StageFailurePolicy};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::registry::{Agent, CapabilityRegistry};
use crate::retry::{RetryEvent, RetryManager};
use crate::store::{WorkflowStore, WorkflowSummary};
use crate::types::{
    StageReport, Status, Task, TaskFailure, Workflow, WorkflowResult, WorkflowStatusReport,
};
use conductor_core::{ConductorError, ConductorResult, ErrorKind, Parameters};
use conductor_security::{AuditEntry, AuditFilter, AuditLog, AuditOutcome, CapabilitySet};
use serde_json::json;
use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const ACTOR: &str = "engine";

/// One resolved task of a stage: which agent runs it and at what priority.
/// Rebuilt for every stage, never stored.
struct PlanEntry {
    /// Position of the task within its stage.
    index: usize,
    task_id: String,
    capabilities: CapabilitySet,
    parameters: Parameters,
    max_retries: u32,
    priority: i64,
    agent: Arc<dyn Agent>,
}

/// State shared between the engine handle and its in-flight tasks.
struct Shared {
    config: EngineConfig,
    registry: Arc<CapabilityRegistry>,
    retry: RetryManager,
    metrics: MetricsCollector,
    audit: Arc<AuditLog>,
    store: WorkflowStore,
    permits: Arc<Semaphore>,
}

/// Drives compiled workflows stage by stage.
///
/// Tasks within a stage run concurrently on the tokio runtime, bounded by
/// `max_concurrency` across every workflow this engine runs. Each agent
/// invocation goes through the [`RetryManager`]. Counters, audit entries and
/// the per-workflow status record are updated as tasks finish.
///
/// The handle is cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ExecutionEngine {
    shared: Arc<Shared>,
    compiler: WorkflowCompiler,
}

impl ExecutionEngine {
    /// Create an engine with an in-memory audit log sized from `config`.
    pub fn new(config: EngineConfig, registry: Arc<CapabilityRegistry>) -> ConductorResult<Self> {
        let audit = Arc::new(AuditLog::new(config.audit.capacity));
        Self::with_audit(config, registry, audit)
    }

    /// Create an engine writing to a caller-supplied audit log (for example
    /// one forwarding to a sink).
    pub fn with_audit(
        config: EngineConfig,
        registry: Arc<CapabilityRegistry>,
        audit: Arc<AuditLog>,
    ) -> ConductorResult<Self> {
        config.validate()?;
        info!(
            max_concurrency = config.max_concurrency,
            base_delay_ms = config.retry.base_delay_ms,
            cap_delay_ms = config.retry.cap_delay_ms,
            policy = ?config.stage_failure_policy,
            "Execution engine ready"
        );
        Ok(Self {
            compiler: WorkflowCompiler::new(config.default_max_retries),
            shared: Arc::new(Shared {
                permits: Arc::new(Semaphore::new(config.max_concurrency)),
                retry: RetryManager::new(config.retry.clone()),
                metrics: MetricsCollector::new(),
                store: WorkflowStore::new(),
                registry,
                audit,
                config,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.shared.registry
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.shared.audit
    }

    /// Register an agent and record it in the audit trail.
    pub fn register_agent(&self, agent: &Arc<dyn Agent>) -> ConductorResult<()> {
        self.shared.registry.register(agent)?;
        self.shared.audit.log_action(
            ACTOR,
            "agent.registered",
            None,
            json!({
                "agent_id": agent.id(),
                "name": agent.name(),
                "capabilities": agent.capabilities().to_vec(),
            }),
            AuditOutcome::Success,
        );
        Ok(())
    }

    /// Deregister an agent. Returns `false` if it was unknown.
    pub fn deregister_agent(&self, agent_id: &str) -> bool {
        let removed = self.shared.registry.deregister(agent_id);
        if removed {
            self.shared.audit.log_action(
                ACTOR,
                "agent.deregistered",
                None,
                json!({ "agent_id": agent_id }),
                AuditOutcome::Success,
            );
        }
        removed
    }

    /// Validate a submission, using this engine's default retry budget.
    pub fn compile(&self, spec: &WorkflowSpec) -> ConductorResult<Workflow> {
        self.compiler.compile(spec)
    }

    pub fn compile_json(&self, json: &str) -> ConductorResult<Workflow> {
        self.compiler.compile_json(json)
    }

    /// Compile and run a submission. Validation errors surface before any
    /// task is dispatched.
    pub async fn run(&self, spec: &WorkflowSpec) -> ConductorResult<WorkflowResult> {
        let workflow = self.compile(spec)?;
        self.orchestrate(workflow).await
    }

    pub async fn run_json(&self, json: &str) -> ConductorResult<WorkflowResult> {
        let workflow = self.compile_json(json)?;
        self.orchestrate(workflow).await
    }

    /// Execute a compiled workflow to completion.
    pub async fn orchestrate(&self, workflow: Workflow) -> ConductorResult<WorkflowResult> {
        self.orchestrate_with_cancel(workflow, CancellationToken::new())
            .await
    }

    /// Execute a compiled workflow, stopping early if `cancel` fires.
    ///
    /// Task failures never make this return `Err`; they are reported on the
    /// result. `Err` means the workflow could not be accepted (already
    /// submitted, not pending) or an engine invariant broke.
    pub async fn orchestrate_with_cancel(
        &self,
        workflow: Workflow,
        cancel: CancellationToken,
    ) -> ConductorResult<WorkflowResult> {
        if workflow.status != Status::Pending {
            return Err(ConductorError::Validation(format!(
                "workflow {} is {} and cannot be orchestrated",
                workflow.id, workflow.status
            )));
        }
        let workflow_id = workflow.id;
        let name = workflow.name.clone();
        let stage_count = workflow.stages.len();
        let task_count = workflow.task_count();

        self.shared.store.insert(workflow)?;
        self.shared.store.mark_running(workflow_id)?;
        let start = Instant::now();

        self.shared.metrics.workflow_started();
        self.shared.audit.log_action(
            ACTOR,
            "workflow.started",
            Some(workflow_id),
            json!({ "name": name, "stages": stage_count, "tasks": task_count }),
            AuditOutcome::Info,
        );
        info!(
            workflow_id = %workflow_id,
            workflow = %name,
            stages = stage_count,
            tasks = task_count,
            "Workflow started"
        );

        match self.drive(workflow_id, stage_count, &cancel).await {
            Ok((status, cancelled)) => {
                self.shared.store.mark_terminal(workflow_id, status)?;
                let result = self.build_result(workflow_id, cancelled, start)?;
                self.record_workflow_end(&result);
                Ok(result)
            }
            Err(e) => {
                error!(workflow_id = %workflow_id, error = %e, "Workflow aborted by engine fault");
                if self
                    .shared
                    .store
                    .mark_terminal(workflow_id, Status::Failed)
                    .is_ok()
                {
                    self.shared.metrics.workflow_failed();
                }
                self.shared.audit.log_action(
                    ACTOR,
                    "workflow.aborted",
                    Some(workflow_id),
                    json!({ "error": e.to_string() }),
                    AuditOutcome::Failure,
                );
                Err(e)
            }
        }
    }

    /// Run stages in order. Returns the workflow's terminal status and
    /// whether a cancellation stopped it.
    async fn drive(
        &self,
        workflow_id: Uuid,
        stage_count: usize,
        cancel: &CancellationToken,
    ) -> ConductorResult<(Status, bool)> {
        let mut any_failed = false;

        for stage_idx in 0..stage_count {
            if cancel.is_cancelled() {
                info!(workflow_id = %workflow_id, stage = stage_idx, "Cancelled at stage boundary");
                self.shared.audit.log_action(
                    ACTOR,
                    "workflow.cancelled",
                    Some(workflow_id),
                    json!({ "next_stage": stage_idx }),
                    AuditOutcome::Info,
                );
                return Ok((Status::Failed, true));
            }

            let stage_status = self.run_stage(workflow_id, stage_idx, cancel).await?;
            if stage_status == Status::Failed {
                any_failed = true;
                if self.shared.config.stage_failure_policy == StageFailurePolicy::Halt {
                    info!(
                        workflow_id = %workflow_id,
                        stage = stage_idx,
                        skipped = stage_count - stage_idx - 1,
                        "Stage failed, halting workflow"
                    );
                    break;
                }
            }
        }

        let status = if any_failed {
            Status::Failed
        } else {
            Status::Completed
        };
        Ok((status, false))
    }

    /// Plan, dispatch and collect one stage. Returns its terminal status.
    async fn run_stage(
        &self,
        workflow_id: Uuid,
        stage_idx: usize,
        cancel: &CancellationToken,
    ) -> ConductorResult<Status> {
        let shared = &self.shared;
        shared.store.start_stage(workflow_id, stage_idx)?;
        let (stage_name, tasks) = shared.store.read(workflow_id, |wf| {
            wf.stages
                .get(stage_idx)
                .map(|s| (s.name.clone(), s.tasks.clone()))
        })?
        .ok_or_else(|| ConductorError::Internal(format!("stage {stage_idx} vanished")))?;

        shared.metrics.tasks_submitted(tasks.len());
        shared.audit.log_action(
            ACTOR,
            "stage.started",
            Some(workflow_id),
            json!({ "stage": stage_idx, "name": stage_name, "tasks": tasks.len() }),
            AuditOutcome::Info,
        );
        info!(workflow_id = %workflow_id, stage = %stage_name, tasks = tasks.len(), "Stage started");

        let plan = self.plan_stage(workflow_id, stage_idx, tasks)?;
        let mut running = JoinSet::new();

        for entry in plan {
            // Waiting for the permit here, not inside the spawned task, keeps
            // dispatch in priority order under a tight limit.
            let permit = shared
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| ConductorError::Internal("concurrency limiter closed".into()))?;

            let agent_id = entry.agent.id().to_string();
            shared
                .store
                .update_task(workflow_id, stage_idx, entry.index, |t| {
                    t.agent_id = Some(agent_id.clone());
                    t.transition(Status::Running)
                })?;
            debug!(
                workflow_id = %workflow_id,
                task_id = %entry.task_id,
                agent = %agent_id,
                priority = entry.priority,
                "Task dispatched"
            );

            let shared = Arc::clone(shared);
            let cancel = cancel.clone();
            running.spawn(async move {
                let _permit = permit;
                shared.run_task(workflow_id, stage_idx, entry, cancel).await
            });
        }

        let mut fault = None;
        let mut panicked = None;
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    fault.get_or_insert(e);
                }
                // Siblings still in flight run to completion before the
                // panic resumes.
                Err(e) if e.is_panic() => {
                    panicked.get_or_insert(e.into_panic());
                }
                Err(e) => {
                    fault.get_or_insert(ConductorError::Internal(format!(
                        "task runner did not finish: {e}"
                    )));
                }
            }
        }
        if let Some(payload) = panicked {
            self.abort_after_panic(workflow_id, stage_idx, &stage_name);
            std::panic::resume_unwind(payload);
        }
        if let Some(e) = fault {
            return Err(e);
        }

        let status = shared.store.finish_stage(workflow_id, stage_idx)?;
        let (action, outcome) = match status {
            Status::Completed => ("stage.completed", AuditOutcome::Success),
            _ => ("stage.failed", AuditOutcome::Failure),
        };
        shared.audit.log_action(
            ACTOR,
            action,
            Some(workflow_id),
            json!({ "stage": stage_idx, "name": stage_name }),
            outcome,
        );
        info!(workflow_id = %workflow_id, stage = %stage_name, status = %status, "Stage finished");
        Ok(status)
    }

    /// Close out a stage and its workflow after an agent panicked, leaving
    /// the store and counters terminal before the panic resumes.
    fn abort_after_panic(&self, workflow_id: Uuid, stage_idx: usize, stage_name: &str) {
        let shared = &self.shared;
        let failure = TaskFailure::from(&ConductorError::Internal("agent panicked".into()));

        match shared.store.fail_open_tasks(workflow_id, stage_idx, &failure) {
            Ok(task_ids) => {
                for task_id in task_ids {
                    shared.metrics.task_failed(failure.kind);
                    shared.audit.log_action(
                        ACTOR,
                        "task.failed",
                        Some(workflow_id),
                        json!({ "task_id": task_id, "kind": failure.kind, "error": failure.message }),
                        AuditOutcome::Failure,
                    );
                }
            }
            Err(e) => error!(workflow_id = %workflow_id, error = %e, "Could not fail panicked tasks"),
        }
        if let Err(e) = shared.store.finish_stage(workflow_id, stage_idx) {
            error!(workflow_id = %workflow_id, error = %e, "Could not close panicked stage");
        }
        shared.audit.log_action(
            ACTOR,
            "stage.failed",
            Some(workflow_id),
            json!({ "stage": stage_idx, "name": stage_name }),
            AuditOutcome::Failure,
        );
        if shared.store.mark_terminal(workflow_id, Status::Failed).is_ok() {
            shared.metrics.workflow_failed();
        }
        shared.audit.log_action(
            ACTOR,
            "workflow.aborted",
            Some(workflow_id),
            json!({ "error": failure.message, "stage": stage_idx }),
            AuditOutcome::Failure,
        );
        error!(workflow_id = %workflow_id, stage = %stage_name, "Agent panicked, workflow aborted");
    }

    /// Resolve an agent for every task. Tasks nobody can run fail here
    /// without an attempt; the rest come back highest priority first.
    fn plan_stage(
        &self,
        workflow_id: Uuid,
        stage_idx: usize,
        tasks: Vec<Task>,
    ) -> ConductorResult<Vec<PlanEntry>> {
        let shared = &self.shared;
        let mut plan = Vec::with_capacity(tasks.len());

        for (index, task) in tasks.into_iter().enumerate() {
            match shared.registry.resolve(&task.id, &task.required_capabilities) {
                Ok(agent) => plan.push(PlanEntry {
                    index,
                    task_id: task.id,
                    capabilities: task.required_capabilities,
                    parameters: task.parameters,
                    max_retries: task.max_retries,
                    priority: task.priority,
                    agent,
                }),
                Err(err) => {
                    let failure = TaskFailure::from(&err);
                    shared.store.update_task(workflow_id, stage_idx, index, |t| {
                        t.transition(Status::Running)?;
                        t.failure = Some(failure.clone());
                        t.transition(Status::Failed)
                    })?;
                    shared.metrics.task_failed(failure.kind);
                    shared.audit.log_action(
                        ACTOR,
                        "task.failed",
                        Some(workflow_id),
                        json!({
                            "task_id": task.id,
                            "kind": failure.kind,
                            "error": failure.message,
                            "attempts": 0,
                        }),
                        AuditOutcome::Failure,
                    );
                    warn!(
                        workflow_id = %workflow_id,
                        task_id = %task.id,
                        required = ?task.required_capabilities.to_vec(),
                        "No capable agent"
                    );
                }
            }
        }

        plan.sort_by_key(|entry| Reverse(entry.priority));
        Ok(plan)
    }

    fn build_result(
        &self,
        workflow_id: Uuid,
        cancelled: bool,
        start: Instant,
    ) -> ConductorResult<WorkflowResult> {
        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.shared.store.read(workflow_id, |wf| {
            let tasks: Vec<_> = wf.tasks().map(Task::outcome).collect();
            let completed = tasks.iter().filter(|t| t.status == Status::Completed).count();
            let failed = tasks.iter().filter(|t| t.status == Status::Failed).count();
            let not_run = tasks.len() - completed - failed;
            let mut summary = format!(
                "{completed}/{} tasks completed, {failed} failed, {not_run} not run",
                tasks.len()
            );
            if cancelled {
                summary.push_str(" (cancelled)");
            }
            WorkflowResult {
                workflow_id,
                name: wf.name.clone(),
                status: wf.status,
                cancelled,
                stages: wf
                    .stages
                    .iter()
                    .map(|s| StageReport {
                        id: s.id,
                        name: s.name.clone(),
                        status: s.status,
                    })
                    .collect(),
                tasks,
                duration_ms,
                summary,
            }
        })
    }

    fn record_workflow_end(&self, result: &WorkflowResult) {
        let (action, outcome) = if result.status == Status::Completed {
            self.shared.metrics.workflow_completed();
            ("workflow.completed", AuditOutcome::Success)
        } else {
            self.shared.metrics.workflow_failed();
            ("workflow.failed", AuditOutcome::Failure)
        };
        self.shared.audit.log_action(
            ACTOR,
            action,
            Some(result.workflow_id),
            json!({
                "summary": result.summary,
                "duration_ms": result.duration_ms,
                "cancelled": result.cancelled,
            }),
            outcome,
        );
        info!(
            workflow_id = %result.workflow_id,
            status = %result.status,
            duration_ms = result.duration_ms,
            summary = %result.summary,
            "Workflow finished"
        );
    }

    pub fn get_workflow_status(&self, workflow_id: Uuid) -> ConductorResult<WorkflowStatusReport> {
        self.shared.store.status(workflow_id)
    }

    pub fn list_workflows(&self) -> Vec<WorkflowSummary> {
        self.shared.store.list()
    }

    /// Remove a finished workflow from the engine and hand it to the caller,
    /// e.g. for archiving. Running or pending workflows are refused.
    pub fn take_workflow(&self, workflow_id: Uuid) -> ConductorResult<Workflow> {
        let workflow = self.shared.store.remove(workflow_id)?;
        debug!(workflow_id = %workflow_id, status = %workflow.status, "Workflow released");
        Ok(workflow)
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn get_audit(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        self.shared.audit.query(filter)
    }
}

impl Shared {
    /// Invoke one planned task through the retry manager and record its
    /// terminal state. `Err` only for engine faults.
    async fn run_task(
        &self,
        workflow_id: Uuid,
        stage_idx: usize,
        entry: PlanEntry,
        cancel: CancellationToken,
    ) -> ConductorResult<()> {
        let agent_id = entry.agent.id().to_string();
        let started = Instant::now();
        let mut fault: Option<ConductorError> = None;

        let outcome = self
            .retry
            .invoke(
                entry.agent.as_ref(),
                &entry.task_id,
                &entry.parameters,
                entry.max_retries,
                &cancel,
                |event: RetryEvent<'_>| {
                    let failure = TaskFailure::from(event.error);
                    self.metrics.task_retried();
                    // The task walks failed -> pending -> running and stays
                    // running through the backoff wait.
                    let walked = self.store.update_task(workflow_id, stage_idx, entry.index, |t| {
                        t.attempts = event.retry;
                        t.failure = Some(failure.clone());
                        t.transition(Status::Failed)?;
                        t.transition(Status::Pending)?;
                        t.transition(Status::Running)
                    });
                    if let Err(e) = walked {
                        fault.get_or_insert(e);
                    }
                    self.audit.log_action(
                        ACTOR,
                        "task.retry",
                        Some(workflow_id),
                        json!({
                            "task_id": entry.task_id,
                            "agent_id": agent_id,
                            "retry": event.retry,
                            "delay_ms": u64::try_from(event.delay.as_millis()).unwrap_or(u64::MAX),
                            "kind": failure.kind,
                            "error": failure.message,
                        }),
                        AuditOutcome::Info,
                    );
                },
            )
            .await;

        if let Some(e) = fault {
            return Err(e);
        }
        self.metrics
            .record_duration(entry.capabilities.iter(), started.elapsed());

        let failure = self
            .store
            .update_task(workflow_id, stage_idx, entry.index, |t| {
                if t.retry_count != outcome.retry_count {
                    return Err(ConductorError::Internal(format!(
                        "task '{}' retry count {} disagrees with {} retries performed",
                        t.id, t.retry_count, outcome.retry_count
                    )));
                }
                t.attempts = outcome.attempts;
                match &outcome.result {
                    Ok(value) => {
                        t.result = Some(value.clone());
                        t.transition(Status::Completed)?;
                        Ok(None)
                    }
                    Err(e) => {
                        let failure = TaskFailure::from(e);
                        t.failure = Some(failure.clone());
                        t.transition(Status::Failed)?;
                        Ok(Some(failure))
                    }
                }
            })?;

        match failure {
            None => {
                self.metrics.task_completed();
                self.audit.log_action(
                    agent_id.as_str(),
                    "task.completed",
                    Some(workflow_id),
                    json!({
                        "task_id": entry.task_id,
                        "attempts": outcome.attempts,
                        "retries": outcome.retry_count,
                    }),
                    AuditOutcome::Success,
                );
                info!(
                    workflow_id = %workflow_id,
                    task_id = %entry.task_id,
                    agent = %agent_id,
                    attempts = outcome.attempts,
                    "Task completed"
                );
            }
            Some(failure) => {
                self.metrics.task_failed(failure.kind);
                self.audit.log_action(
                    agent_id.as_str(),
                    "task.failed",
                    Some(workflow_id),
                    json!({
                        "task_id": entry.task_id,
                        "kind": failure.kind,
                        "error": failure.message,
                        "attempts": outcome.attempts,
                        "retries": outcome.retry_count,
                    }),
                    AuditOutcome::Failure,
                );
                if failure.kind == ErrorKind::Cancelled {
                    info!(workflow_id = %workflow_id, task_id = %entry.task_id, "Task cancelled during backoff");
                } else {
                    warn!(
                        workflow_id = %workflow_id,
                        task_id = %entry.task_id,
                        agent = %agent_id,
                        kind = %failure.kind,
                        attempts = outcome.attempts,
                        error = %failure.message,
                        "Task failed"
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::compiler::{StageSpec, TaskSpec};
    use async_trait::async_trait;

    struct EchoAgent {
        caps: CapabilitySet,
    }

    #[async_trait]
    impl Agent for EchoAgent {
        fn id(&self) -> &str {
            "echo"
        }
        fn name(&self) -> &str {
            "echo"
        }
        fn capabilities(&self) -> &CapabilitySet {
            &self.caps
        }
        async fn execute(
            &self,
            task_id: &str,
            parameters: &Parameters,
        ) -> ConductorResult<serde_json::Value> {
            Ok(json!({ "task": task_id, "params": parameters }))
        }
    }

    fn engine() -> (ExecutionEngine, Arc<dyn Agent>) {
        let engine =
            ExecutionEngine::new(EngineConfig::default(), Arc::new(CapabilityRegistry::new()))
                .unwrap();
        let agent: Arc<dyn Agent> = Arc::new(EchoAgent {
            caps: CapabilitySet::from(["echo"]),
        });
        engine.register_agent(&agent).unwrap();
        (engine, agent)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig {
            max_concurrency: 0,
            ..EngineConfig::default()
        };
        assert!(ExecutionEngine::new(config, Arc::new(CapabilityRegistry::new())).is_err());
    }

    #[tokio::test]
    async fn test_run_single_task() {
        let (engine, _agent) = engine();
        let spec = WorkflowSpec::new("echo").with_stage(
            StageSpec::new("only").with_task(TaskSpec::new("t1", ["echo"]).with_param("n", json!(7))),
        );
        let result = engine.run(&spec).await.unwrap();

        assert_eq!(result.status, Status::Completed);
        let task = result.task("t1").unwrap();
        assert_eq!(task.status, Status::Completed);
        assert_eq!(task.agent_id.as_deref(), Some("echo"));
        assert_eq!(task.result.as_ref().unwrap()["params"]["n"], 7);
        assert_eq!(task.attempts, 1);
    }

    #[tokio::test]
    async fn test_validation_error_before_dispatch() {
        let (engine, _agent) = engine();
        let err = engine.run(&WorkflowSpec::new("empty")).await.unwrap_err();
        assert!(matches!(err, ConductorError::Validation(_)));
        assert!(engine.list_workflows().is_empty());
        assert_eq!(engine.get_metrics().workflows_started, 0);
    }

    #[tokio::test]
    async fn test_same_workflow_cannot_run_twice() {
        let (engine, _agent) = engine();
        let workflow = engine
            .compile(
                &WorkflowSpec::new("twice")
                    .with_stage(StageSpec::new("s").with_task(TaskSpec::new("t", ["echo"]))),
            )
            .unwrap();
        engine.orchestrate(workflow.clone()).await.unwrap();
        assert!(matches!(
            engine.orchestrate(workflow).await.unwrap_err(),
            ConductorError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_agent_registration_is_audited() {
        let (engine, _agent) = engine();
        assert!(engine.deregister_agent("echo"));
        assert!(!engine.deregister_agent("echo"));
        let entries = engine.get_audit(&AuditFilter::action("agent."));
        let actions: Vec<_> = entries.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, vec!["agent.registered", "agent.deregistered"]);
    }
}
