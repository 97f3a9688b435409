use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult, ErrorKind, Parameters};
use conductor_security::CapabilitySet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status shared by workflows, stages and tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Running,
    Completed,
    Failed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Pending => write!(f, "pending"),
            Status::Running => write!(f, "running"),
            Status::Completed => write!(f, "completed"),
            Status::Failed => write!(f, "failed"),
        }
    }
}

/// Why a task ended in `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ConductorError> for TaskFailure {
    fn from(err: &ConductorError) -> Self {
        Self {
            kind: err.retry_kind(),
            message: err.to_string(),
        }
    }
}

/// The smallest unit of work, tagged with the capabilities it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Index of the owning stage within its workflow.
    pub stage_id: usize,
    pub required_capabilities: CapabilitySet,
    pub parameters: Parameters,
    pub status: Status,
    pub result: Option<serde_json::Value>,
    pub failure: Option<TaskFailure>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Higher is dispatched first when concurrency is limited.
    pub priority: i64,
    /// Agent that ran (or last ran) the task.
    pub agent_id: Option<String>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<String>, stage_id: usize, required: CapabilitySet) -> Self {
        Self {
            id: id.into(),
            stage_id,
            required_capabilities: required,
            parameters: Parameters::new(),
            status: Status::Pending,
            result: None,
            failure: None,
            retry_count: 0,
            max_retries: 0,
            priority: 0,
            agent_id: None,
            attempts: 0,
            started_at: None,
            completed_at: None,
        }
    }

    /// Move to `to`, enforcing the task state machine.
    ///
    /// `failed -> pending` is the retry edge and is only legal while retries
    /// remain; it bumps `retry_count`.
    pub fn transition(&mut self, to: Status) -> ConductorResult<()> {
        let allowed = match (self.status, to) {
            (Status::Pending, Status::Running) => true,
            (Status::Running, Status::Completed) | (Status::Running, Status::Failed) => true,
            (Status::Failed, Status::Pending) => self.retry_count < self.max_retries,
            _ => false,
        };
        if !allowed {
            return Err(ConductorError::Internal(format!(
                "illegal task transition {} -> {} for task '{}' (retry {}/{})",
                self.status, to, self.id, self.retry_count, self.max_retries
            )));
        }
        match to {
            Status::Running if self.started_at.is_none() => self.started_at = Some(Utc::now()),
            Status::Completed | Status::Failed => self.completed_at = Some(Utc::now()),
            Status::Pending => {
                self.retry_count += 1;
                self.completed_at = None;
                self.failure = None;
            }
            _ => {}
        }
        self.status = to;
        Ok(())
    }

    pub fn outcome(&self) -> TaskOutcome {
        TaskOutcome {
            task_id: self.id.clone(),
            stage_id: self.stage_id,
            status: self.status,
            retry_count: self.retry_count,
            attempts: self.attempts,
            agent_id: self.agent_id.clone(),
            result: self.result.clone(),
            failure: self.failure.clone(),
            duration_ms: match (self.started_at, self.completed_at) {
                (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
                _ => None,
            },
        }
    }
}

/// A set of tasks executed concurrently. Stages run strictly in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Position within the workflow.
    pub id: usize,
    pub workflow_id: Uuid,
    pub name: String,
    pub tasks: Vec<Task>,
    pub status: Status,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A compiled, executable workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub stages: Vec<Stage>,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub terminal_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.stages.iter().flat_map(|s| s.tasks.iter())
    }

    pub fn task_count(&self) -> usize {
        self.stages.iter().map(|s| s.tasks.len()).sum()
    }

    /// Fraction of tasks in a terminal state, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        let total = self.task_count();
        if total == 0 {
            return 0.0;
        }
        let done = self.tasks().filter(|t| t.status.is_terminal()).count();
        done as f64 / total as f64
    }
}

/// Terminal (or current) state of one task, as reported to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub stage_id: usize,
    pub status: Status,
    pub retry_count: u32,
    pub attempts: u32,
    pub agent_id: Option<String>,
    pub result: Option<serde_json::Value>,
    pub failure: Option<TaskFailure>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub id: usize,
    pub name: String,
    pub status: Status,
}

/// Aggregated result of one `orchestrate` call.
///
/// Always enumerates every task, including those never started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: Uuid,
    pub name: String,
    pub status: Status,
    /// Set when a cancellation stopped the run at a stage boundary.
    pub cancelled: bool,
    pub stages: Vec<StageReport>,
    pub tasks: Vec<TaskOutcome>,
    pub duration_ms: u64,
    pub summary: String,
}

impl WorkflowResult {
    pub fn task(&self, task_id: &str) -> Option<&TaskOutcome> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn completed_tasks(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == Status::Completed)
            .count()
    }

    pub fn failed_tasks(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == Status::Failed)
            .count()
    }
}

/// Answer to `get_workflow_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatusReport {
    pub workflow_id: Uuid,
    pub name: String,
    pub status: Status,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub terminal_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageReport>,
    pub tasks: Vec<TaskOutcome>,
}

impl From<&Workflow> for WorkflowStatusReport {
    fn from(wf: &Workflow) -> Self {
        Self {
            workflow_id: wf.id,
            name: wf.name.clone(),
            status: wf.status,
            progress: wf.progress(),
            created_at: wf.created_at,
            terminal_at: wf.terminal_at,
            stages: wf
                .stages
                .iter()
                .map(|s| StageReport {
                    id: s.id,
                    name: s.name.clone(),
                    status: s.status,
                })
                .collect(),
            tasks: wf.tasks().map(Task::outcome).collect(),
        }
    }
}
