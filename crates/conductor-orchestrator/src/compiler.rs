use crate::types::{Stage, Status, Task, Workflow};
use chrono::Utc;
use conductor_core::{ConductorError, ConductorResult, Parameters};
use conductor_security::CapabilitySet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Raw workflow submission, as accepted in memory or as JSON.
///
/// Every field is optional at the serde level so that missing pieces are
/// reported as validation errors rather than parse errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub stages: Vec<StageSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub priority: i64,
    /// Falls back to the compiler's default when absent.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl WorkflowSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            stages: Vec::new(),
        }
    }

    pub fn with_stage(mut self, stage: StageSpec) -> Self {
        self.stages.push(stage);
        self
    }
}

impl StageSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            tasks: Vec::new(),
        }
    }

    pub fn with_task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }
}

impl TaskSpec {
    pub fn new<S: Into<String>>(id: impl Into<String>, capabilities: impl IntoIterator<Item = S>) -> Self {
        Self {
            id: Some(id.into()),
            required_capabilities: capabilities.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// Validates workflow specifications and builds executable [`Workflow`]s.
///
/// Compilation is pure: it touches no shared state and the same spec always
/// yields the same stage/task shape (only the workflow id and timestamps
/// differ).
#[derive(Debug, Clone)]
pub struct WorkflowCompiler {
    default_max_retries: u32,
}

impl WorkflowCompiler {
    pub fn new(default_max_retries: u32) -> Self {
        Self {
            default_max_retries,
        }
    }

    /// Parse a JSON submission and compile it.
    pub fn compile_json(&self, json: &str) -> ConductorResult<Workflow> {
        let spec: WorkflowSpec = serde_json::from_str(json)
            .map_err(|e| ConductorError::Validation(format!("malformed workflow document: {e}")))?;
        self.compile(&spec)
    }

    pub fn compile(&self, spec: &WorkflowSpec) -> ConductorResult<Workflow> {
        let name = match spec.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                return Err(ConductorError::Validation(
                    "workflow name is missing or empty".into(),
                ))
            }
        };

        if spec.stages.is_empty() {
            return Err(ConductorError::Validation(format!(
                "workflow '{name}' has no stages"
            )));
        }

        let workflow_id = Uuid::new_v4();
        let mut seen_ids: HashSet<String> = HashSet::new();
        let mut stages = Vec::with_capacity(spec.stages.len());

        for (stage_idx, stage_spec) in spec.stages.iter().enumerate() {
            let stage_name = stage_spec
                .name
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("stage-{stage_idx}"));

            if stage_spec.tasks.is_empty() {
                return Err(ConductorError::Validation(format!(
                    "stage '{stage_name}' has no tasks"
                )));
            }

            let mut tasks = Vec::with_capacity(stage_spec.tasks.len());
            for (task_idx, task_spec) in stage_spec.tasks.iter().enumerate() {
                let task = self.compile_task(stage_idx, &stage_name, task_idx, task_spec)?;
                if !seen_ids.insert(task.id.clone()) {
                    return Err(ConductorError::Validation(format!(
                        "duplicate task id '{}'",
                        task.id
                    )));
                }
                tasks.push(task);
            }

            stages.push(Stage {
                id: stage_idx,
                workflow_id,
                name: stage_name,
                tasks,
                status: Status::Pending,
                started_at: None,
                completed_at: None,
            });
        }

        Ok(Workflow {
            id: workflow_id,
            name,
            stages,
            status: Status::Pending,
            created_at: Utc::now(),
            terminal_at: None,
        })
    }

    fn compile_task(
        &self,
        stage_idx: usize,
        stage_name: &str,
        task_idx: usize,
        spec: &TaskSpec,
    ) -> ConductorResult<Task> {
        let id = match spec.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                return Err(ConductorError::Validation(format!(
                    "task #{task_idx} in stage '{stage_name}' has no id"
                )))
            }
        };

        if spec.required_capabilities.is_empty() {
            return Err(ConductorError::Validation(format!(
                "task '{id}' declares no required capabilities"
            )));
        }
        if spec.required_capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(ConductorError::Validation(format!(
                "task '{id}' has a blank capability name"
            )));
        }

        let required: CapabilitySet = spec
            .required_capabilities
            .iter()
            .map(|c| c.trim().to_string())
            .collect();

        let mut task = Task::new(id, stage_idx, required);
        task.parameters = spec.parameters.clone();
        task.priority = spec.priority;
        task.max_retries = spec.max_retries.unwrap_or(self.default_max_retries);
        Ok(task)
    }
}

impl Default for WorkflowCompiler {
    fn default() -> Self {
        Self::new(3)
    }
}
