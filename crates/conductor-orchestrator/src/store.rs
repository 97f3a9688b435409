use crate::types::{Status, Task, TaskFailure, Workflow, WorkflowStatusReport};
use chrono::Utc;
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One row of [`WorkflowStore::list`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_id: Uuid,
    pub name: String,
    pub status: Status,
}

#[derive(Default)]
struct Inner {
    workflows: HashMap<Uuid, Workflow>,
    /// Submission order, for stable listings.
    order: Vec<Uuid>,
}

/// Every workflow the engine has accepted, keyed by id.
///
/// Only the engine mutates entries. Each mutation holds the write lock for
/// a single synchronous closure and never across an await.
#[derive(Default)]
pub struct WorkflowStore {
    inner: RwLock<Inner>,
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a freshly compiled workflow. Ids must be unique.
    pub fn insert(&self, workflow: Workflow) -> ConductorResult<()> {
        let mut inner = self.inner.write();
        if inner.workflows.contains_key(&workflow.id) {
            return Err(ConductorError::Validation(format!(
                "workflow {} was already submitted",
                workflow.id
            )));
        }
        inner.order.push(workflow.id);
        inner.workflows.insert(workflow.id, workflow);
        Ok(())
    }

    /// Drop a workflow that reached a terminal status and return it.
    pub fn remove(&self, workflow_id: Uuid) -> ConductorResult<Workflow> {
        let mut inner = self.inner.write();
        let status = inner
            .workflows
            .get(&workflow_id)
            .map(|wf| wf.status)
            .ok_or_else(|| not_found(workflow_id))?;
        if !status.is_terminal() {
            return Err(ConductorError::Validation(format!(
                "workflow {workflow_id} is {status} and cannot be removed"
            )));
        }
        inner.order.retain(|id| *id != workflow_id);
        inner
            .workflows
            .remove(&workflow_id)
            .ok_or_else(|| not_found(workflow_id))
    }

    pub fn contains(&self, workflow_id: Uuid) -> bool {
        self.inner.read().workflows.contains_key(&workflow_id)
    }

    /// Clone of the current state of a workflow.
    pub fn get(&self, workflow_id: Uuid) -> ConductorResult<Workflow> {
        self.read(workflow_id, Workflow::clone)
    }

    pub fn status(&self, workflow_id: Uuid) -> ConductorResult<WorkflowStatusReport> {
        self.read(workflow_id, |wf| WorkflowStatusReport::from(wf))
    }

    /// All workflows in submission order.
    pub fn list(&self) -> Vec<WorkflowSummary> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.workflows.get(id))
            .map(|wf| WorkflowSummary {
                workflow_id: wf.id,
                name: wf.name.clone(),
                status: wf.status,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` against a workflow under the read lock.
    pub fn read<R>(&self, workflow_id: Uuid, f: impl FnOnce(&Workflow) -> R) -> ConductorResult<R> {
        let inner = self.inner.read();
        inner
            .workflows
            .get(&workflow_id)
            .map(f)
            .ok_or_else(|| not_found(workflow_id))
    }

    /// Run `f` against a workflow under the write lock.
    pub fn update<R>(
        &self,
        workflow_id: Uuid,
        f: impl FnOnce(&mut Workflow) -> ConductorResult<R>,
    ) -> ConductorResult<R> {
        let mut inner = self.inner.write();
        let workflow = inner
            .workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| not_found(workflow_id))?;
        f(workflow)
    }

    /// Run `f` against one task, addressed by stage index and task index.
    pub fn update_task<R>(
        &self,
        workflow_id: Uuid,
        stage: usize,
        task: usize,
        f: impl FnOnce(&mut Task) -> ConductorResult<R>,
    ) -> ConductorResult<R> {
        self.update(workflow_id, |wf| {
            let slot = wf
                .stages
                .get_mut(stage)
                .and_then(|s| s.tasks.get_mut(task))
                .ok_or_else(|| {
                    ConductorError::Internal(format!(
                        "no task at stage {stage} index {task} in workflow {workflow_id}"
                    ))
                })?;
            f(slot)
        })
    }

    /// Move a workflow to `running`.
    pub fn mark_running(&self, workflow_id: Uuid) -> ConductorResult<()> {
        self.update(workflow_id, |wf| {
            if wf.status != Status::Pending {
                return Err(ConductorError::Validation(format!(
                    "workflow {workflow_id} is {} and cannot be run again",
                    wf.status
                )));
            }
            wf.status = Status::Running;
            Ok(())
        })
    }

    /// Move a running workflow to its terminal status.
    pub fn mark_terminal(&self, workflow_id: Uuid, status: Status) -> ConductorResult<()> {
        self.update(workflow_id, |wf| {
            if wf.status != Status::Running || !status.is_terminal() {
                return Err(ConductorError::Internal(format!(
                    "illegal workflow transition {} -> {status} for {workflow_id}",
                    wf.status
                )));
            }
            wf.status = status;
            wf.terminal_at = Some(Utc::now());
            Ok(())
        })
    }

    /// Move a stage to `running`. Its workflow must be running.
    pub fn start_stage(&self, workflow_id: Uuid, stage: usize) -> ConductorResult<()> {
        self.update(workflow_id, |wf| {
            if wf.status != Status::Running {
                return Err(ConductorError::Internal(format!(
                    "stage {stage} started while workflow {workflow_id} is {}",
                    wf.status
                )));
            }
            let s = stage_mut(wf, stage)?;
            if s.status != Status::Pending {
                return Err(ConductorError::Internal(format!(
                    "stage {stage} of workflow {workflow_id} is already {}",
                    s.status
                )));
            }
            s.status = Status::Running;
            s.started_at = Some(Utc::now());
            Ok(())
        })
    }

    /// Fail every task of a stage that has not reached a terminal status.
    /// Returns the ids of the tasks it failed.
    pub fn fail_open_tasks(
        &self,
        workflow_id: Uuid,
        stage: usize,
        failure: &TaskFailure,
    ) -> ConductorResult<Vec<String>> {
        self.update(workflow_id, |wf| {
            let s = stage_mut(wf, stage)?;
            let mut failed = Vec::new();
            for task in s.tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
                if task.status == Status::Pending {
                    task.transition(Status::Running)?;
                }
                task.failure = Some(failure.clone());
                task.transition(Status::Failed)?;
                failed.push(task.id.clone());
            }
            Ok(failed)
        })
    }

    /// Derive a running stage's terminal status from its tasks: `completed`
    /// iff every task completed. Returns that status.
    pub fn finish_stage(&self, workflow_id: Uuid, stage: usize) -> ConductorResult<Status> {
        self.update(workflow_id, |wf| {
            let s = stage_mut(wf, stage)?;
            if let Some(open) = s.tasks.iter().find(|t| !t.status.is_terminal()) {
                return Err(ConductorError::Internal(format!(
                    "stage {stage} finishing with task '{}' still {}",
                    open.id, open.status
                )));
            }
            let status = if s.tasks.iter().all(|t| t.status == Status::Completed) {
                Status::Completed
            } else {
                Status::Failed
            };
            s.status = status;
            s.completed_at = Some(Utc::now());
            Ok(status)
        })
    }
}

fn stage_mut(wf: &mut Workflow, stage: usize) -> ConductorResult<&mut crate::types::Stage> {
    let workflow_id = wf.id;
    wf.stages
        .get_mut(stage)
        .ok_or_else(|| ConductorError::Internal(format!("no stage {stage} in workflow {workflow_id}")))
}

fn not_found(workflow_id: Uuid) -> ConductorError {
    ConductorError::NotFound(format!("workflow {workflow_id}"))
}
