//! In-memory [`WorkflowStore`] for tests and local runs.

use crate::definition::{TaskDefinition, WorkflowDefinition};
use crate::error::StoreError;
use crate::instance::{TaskInstance, WorkflowInstance};
use crate::status::TaskStatus;
use crate::store::{Changeset, WorkflowStore};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use switchyard_core::{
    Result, TaskDefinitionId, TaskInstanceId, WorkflowDefinitionId, WorkflowInstanceId,
};

const ACTOR: &str = "switchyard";

#[derive(Debug, Default)]
struct State {
    definitions: Vec<WorkflowDefinition>,
    workflows: BTreeMap<WorkflowInstanceId, WorkflowInstance>,
    tasks: BTreeMap<TaskInstanceId, TaskInstance>,
    failing_commits: usize,
}

/// Shared in-memory store. Clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWorkflowStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryWorkflowStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a definition, soft-deleting any live definition with the same
    /// name.
    pub fn insert_definition(&self, mut definition: WorkflowDefinition) {
        let mut state = self.lock();
        for existing in &mut state.definitions {
            if existing.name == definition.name && !existing.audit.deleted {
                existing.audit.deleted = true;
            }
        }
        definition.audit.stamp_insert(ACTOR, Utc::now());
        state.definitions.push(definition);
    }

    /// Soft-deletes the definition with `id`. Returns false if it is unknown
    /// or already deleted.
    pub fn delete_definition(&self, id: WorkflowDefinitionId) -> bool {
        let mut state = self.lock();
        match state
            .definitions
            .iter_mut()
            .find(|d| d.id == id && !d.audit.deleted)
        {
            Some(definition) => {
                definition.audit.deleted = true;
                definition.audit.stamp_update(ACTOR, Utc::now());
                true
            }
            None => false,
        }
    }

    /// Every stored definition, soft-deleted ones included.
    #[must_use]
    pub fn definitions(&self) -> Vec<WorkflowDefinition> {
        self.lock().definitions.clone()
    }

    /// Makes the next `count` commits fail with a database error.
    pub fn fail_next_commits(&self, count: usize) {
        self.lock().failing_commits = count;
    }

    #[must_use]
    pub fn workflows(&self) -> Vec<WorkflowInstance> {
        self.lock().workflows.values().cloned().collect()
    }

    #[must_use]
    pub fn workflow(&self, id: WorkflowInstanceId) -> Option<WorkflowInstance> {
        self.lock().workflows.get(&id).cloned()
    }

    #[must_use]
    pub fn tasks(&self) -> Vec<TaskInstance> {
        self.lock().tasks.values().cloned().collect()
    }

    #[must_use]
    pub fn task(&self, id: TaskInstanceId) -> Option<TaskInstance> {
        self.lock().tasks.get(&id).cloned()
    }

    /// Tasks of `workflow` created from the task definition named `name`.
    #[must_use]
    pub fn tasks_named(&self, workflow: WorkflowInstanceId, name: &str) -> Vec<TaskInstance> {
        self.lock()
            .tasks
            .values()
            .filter(|t| t.workflow_instance_id == workflow && t.task_definition_name == name)
            .cloned()
            .collect()
    }
}

fn check_version(
    entity: &'static str,
    id: u64,
    stored: Option<i64>,
    expected: i64,
) -> Result<(), StoreError> {
    match stored {
        Some(version) if version == expected => Ok(()),
        _ => Err(StoreError::VersionConflict { entity, id }.into()),
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn find_definition_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self
            .lock()
            .definitions
            .iter()
            .find(|d| d.name == name && !d.audit.deleted)
            .cloned())
    }

    async fn find_definition(
        &self,
        id: WorkflowDefinitionId,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self.lock().definitions.iter().find(|d| d.id == id).cloned())
    }

    async fn find_task_definition(
        &self,
        id: TaskDefinitionId,
    ) -> Result<Option<TaskDefinition>, StoreError> {
        Ok(self
            .lock()
            .definitions
            .iter()
            .find_map(|d| d.task(id))
            .cloned())
    }

    async fn find_workflow(
        &self,
        id: WorkflowInstanceId,
    ) -> Result<Option<WorkflowInstance>, StoreError> {
        Ok(self.workflow(id))
    }

    async fn find_task_in_status(
        &self,
        id: TaskInstanceId,
        status: TaskStatus,
    ) -> Result<Option<TaskInstance>, StoreError> {
        Ok(self.task(id).filter(|t| t.status == status))
    }

    async fn find_tasks_for_definitions(
        &self,
        workflow: WorkflowInstanceId,
        definitions: &[TaskDefinitionId],
        statuses: &[TaskStatus],
    ) -> Result<Vec<TaskInstance>, StoreError> {
        Ok(self
            .lock()
            .tasks
            .values()
            .filter(|t| {
                t.workflow_instance_id == workflow
                    && definitions.contains(&t.task_definition_id)
                    && statuses.contains(&t.status)
            })
            .cloned()
            .collect())
    }

    async fn count_unfinished_tasks(
        &self,
        workflow: WorkflowInstanceId,
        excluding: Option<TaskInstanceId>,
    ) -> Result<u64, StoreError> {
        let count = self
            .lock()
            .tasks
            .values()
            .filter(|t| {
                t.workflow_instance_id == workflow
                    && Some(t.id) != excluding
                    && !t.status.is_terminal()
            })
            .count();
        Ok(count as u64)
    }

    async fn find_due_waiting_tasks(
        &self,
        now_ms: i64,
        after: Option<TaskInstanceId>,
        limit: usize,
    ) -> Result<Vec<TaskInstance>, StoreError> {
        Ok(self
            .lock()
            .tasks
            .values()
            .filter(|t| after.is_none_or(|after| t.id > after) && t.is_due(now_ms))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn set_waiting(
        &self,
        task: &TaskInstance,
        waiting: Option<i64>,
    ) -> Result<TaskInstance, StoreError> {
        let mut state = self.lock();
        let stored = state.tasks.get_mut(&task.id);
        check_version(
            "task",
            task.id.as_u64(),
            stored.as_ref().map(|t| t.audit.version),
            task.audit.version,
        )?;
        let mut updated = task.clone();
        updated.waiting = waiting;
        updated.audit.stamp_update(ACTOR, Utc::now());
        if let Some(stored) = stored {
            *stored = updated.clone();
        }
        Ok(updated)
    }

    async fn commit(&self, changeset: Changeset) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(StoreError::database("injected failure").into());
        }

        for workflow in &changeset.update_workflows {
            check_version(
                "workflow",
                workflow.id.as_u64(),
                state.workflows.get(&workflow.id).map(|w| w.audit.version),
                workflow.audit.version,
            )?;
        }
        for task in &changeset.update_tasks {
            check_version(
                "task",
                task.id.as_u64(),
                state.tasks.get(&task.id).map(|t| t.audit.version),
                task.audit.version,
            )?;
        }

        let now = Utc::now();
        for mut workflow in changeset.insert_workflows {
            workflow.audit.stamp_insert(ACTOR, now);
            state.workflows.insert(workflow.id, workflow);
        }
        for mut workflow in changeset.update_workflows {
            workflow.audit.stamp_update(ACTOR, now);
            state.workflows.insert(workflow.id, workflow);
        }
        for mut task in changeset.insert_tasks {
            task.audit.stamp_insert(ACTOR, now);
            state.tasks.insert(task.id, task);
        }
        for mut task in changeset.update_tasks {
            task.audit.stamp_update(ACTOR, now);
            state.tasks.insert(task.id, task);
        }
        Ok(())
    }
}
