//! Persistence port for the decider and the wait-task poller.

use crate::definition::{TaskDefinition, WorkflowDefinition};
use crate::error::StoreError;
use crate::instance::{TaskInstance, WorkflowInstance};
use crate::status::TaskStatus;
use async_trait::async_trait;
use switchyard_core::{
    Result, TaskDefinitionId, TaskInstanceId, WorkflowDefinitionId, WorkflowInstanceId,
};

/// Writes of one decision, applied atomically.
///
/// Records in `update_*` carry the version they were read at; the store
/// rejects the whole changeset if any of them is stale.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changeset {
    pub insert_workflows: Vec<WorkflowInstance>,
    pub update_workflows: Vec<WorkflowInstance>,
    pub insert_tasks: Vec<TaskInstance>,
    pub update_tasks: Vec<TaskInstance>,
}

impl Changeset {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.insert_workflows.is_empty()
            && self.update_workflows.is_empty()
            && self.insert_tasks.is_empty()
            && self.update_tasks.is_empty()
    }
}

/// Storage of definitions and runtime records.
///
/// Definition lookups by name only see live rows; lookups by id also see
/// soft-deleted rows so runs started on an older definition version can
/// finish.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// The live definition with `name`.
    async fn find_definition_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;

    async fn find_definition(
        &self,
        id: WorkflowDefinitionId,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;

    async fn find_task_definition(
        &self,
        id: TaskDefinitionId,
    ) -> Result<Option<TaskDefinition>, StoreError>;

    async fn find_workflow(
        &self,
        id: WorkflowInstanceId,
    ) -> Result<Option<WorkflowInstance>, StoreError>;

    /// The task with `id`, only if it currently has `status`.
    async fn find_task_in_status(
        &self,
        id: TaskInstanceId,
        status: TaskStatus,
    ) -> Result<Option<TaskInstance>, StoreError>;

    /// Tasks of `workflow` created from any of `definitions` and in any of
    /// `statuses`.
    async fn find_tasks_for_definitions(
        &self,
        workflow: WorkflowInstanceId,
        definitions: &[TaskDefinitionId],
        statuses: &[TaskStatus],
    ) -> Result<Vec<TaskInstance>, StoreError>;

    /// Number of non-terminal tasks of `workflow`, ignoring `excluding`.
    async fn count_unfinished_tasks(
        &self,
        workflow: WorkflowInstanceId,
        excluding: Option<TaskInstanceId>,
    ) -> Result<u64, StoreError>;

    /// Parked `IN_PROGRESS` tasks whose deadline is before `now_ms`, ordered
    /// by id and starting after `after`.
    async fn find_due_waiting_tasks(
        &self,
        now_ms: i64,
        after: Option<TaskInstanceId>,
        limit: usize,
    ) -> Result<Vec<TaskInstance>, StoreError>;

    /// Sets or clears the deadline of a parked task and returns the task as
    /// stored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::VersionConflict`] if the task changed since it
    /// was read.
    async fn set_waiting(
        &self,
        task: &TaskInstance,
        waiting: Option<i64>,
    ) -> Result<TaskInstance, StoreError>;

    /// Applies `changeset` in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::VersionConflict`] if any update is stale, in
    /// which case nothing is written.
    async fn commit(&self, changeset: Changeset) -> Result<(), StoreError>;
}
