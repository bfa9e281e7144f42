//! Postgres implementation of [`WorkflowStore`] and [`Catalog`].

use super::instance::{insert_task, insert_workflow, update_task, update_workflow};
use super::{
    Catalog, InstanceRepository, WorkflowDefinitionRepository, WorkflowDetail, WorkflowFilter,
    store_error,
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use switchyard_core::{
    Result, TaskDefinitionId, TaskInstanceId, WorkflowDefinitionId, WorkflowInstanceId,
};
use switchyard_workflow::{
    Changeset, StoreError, TaskDefinition, TaskInstance, TaskStatus, WorkflowDefinition,
    WorkflowInstance, WorkflowStore,
};
use tracing::instrument;

/// Workflow store over a Postgres pool.
///
/// Every write is stamped with `actor` and bumps the row version.
#[derive(Clone)]
pub struct PgWorkflowStore {
    pool: PgPool,
    definitions: WorkflowDefinitionRepository,
    instances: InstanceRepository,
    actor: String,
}

impl PgWorkflowStore {
    #[must_use]
    pub fn new(pool: PgPool, actor: impl Into<String>) -> Self {
        Self {
            definitions: WorkflowDefinitionRepository::new(pool.clone()),
            instances: InstanceRepository::new(pool.clone()),
            pool,
            actor: actor.into(),
        }
    }
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    async fn find_definition_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        self.definitions.find_live_by_name(name).await
    }

    async fn find_definition(
        &self,
        id: WorkflowDefinitionId,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        self.definitions.find(id).await
    }

    async fn find_task_definition(
        &self,
        id: TaskDefinitionId,
    ) -> Result<Option<TaskDefinition>, StoreError> {
        self.definitions.find_task(id).await
    }

    async fn find_workflow(
        &self,
        id: WorkflowInstanceId,
    ) -> Result<Option<WorkflowInstance>, StoreError> {
        self.instances.find_workflow(id).await
    }

    async fn find_task_in_status(
        &self,
        id: TaskInstanceId,
        status: TaskStatus,
    ) -> Result<Option<TaskInstance>, StoreError> {
        self.instances.find_task_in_status(id, status).await
    }

    async fn find_tasks_for_definitions(
        &self,
        workflow: WorkflowInstanceId,
        definitions: &[TaskDefinitionId],
        statuses: &[TaskStatus],
    ) -> Result<Vec<TaskInstance>, StoreError> {
        self.instances
            .find_tasks_for_definitions(workflow, definitions, statuses)
            .await
    }

    async fn count_unfinished_tasks(
        &self,
        workflow: WorkflowInstanceId,
        excluding: Option<TaskInstanceId>,
    ) -> Result<u64, StoreError> {
        self.instances
            .count_unfinished_tasks(workflow, excluding)
            .await
    }

    async fn find_due_waiting_tasks(
        &self,
        now_ms: i64,
        after: Option<TaskInstanceId>,
        limit: usize,
    ) -> Result<Vec<TaskInstance>, StoreError> {
        self.instances
            .find_due_waiting_tasks(now_ms, after, limit)
            .await
    }

    async fn set_waiting(
        &self,
        task: &TaskInstance,
        waiting: Option<i64>,
    ) -> Result<TaskInstance, StoreError> {
        self.instances
            .set_waiting(task, waiting, &self.actor, Utc::now())
            .await
    }

    #[instrument(
        skip_all,
        fields(
            workflows = changeset.insert_workflows.len() + changeset.update_workflows.len(),
            tasks = changeset.insert_tasks.len() + changeset.update_tasks.len()
        )
    )]
    async fn commit(&self, changeset: Changeset) -> Result<(), StoreError> {
        if changeset.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let actor = self.actor.as_str();
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        for workflow in &changeset.insert_workflows {
            insert_workflow(&mut *tx, workflow, actor, now).await?;
        }
        for workflow in &changeset.update_workflows {
            update_workflow(&mut *tx, workflow, actor, now).await?;
        }
        for task in &changeset.insert_tasks {
            insert_task(&mut *tx, task, actor, now).await?;
        }
        for task in &changeset.update_tasks {
            update_task(&mut *tx, task, actor, now).await?;
        }

        tx.commit().await.map_err(store_error)
    }
}

#[async_trait]
impl Catalog for PgWorkflowStore {
    async fn list_definitions(
        &self,
        name: Option<&str>,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        self.definitions.list_live(name).await
    }

    async fn get_definition(
        &self,
        id: WorkflowDefinitionId,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        self.definitions.find(id).await
    }

    async fn create_definition(&self, definition: WorkflowDefinition) -> Result<(), StoreError> {
        self.definitions
            .create(&definition, &self.actor, Utc::now())
            .await
    }

    async fn replace_definition(
        &self,
        previous: &WorkflowDefinition,
        next: WorkflowDefinition,
    ) -> Result<(), StoreError> {
        self.definitions
            .replace(previous, &next, &self.actor, Utc::now())
            .await
    }

    async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        self.instances.list_workflows(filter).await
    }

    async fn get_workflow(
        &self,
        id: WorkflowInstanceId,
    ) -> Result<Option<WorkflowDetail>, StoreError> {
        let Some(workflow) = self.instances.find_workflow(id).await? else {
            return Ok(None);
        };
        let tasks = self.instances.tasks_of(id).await?;
        Ok(Some(WorkflowDetail { workflow, tasks }))
    }
}
