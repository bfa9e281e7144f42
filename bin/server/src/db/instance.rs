//! Repository for workflow and task instances.

use super::{AuditColumns, WorkflowFilter, decode_error, parameters, store_error};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};
use switchyard_core::{
    Result, TaskDefinitionId, TaskInstanceId, WorkflowDefinitionId, WorkflowInstanceId,
};
use switchyard_workflow::{StoreError, TaskInstance, TaskStatus, WorkflowInstance};

/// Upper bound on rows returned by instance listings.
const LIST_LIMIT: i64 = 500;

/// Row type for workflow instance queries.
#[derive(FromRow)]
struct WorkflowInstanceRow {
    id: i64,
    correlation_id: String,
    workflow_definition_id: i64,
    workflow_definition_name: String,
    status: String,
    input_parameters: serde_json::Value,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    #[sqlx(flatten)]
    audit: AuditColumns,
}

impl WorkflowInstanceRow {
    fn try_into_record(self) -> Result<WorkflowInstance, StoreError> {
        Ok(WorkflowInstance {
            id: WorkflowInstanceId::from_i64(self.id)
                .map_err(|e| decode_error("workflow instance id", e))?,
            correlation_id: self.correlation_id,
            workflow_definition_id: WorkflowDefinitionId::from_i64(self.workflow_definition_id)
                .map_err(|e| decode_error("workflow definition id", e))?,
            workflow_definition_name: self.workflow_definition_name,
            status: self
                .status
                .parse()
                .map_err(|e| decode_error("workflow status", e))?,
            input_parameters: parameters("input parameters", self.input_parameters)?,
            started_at: self.started_at,
            ended_at: self.ended_at,
            audit: self.audit.into(),
        })
    }
}

/// Row type for task instance queries.
#[derive(FromRow)]
struct TaskInstanceRow {
    id: i64,
    workflow_instance_id: i64,
    task_definition_id: i64,
    task_definition_name: String,
    worker_name: Option<String>,
    status: String,
    input_parameters: serde_json::Value,
    output_parameters: serde_json::Value,
    waiting: Option<i64>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    #[sqlx(flatten)]
    audit: AuditColumns,
}

impl TaskInstanceRow {
    fn try_into_record(self) -> Result<TaskInstance, StoreError> {
        Ok(TaskInstance {
            id: TaskInstanceId::from_i64(self.id)
                .map_err(|e| decode_error("task instance id", e))?,
            workflow_instance_id: WorkflowInstanceId::from_i64(self.workflow_instance_id)
                .map_err(|e| decode_error("workflow instance id", e))?,
            task_definition_id: TaskDefinitionId::from_i64(self.task_definition_id)
                .map_err(|e| decode_error("task definition id", e))?,
            task_definition_name: self.task_definition_name,
            worker_name: self.worker_name,
            status: self
                .status
                .parse()
                .map_err(|e| decode_error("task status", e))?,
            input_parameters: parameters("input parameters", self.input_parameters)?,
            output_parameters: parameters("output parameters", self.output_parameters)?,
            waiting: self.waiting,
            started_at: self.started_at,
            ended_at: self.ended_at,
            audit: self.audit.into(),
        })
    }
}

fn into_tasks(rows: Vec<TaskInstanceRow>) -> Result<Vec<TaskInstance>, StoreError> {
    rows.into_iter().map(TaskInstanceRow::try_into_record).collect()
}

fn status_names(statuses: &[TaskStatus]) -> Vec<String> {
    statuses.iter().map(|status| status.as_str().to_string()).collect()
}

/// Repository for runtime rows.
#[derive(Clone)]
pub struct InstanceRepository {
    pool: PgPool,
}

impl InstanceRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_workflow(
        &self,
        id: WorkflowInstanceId,
    ) -> Result<Option<WorkflowInstance>, StoreError> {
        let row: Option<WorkflowInstanceRow> = sqlx::query_as(
            r#"
            SELECT id, correlation_id, workflow_definition_id, workflow_definition_name,
                   status, input_parameters, started_at, ended_at,
                   created_at, created_by, updated_at, updated_by, is_deleted, version
            FROM workflow_instances
            WHERE id = $1 AND NOT is_deleted
            "#,
        )
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(WorkflowInstanceRow::try_into_record).transpose()
    }

    /// Newest instances matching `filter`.
    pub async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let rows: Vec<WorkflowInstanceRow> = sqlx::query_as(
            r#"
            SELECT id, correlation_id, workflow_definition_id, workflow_definition_name,
                   status, input_parameters, started_at, ended_at,
                   created_at, created_by, updated_at, updated_by, is_deleted, version
            FROM workflow_instances
            WHERE NOT is_deleted
              AND ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR correlation_id = $2)
            ORDER BY id DESC
            LIMIT $3
            "#,
        )
        .bind(filter.status.map(|status| status.as_str()))
        .bind(filter.correlation_id.as_deref())
        .bind(LIST_LIMIT)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.into_iter()
            .map(WorkflowInstanceRow::try_into_record)
            .collect()
    }

    /// Every task of `workflow`, oldest first.
    pub async fn tasks_of(
        &self,
        workflow: WorkflowInstanceId,
    ) -> Result<Vec<TaskInstance>, StoreError> {
        let rows: Vec<TaskInstanceRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_instance_id, task_definition_id, task_definition_name,
                   worker_name, status, input_parameters, output_parameters, waiting,
                   started_at, ended_at,
                   created_at, created_by, updated_at, updated_by, is_deleted, version
            FROM task_instances
            WHERE workflow_instance_id = $1 AND NOT is_deleted
            ORDER BY id
            "#,
        )
        .bind(workflow.as_i64())
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        into_tasks(rows)
    }

    pub async fn find_task_in_status(
        &self,
        id: TaskInstanceId,
        status: TaskStatus,
    ) -> Result<Option<TaskInstance>, StoreError> {
        let row: Option<TaskInstanceRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_instance_id, task_definition_id, task_definition_name,
                   worker_name, status, input_parameters, output_parameters, waiting,
                   started_at, ended_at,
                   created_at, created_by, updated_at, updated_by, is_deleted, version
            FROM task_instances
            WHERE id = $1 AND status = $2 AND NOT is_deleted
            "#,
        )
        .bind(id.as_i64())
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(TaskInstanceRow::try_into_record).transpose()
    }

    pub async fn find_tasks_for_definitions(
        &self,
        workflow: WorkflowInstanceId,
        definitions: &[TaskDefinitionId],
        statuses: &[TaskStatus],
    ) -> Result<Vec<TaskInstance>, StoreError> {
        let definitions: Vec<i64> = definitions.iter().map(|id| id.as_i64()).collect();
        let rows: Vec<TaskInstanceRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_instance_id, task_definition_id, task_definition_name,
                   worker_name, status, input_parameters, output_parameters, waiting,
                   started_at, ended_at,
                   created_at, created_by, updated_at, updated_by, is_deleted, version
            FROM task_instances
            WHERE workflow_instance_id = $1
              AND task_definition_id = ANY($2)
              AND status = ANY($3)
              AND NOT is_deleted
            ORDER BY id
            "#,
        )
        .bind(workflow.as_i64())
        .bind(&definitions)
        .bind(status_names(statuses))
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        into_tasks(rows)
    }

    pub async fn count_unfinished_tasks(
        &self,
        workflow: WorkflowInstanceId,
        excluding: Option<TaskInstanceId>,
    ) -> Result<u64, StoreError> {
        let unfinished: Vec<TaskStatus> = TaskStatus::ALL
            .into_iter()
            .filter(|status| !status.is_terminal())
            .collect();
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM task_instances
            WHERE workflow_instance_id = $1
              AND ($2::bigint IS NULL OR id <> $2)
              AND status = ANY($3)
              AND NOT is_deleted
            "#,
        )
        .bind(workflow.as_i64())
        .bind(excluding.map(|id| id.as_i64()))
        .bind(status_names(&unfinished))
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)?;

        u64::try_from(count).map_err(|e| decode_error("task count", e))
    }

    pub async fn find_due_waiting_tasks(
        &self,
        now_ms: i64,
        after: Option<TaskInstanceId>,
        limit: usize,
    ) -> Result<Vec<TaskInstance>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<TaskInstanceRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_instance_id, task_definition_id, task_definition_name,
                   worker_name, status, input_parameters, output_parameters, waiting,
                   started_at, ended_at,
                   created_at, created_by, updated_at, updated_by, is_deleted, version
            FROM task_instances
            WHERE status = 'IN_PROGRESS'
              AND waiting IS NOT NULL
              AND waiting < $1
              AND ($2::bigint IS NULL OR id > $2)
              AND NOT is_deleted
            ORDER BY id
            LIMIT $3
            "#,
        )
        .bind(now_ms)
        .bind(after.map(|id| id.as_i64()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        into_tasks(rows)
    }

    /// Sets a parked task's deadline if it is still at the read version.
    pub async fn set_waiting(
        &self,
        task: &TaskInstance,
        waiting: Option<i64>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<TaskInstance, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE task_instances
            SET waiting = $3, updated_at = $4, updated_by = $5, version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(task.id.as_i64())
        .bind(task.audit.version)
        .bind(waiting)
        .bind(now)
        .bind(actor)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::VersionConflict {
                entity: "task",
                id: task.id.as_u64(),
            }
            .into());
        }

        let mut updated = task.clone();
        updated.waiting = waiting;
        updated.audit.stamp_update(actor, now);
        Ok(updated)
    }
}

pub(crate) async fn insert_workflow(
    conn: &mut PgConnection,
    workflow: &WorkflowInstance,
    actor: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO workflow_instances
            (id, correlation_id, workflow_definition_id, workflow_definition_name, status,
             input_parameters, started_at, ended_at,
             created_at, created_by, updated_at, updated_by, is_deleted, version)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $9, $10, FALSE, 0)
        "#,
    )
    .bind(workflow.id.as_i64())
    .bind(&workflow.correlation_id)
    .bind(workflow.workflow_definition_id.as_i64())
    .bind(&workflow.workflow_definition_name)
    .bind(workflow.status.as_str())
    .bind(Json(&workflow.input_parameters))
    .bind(workflow.started_at)
    .bind(workflow.ended_at)
    .bind(now)
    .bind(actor)
    .execute(&mut *conn)
    .await
    .map_err(store_error)?;
    Ok(())
}

pub(crate) async fn update_workflow(
    conn: &mut PgConnection,
    workflow: &WorkflowInstance,
    actor: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_instances
        SET status = $3, input_parameters = $4, ended_at = $5,
            updated_at = $6, updated_by = $7, version = version + 1
        WHERE id = $1 AND version = $2
        "#,
    )
    .bind(workflow.id.as_i64())
    .bind(workflow.audit.version)
    .bind(workflow.status.as_str())
    .bind(Json(&workflow.input_parameters))
    .bind(workflow.ended_at)
    .bind(now)
    .bind(actor)
    .execute(&mut *conn)
    .await
    .map_err(store_error)?;

    if result.rows_affected() == 0 {
        return Err(StoreError::VersionConflict {
            entity: "workflow",
            id: workflow.id.as_u64(),
        }
        .into());
    }
    Ok(())
}

pub(crate) async fn insert_task(
    conn: &mut PgConnection,
    task: &TaskInstance,
    actor: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO task_instances
            (id, workflow_instance_id, task_definition_id, task_definition_name, worker_name,
             status, input_parameters, output_parameters, waiting, started_at, ended_at,
             created_at, created_by, updated_at, updated_by, is_deleted, version)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $12, $13, FALSE, 0)
        "#,
    )
    .bind(task.id.as_i64())
    .bind(task.workflow_instance_id.as_i64())
    .bind(task.task_definition_id.as_i64())
    .bind(&task.task_definition_name)
    .bind(&task.worker_name)
    .bind(task.status.as_str())
    .bind(Json(&task.input_parameters))
    .bind(Json(&task.output_parameters))
    .bind(task.waiting)
    .bind(task.started_at)
    .bind(task.ended_at)
    .bind(now)
    .bind(actor)
    .execute(&mut *conn)
    .await
    .map_err(store_error)?;
    Ok(())
}

pub(crate) async fn update_task(
    conn: &mut PgConnection,
    task: &TaskInstance,
    actor: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE task_instances
        SET worker_name = $3, status = $4, input_parameters = $5, output_parameters = $6,
            waiting = $7, ended_at = $8, updated_at = $9, updated_by = $10,
            version = version + 1
        WHERE id = $1 AND version = $2
        "#,
    )
    .bind(task.id.as_i64())
    .bind(task.audit.version)
    .bind(&task.worker_name)
    .bind(task.status.as_str())
    .bind(Json(&task.input_parameters))
    .bind(Json(&task.output_parameters))
    .bind(task.waiting)
    .bind(task.ended_at)
    .bind(now)
    .bind(actor)
    .execute(&mut *conn)
    .await
    .map_err(store_error)?;

    if result.rows_affected() == 0 {
        return Err(StoreError::VersionConflict {
            entity: "task",
            id: task.id.as_u64(),
        }
        .into());
    }
    Ok(())
}
