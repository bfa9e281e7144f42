//! Repository for workflow and task definitions.

use super::{AuditColumns, decode_error, parameters, store_error};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};
use std::collections::{BTreeSet, HashMap};
use switchyard_core::{Result, TaskDefinitionId, WorkflowDefinitionId};
use switchyard_workflow::{StoreError, TaskDefinition, WorkflowDefinition};

/// Row type for workflow definition queries.
#[derive(FromRow)]
struct WorkflowDefinitionRow {
    id: i64,
    name: String,
    code: String,
    description: Option<String>,
    input_template: serde_json::Value,
    schema_version: i32,
    #[sqlx(flatten)]
    audit: AuditColumns,
}

impl WorkflowDefinitionRow {
    fn try_into_record(
        self,
        tasks: Vec<TaskDefinition>,
    ) -> Result<WorkflowDefinition, StoreError> {
        Ok(WorkflowDefinition {
            id: WorkflowDefinitionId::from_i64(self.id)
                .map_err(|e| decode_error("workflow definition id", e))?,
            name: self.name,
            code: self.code,
            description: self.description,
            input_template: parameters("input template", self.input_template)?,
            schema_version: self.schema_version,
            tasks,
            audit: self.audit.into(),
        })
    }
}

/// Row type for task definition queries.
#[derive(FromRow)]
struct TaskDefinitionRow {
    id: i64,
    workflow_definition_id: i64,
    workflow_definition_name: String,
    name: String,
    task_type: String,
    expression_def: Option<String>,
    waiting_ms: Option<i64>,
    description: Option<String>,
    required_input_parameters: Vec<String>,
    required_output_parameters: Vec<String>,
    sink: String,
    previous_task_ids: Vec<i64>,
    #[sqlx(flatten)]
    audit: AuditColumns,
}

impl TaskDefinitionRow {
    fn try_into_record(self) -> Result<TaskDefinition, StoreError> {
        let previous_task_ids = self
            .previous_task_ids
            .into_iter()
            .map(TaskDefinitionId::from_i64)
            .collect::<std::result::Result<BTreeSet<_>, _>>()
            .map_err(|e| decode_error("previous task id", e))?;
        let waiting_ms = self
            .waiting_ms
            .map(u64::try_from)
            .transpose()
            .map_err(|e| decode_error("waiting_ms", e))?;

        Ok(TaskDefinition {
            id: TaskDefinitionId::from_i64(self.id)
                .map_err(|e| decode_error("task definition id", e))?,
            workflow_definition_id: WorkflowDefinitionId::from_i64(self.workflow_definition_id)
                .map_err(|e| decode_error("workflow definition id", e))?,
            workflow_definition_name: self.workflow_definition_name,
            name: self.name,
            task_type: self
                .task_type
                .parse()
                .map_err(|e| decode_error("task type", e))?,
            expression: self.expression_def,
            waiting_ms,
            description: self.description,
            required_input_parameters: self.required_input_parameters,
            required_output_parameters: self.required_output_parameters,
            sink: self.sink,
            previous_task_ids,
            audit: self.audit.into(),
        })
    }
}

/// Repository for definition rows.
#[derive(Clone)]
pub struct WorkflowDefinitionRepository {
    pool: PgPool,
}

impl WorkflowDefinitionRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Live definitions, optionally with one name, newest first.
    pub async fn list_live(
        &self,
        name: Option<&str>,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let rows: Vec<WorkflowDefinitionRow> = sqlx::query_as(
            r#"
            SELECT id, name, code, description, input_template, schema_version,
                   created_at, created_by, updated_at, updated_by, is_deleted, version
            FROM workflow_definitions
            WHERE NOT is_deleted AND ($1::text IS NULL OR name = $1)
            ORDER BY id DESC
            "#,
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        self.attach_tasks(rows).await
    }

    /// The live definition named `name`.
    pub async fn find_live_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self.list_live(Some(name)).await?.into_iter().next())
    }

    /// A definition by id, soft-deleted or not.
    pub async fn find(
        &self,
        id: WorkflowDefinitionId,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row: Option<WorkflowDefinitionRow> = sqlx::query_as(
            r#"
            SELECT id, name, code, description, input_template, schema_version,
                   created_at, created_by, updated_at, updated_by, is_deleted, version
            FROM workflow_definitions
            WHERE id = $1
            "#,
        )
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        match row {
            Some(row) => Ok(self.attach_tasks(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    pub async fn find_task(
        &self,
        id: TaskDefinitionId,
    ) -> Result<Option<TaskDefinition>, StoreError> {
        let row: Option<TaskDefinitionRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_definition_id, workflow_definition_name, name, task_type,
                   expression_def, waiting_ms, description, required_input_parameters,
                   required_output_parameters, sink, previous_task_ids,
                   created_at, created_by, updated_at, updated_by, is_deleted, version
            FROM task_definitions
            WHERE id = $1
            "#,
        )
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(TaskDefinitionRow::try_into_record).transpose()
    }

    /// Stores a new definition and its tasks.
    pub async fn create(
        &self,
        definition: &WorkflowDefinition,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        insert(&mut *tx, definition, actor, now).await?;
        tx.commit().await.map_err(store_error)
    }

    /// Soft-deletes `previous` and stores `next` in one transaction.
    pub async fn replace(
        &self,
        previous: &WorkflowDefinition,
        next: &WorkflowDefinition,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        let deleted = sqlx::query(
            r#"
            UPDATE workflow_definitions
            SET is_deleted = TRUE, updated_at = $3, updated_by = $4, version = version + 1
            WHERE id = $1 AND version = $2 AND NOT is_deleted
            "#,
        )
        .bind(previous.id.as_i64())
        .bind(previous.audit.version)
        .bind(now)
        .bind(actor)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::VersionConflict {
                entity: "workflow definition",
                id: previous.id.as_u64(),
            }
            .into());
        }

        sqlx::query(
            r#"
            UPDATE task_definitions
            SET is_deleted = TRUE, updated_at = $2, updated_by = $3, version = version + 1
            WHERE workflow_definition_id = $1
            "#,
        )
        .bind(previous.id.as_i64())
        .bind(now)
        .bind(actor)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        insert(&mut *tx, next, actor, now).await?;
        tx.commit().await.map_err(store_error)
    }

    async fn attach_tasks(
        &self,
        rows: Vec<WorkflowDefinitionRow>,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
        let task_rows: Vec<TaskDefinitionRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_definition_id, workflow_definition_name, name, task_type,
                   expression_def, waiting_ms, description, required_input_parameters,
                   required_output_parameters, sink, previous_task_ids,
                   created_at, created_by, updated_at, updated_by, is_deleted, version
            FROM task_definitions
            WHERE workflow_definition_id = ANY($1)
            ORDER BY workflow_definition_id, position
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        let mut tasks: HashMap<i64, Vec<TaskDefinition>> = HashMap::new();
        for row in task_rows {
            let owner = row.workflow_definition_id;
            tasks.entry(owner).or_default().push(row.try_into_record()?);
        }

        rows.into_iter()
            .map(|row| {
                let owned = tasks.remove(&row.id).unwrap_or_default();
                row.try_into_record(owned)
            })
            .collect()
    }
}

async fn insert(
    conn: &mut PgConnection,
    definition: &WorkflowDefinition,
    actor: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO workflow_definitions
            (id, name, code, description, input_template, schema_version,
             created_at, created_by, updated_at, updated_by, is_deleted, version)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $7, $8, FALSE, 0)
        "#,
    )
    .bind(definition.id.as_i64())
    .bind(&definition.name)
    .bind(&definition.code)
    .bind(&definition.description)
    .bind(Json(&definition.input_template))
    .bind(definition.schema_version)
    .bind(now)
    .bind(actor)
    .execute(&mut *conn)
    .await
    .map_err(store_error)?;

    for (position, task) in definition.tasks.iter().enumerate() {
        let previous: Vec<i64> = task.previous_task_ids.iter().map(|id| id.as_i64()).collect();
        let waiting_ms = task
            .waiting_ms
            .map(i64::try_from)
            .transpose()
            .map_err(|e| decode_error("waiting_ms", e))?;
        let position =
            i32::try_from(position).map_err(|e| decode_error("task position", e))?;

        sqlx::query(
            r#"
            INSERT INTO task_definitions
                (id, workflow_definition_id, workflow_definition_name, position, name,
                 task_type, expression_def, waiting_ms, description,
                 required_input_parameters, required_output_parameters, sink,
                 previous_task_ids, created_at, created_by, updated_at, updated_by,
                 is_deleted, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $14, $15, FALSE, 0)
            "#,
        )
        .bind(task.id.as_i64())
        .bind(definition.id.as_i64())
        .bind(&definition.name)
        .bind(position)
        .bind(&task.name)
        .bind(task.task_type.as_str())
        .bind(&task.expression)
        .bind(waiting_ms)
        .bind(&task.description)
        .bind(&task.required_input_parameters)
        .bind(&task.required_output_parameters)
        .bind(&task.sink)
        .bind(&previous)
        .bind(now)
        .bind(actor)
        .execute(&mut *conn)
        .await
        .map_err(store_error)?;
    }

    Ok(())
}
