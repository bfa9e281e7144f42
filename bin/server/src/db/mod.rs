//! Database access for the switchyard server.
//!
//! - Row types and repositories for definitions and instances
//! - [`PgWorkflowStore`], the Postgres implementation of the workflow store
//! - The [`Catalog`] read/write seam used by the management API

pub mod definition;
pub mod instance;
pub mod memory;
pub mod store;

pub use definition::WorkflowDefinitionRepository;
pub use instance::InstanceRepository;
pub use store::PgWorkflowStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rootcause::Report;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use switchyard_core::{Result, WorkflowDefinitionId, WorkflowInstanceId};
use switchyard_workflow::{
    Audit, Parameters, StoreError, TaskInstance, WorkflowDefinition, WorkflowInstance,
    WorkflowStatus,
};

/// Filter for instance listings. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct WorkflowFilter {
    pub status: Option<WorkflowStatus>,
    pub correlation_id: Option<String>,
}

impl WorkflowFilter {
    #[must_use]
    pub fn matches(&self, workflow: &WorkflowInstance) -> bool {
        self.status.is_none_or(|status| workflow.status == status)
            && self
                .correlation_id
                .as_deref()
                .is_none_or(|id| workflow.correlation_id == id)
    }
}

/// A workflow instance with its task instances.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDetail {
    #[serde(flatten)]
    pub workflow: WorkflowInstance,
    pub tasks: Vec<TaskInstance>,
}

/// Definition and instance queries behind the management API.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Live definitions, optionally restricted to one name.
    async fn list_definitions(
        &self,
        name: Option<&str>,
    ) -> Result<Vec<WorkflowDefinition>, StoreError>;

    /// A definition by id, including soft-deleted versions.
    async fn get_definition(
        &self,
        id: WorkflowDefinitionId,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;

    /// Stores a new definition.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] if a live definition already uses
    /// the name or code.
    async fn create_definition(&self, definition: WorkflowDefinition) -> Result<(), StoreError>;

    /// Soft-deletes `previous` and stores `next` in one step.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::VersionConflict`] if `previous` changed or was
    /// already replaced.
    async fn replace_definition(
        &self,
        previous: &WorkflowDefinition,
        next: WorkflowDefinition,
    ) -> Result<(), StoreError>;

    async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowInstance>, StoreError>;

    async fn get_workflow(
        &self,
        id: WorkflowInstanceId,
    ) -> Result<Option<WorkflowDetail>, StoreError>;
}

/// Maps a sqlx failure onto the store error taxonomy.
pub(crate) fn store_error(error: sqlx::Error) -> Report<StoreError> {
    match &error {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate {
            message: db.message().to_string(),
        }
        .into(),
        sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => {
            StoreError::decode(error.to_string()).into()
        }
        _ => StoreError::database(error.to_string()).into(),
    }
}

/// Maps a row that cannot be turned back into a record.
pub(crate) fn decode_error(what: &str, reason: impl std::fmt::Display) -> Report<StoreError> {
    StoreError::decode(format!("{what}: {reason}")).into()
}

/// Audit columns shared by every table.
#[derive(FromRow)]
pub(crate) struct AuditColumns {
    created_at: DateTime<Utc>,
    created_by: Option<String>,
    updated_at: DateTime<Utc>,
    updated_by: Option<String>,
    is_deleted: bool,
    version: i64,
}

impl From<AuditColumns> for Audit {
    fn from(row: AuditColumns) -> Self {
        Self {
            created_at: row.created_at,
            created_by: row.created_by,
            updated_at: row.updated_at,
            updated_by: row.updated_by,
            deleted: row.is_deleted,
            version: row.version,
        }
    }
}

/// Reads a `JSONB` object column as a parameter map.
pub(crate) fn parameters(what: &str, value: serde_json::Value) -> Result<Parameters, StoreError> {
    match value {
        serde_json::Value::Object(map) => Ok(map),
        serde_json::Value::Null => Ok(Parameters::new()),
        other => Err(decode_error(what, format!("expected a JSON object, got {other}"))),
    }
}
