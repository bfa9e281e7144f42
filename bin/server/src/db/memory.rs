//! [`Catalog`] over the in-memory workflow store, for tests and local runs.

use super::{Catalog, WorkflowDetail, WorkflowFilter};
use async_trait::async_trait;
use switchyard_core::{Result, WorkflowDefinitionId, WorkflowInstanceId};
use switchyard_workflow::{InMemoryWorkflowStore, StoreError, WorkflowDefinition, WorkflowInstance};

#[async_trait]
impl Catalog for InMemoryWorkflowStore {
    async fn list_definitions(
        &self,
        name: Option<&str>,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let mut live: Vec<_> = self
            .definitions()
            .into_iter()
            .filter(|d| !d.audit.deleted && name.is_none_or(|name| d.name == name))
            .collect();
        live.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(live)
    }

    async fn get_definition(
        &self,
        id: WorkflowDefinitionId,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self.definitions().into_iter().find(|d| d.id == id))
    }

    async fn create_definition(&self, definition: WorkflowDefinition) -> Result<(), StoreError> {
        let taken = self.definitions().iter().any(|d| {
            !d.audit.deleted && (d.name == definition.name || d.code == definition.code)
        });
        if taken {
            return Err(StoreError::Duplicate {
                message: format!("definition {} already exists", definition.name),
            }
            .into());
        }
        self.insert_definition(definition);
        Ok(())
    }

    async fn replace_definition(
        &self,
        previous: &WorkflowDefinition,
        next: WorkflowDefinition,
    ) -> Result<(), StoreError> {
        if !self.delete_definition(previous.id) {
            return Err(StoreError::VersionConflict {
                entity: "workflow definition",
                id: previous.id.as_u64(),
            }
            .into());
        }
        self.insert_definition(next);
        Ok(())
    }

    async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let mut workflows: Vec<_> = self
            .workflows()
            .into_iter()
            .filter(|w| filter.matches(w))
            .collect();
        workflows.reverse();
        Ok(workflows)
    }

    async fn get_workflow(
        &self,
        id: WorkflowInstanceId,
    ) -> Result<Option<WorkflowDetail>, StoreError> {
        Ok(self.workflow(id).map(|workflow| WorkflowDetail {
            tasks: self
                .tasks()
                .into_iter()
                .filter(|t| t.workflow_instance_id == id)
                .collect(),
            workflow,
        }))
    }
}
