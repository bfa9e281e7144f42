//! Runtime records created by the decider.

use crate::audit::Audit;
use crate::definition::{Parameters, TaskDefinition, WorkflowDefinition};
use crate::status::{TaskStatus, WorkflowStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use switchyard_core::{TaskDefinitionId, TaskInstanceId, WorkflowDefinitionId, WorkflowInstanceId};

/// One run of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    pub id: WorkflowInstanceId,
    /// Caller-supplied run identifier, also the partition key.
    pub correlation_id: String,
    pub workflow_definition_id: WorkflowDefinitionId,
    pub workflow_definition_name: String,
    pub status: WorkflowStatus,
    pub input_parameters: Parameters,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub audit: Audit,
}

impl WorkflowInstance {
    /// A new `RUNNING` instance of `definition`.
    #[must_use]
    pub fn start(
        id: WorkflowInstanceId,
        correlation_id: impl Into<String>,
        definition: &WorkflowDefinition,
        input_parameters: Parameters,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            correlation_id: correlation_id.into(),
            workflow_definition_id: definition.id,
            workflow_definition_name: definition.name.clone(),
            status: WorkflowStatus::Running,
            input_parameters,
            started_at: now,
            ended_at: None,
            audit: Audit::new(now),
        }
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = WorkflowStatus::Completed;
        self.ended_at = Some(now);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == WorkflowStatus::Running
    }
}

/// One dispatch of a task definition within a workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInstance {
    pub id: TaskInstanceId,
    pub workflow_instance_id: WorkflowInstanceId,
    pub task_definition_id: TaskDefinitionId,
    pub task_definition_name: String,
    pub worker_name: Option<String>,
    pub status: TaskStatus,
    pub input_parameters: Parameters,
    pub output_parameters: Parameters,
    /// Epoch-millisecond deadline of a parked `WAIT` task.
    pub waiting: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub audit: Audit,
}

impl TaskInstance {
    /// A task handed to a worker.
    #[must_use]
    pub fn in_progress(
        id: TaskInstanceId,
        workflow: &WorkflowInstance,
        definition: &TaskDefinition,
        input_parameters: Parameters,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            workflow_instance_id: workflow.id,
            task_definition_id: definition.id,
            task_definition_name: definition.name.clone(),
            worker_name: None,
            status: TaskStatus::InProgress,
            input_parameters,
            output_parameters: Parameters::new(),
            waiting: None,
            started_at: now,
            ended_at: None,
            audit: Audit::new(now),
        }
    }

    /// A task parked until `deadline_ms`.
    #[must_use]
    pub fn parked(
        id: TaskInstanceId,
        workflow: &WorkflowInstance,
        definition: &TaskDefinition,
        input_parameters: Parameters,
        deadline_ms: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            waiting: Some(deadline_ms),
            ..Self::in_progress(id, workflow, definition, input_parameters, now)
        }
    }

    /// Records a worker's result.
    pub fn finish(
        &mut self,
        status: TaskStatus,
        output_parameters: Parameters,
        worker_name: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.status = status;
        self.output_parameters = output_parameters;
        self.worker_name = worker_name;
        self.ended_at = Some(now);
    }

    /// True if parked and the deadline has passed.
    #[must_use]
    pub fn is_due(&self, now_ms: i64) -> bool {
        self.status == TaskStatus::InProgress && self.waiting.is_some_and(|deadline| deadline < now_ms)
    }
}
