//! Wire contract of the workflow event topic and task sinks.
//!
//! One content shape serves every subject; each subject reads the fields it
//! needs:
//!
//! | subject          | fields                                                              |
//! |------------------|---------------------------------------------------------------------|
//! | `START_WORKFLOW` | correlationId, workflowDefName, inputParameters                     |
//! | `FINISH_TASK`    | taskId, taskDefName, outputParameters, correlationId, taskStatus, workerName, requiredOutputParameters |
//! | `DISPATCH_TASK`  | taskId, taskDefName, inputParameters, requiredOutputParameters, correlationId, taskStatus |

use crate::definition::{Parameters, TaskDefinition};
use crate::error::MessageError;
use crate::instance::{TaskInstance, WorkflowInstance};
use crate::status::TaskStatus;
use serde::{Deserialize, Serialize};
use switchyard_core::TaskInstanceId;

pub const START_WORKFLOW: &str = "START_WORKFLOW";
pub const FINISH_TASK: &str = "FINISH_TASK";
pub const DISPATCH_TASK: &str = "DISPATCH_TASK";

/// Partition key for every event of one workflow run.
#[must_use]
pub fn dispatch_key(workflow_def_name: &str, correlation_id: &str) -> String {
    format!("{workflow_def_name}:{correlation_id}")
}

/// Content of a workflow envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_def_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_parameters: Option<Parameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskInstanceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_def_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_output_parameters: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_parameters: Option<Parameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_name: Option<String>,
}

impl WorkflowMessage {
    #[must_use]
    pub fn start(
        correlation_id: impl Into<String>,
        workflow_def_name: impl Into<String>,
        input_parameters: Parameters,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            workflow_def_name: Some(workflow_def_name.into()),
            input_parameters: Some(input_parameters),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn finish(
        task_id: TaskInstanceId,
        status: TaskStatus,
        output_parameters: Parameters,
        worker_name: impl Into<String>,
    ) -> Self {
        Self {
            task_id: Some(task_id),
            task_status: Some(status),
            output_parameters: Some(output_parameters),
            worker_name: Some(worker_name.into()),
            ..Self::default()
        }
    }

    /// The event a worker receives for `task`.
    #[must_use]
    pub fn dispatch(workflow: &WorkflowInstance, definition: &TaskDefinition, task: &TaskInstance) -> Self {
        Self {
            correlation_id: Some(workflow.correlation_id.clone()),
            task_id: Some(task.id),
            task_def_name: Some(definition.name.clone()),
            input_parameters: Some(task.input_parameters.clone()),
            required_output_parameters: Some(definition.required_output_parameters.clone()),
            task_status: Some(TaskStatus::InProgress),
            ..Self::default()
        }
    }

    /// Adds the finishing task's name and correlation id.
    #[must_use]
    pub fn for_task(mut self, task_def_name: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        self.task_def_name = Some(task_def_name.into());
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Request to start a run of a named workflow definition.
#[derive(Debug, Clone, PartialEq)]
pub struct StartWorkflow {
    pub correlation_id: String,
    pub workflow_def_name: String,
    pub input_parameters: Parameters,
}

impl TryFrom<&WorkflowMessage> for StartWorkflow {
    type Error = MessageError;

    fn try_from(message: &WorkflowMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            correlation_id: required(message.correlation_id.as_ref(), "correlationId")?.clone(),
            workflow_def_name: required(message.workflow_def_name.as_ref(), "workflowDefName")?
                .clone(),
            input_parameters: message.input_parameters.clone().unwrap_or_default(),
        })
    }
}

/// A worker's report that a task ended.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishTask {
    pub task_id: TaskInstanceId,
    pub status: TaskStatus,
    pub output_parameters: Parameters,
    pub worker_name: Option<String>,
}

impl TryFrom<&WorkflowMessage> for FinishTask {
    type Error = MessageError;

    fn try_from(message: &WorkflowMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            task_id: *required(message.task_id.as_ref(), "taskId")?,
            status: *required(message.task_status.as_ref(), "taskStatus")?,
            output_parameters: message.output_parameters.clone().unwrap_or_default(),
            worker_name: message.worker_name.clone(),
        })
    }
}

fn required<'a, T>(value: Option<&'a T>, field: &'static str) -> Result<&'a T, MessageError> {
    value.ok_or(MessageError::MissingField { field })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use switchyard_messaging::Envelope;

    #[test]
    fn start_message_from_wire() {
        let envelope: Envelope<WorkflowMessage> = serde_json::from_value(json!({
            "messageId": "42",
            "subject": "START_WORKFLOW",
            "content": {
                "correlationId": "order-1",
                "workflowDefName": "order-flow",
                "inputParameters": {"amount": 150}
            }
        }))
        .expect("deserialize");

        let message = envelope.content().expect("content");
        let start = StartWorkflow::try_from(message).expect("complete");
        assert_eq!(start.correlation_id, "order-1");
        assert_eq!(start.workflow_def_name, "order-flow");
        assert_eq!(start.input_parameters["amount"], 150);
    }

    #[test]
    fn finish_message_from_wire() {
        let message: WorkflowMessage = serde_json::from_value(json!({
            "taskId": "7",
            "taskDefName": "A",
            "taskStatus": "COMPLETED_WITH_ERRORS",
            "workerName": "w-1",
            "outputParameters": {"x": 1}
        }))
        .expect("deserialize");

        let finish = FinishTask::try_from(&message).expect("complete");
        assert_eq!(finish.task_id, TaskInstanceId::new(7));
        assert_eq!(finish.status, TaskStatus::CompletedWithErrors);
        assert_eq!(finish.worker_name.as_deref(), Some("w-1"));
    }

    #[test]
    fn missing_fields_are_reported() {
        let err = FinishTask::try_from(&WorkflowMessage::default()).expect_err("incomplete");
        assert_eq!(err, MessageError::MissingField { field: "taskId" });

        let err = StartWorkflow::try_from(&WorkflowMessage {
            correlation_id: Some("c".into()),
            ..WorkflowMessage::default()
        })
        .expect_err("incomplete");
        assert_eq!(
            err,
            MessageError::MissingField {
                field: "workflowDefName"
            }
        );
    }

    #[test]
    fn absent_fields_are_not_serialized() {
        let message = WorkflowMessage::finish(
            TaskInstanceId::new(9),
            TaskStatus::Completed,
            Parameters::new(),
            "poller",
        );
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(
            value,
            json!({"taskId": "9", "taskStatus": "COMPLETED", "outputParameters": {}, "workerName": "poller"})
        );
    }

    #[test]
    fn key_joins_name_and_correlation() {
        assert_eq!(dispatch_key("order-flow", "order-1"), "order-flow:order-1");
    }
}
