//! Workflow engine for switchyard.
//!
//! This crate holds the workflow model and the decider that advances it:
//!
//! - **Definitions**: task graphs of SWITCH, BROADCAST, JOIN, CASE_WHEN and
//!   WAIT tasks, validated with petgraph
//! - **Instances**: workflow and task runs with their statuses
//! - **Expressions**: the boolean predicate language of CASE_WHEN tasks
//! - **Decider**: the start/finish state machine
//! - **Store**: the persistence port, with an in-memory implementation
//! - **Handler**: the message handler feeding the decider from the bus

pub mod audit;
pub mod decider;
pub mod definition;
pub mod error;
pub mod expression;
pub mod handler;
pub mod instance;
pub mod memory;
pub mod message;
pub mod status;
pub mod store;

pub use audit::Audit;
pub use decider::{DecisionReport, Decider, FinishOutcome, StartOutcome};
pub use definition::{
    DefinitionDraft, Parameters, TaskDefinition, TaskDraft, TaskType, WorkflowDefinition,
};
pub use error::{DeciderError, DefinitionError, MessageError, StoreError};
pub use expression::{ExpressionError, Predicate};
pub use handler::WorkflowEventHandler;
pub use instance::{TaskInstance, WorkflowInstance};
pub use memory::InMemoryWorkflowStore;
pub use message::{
    DISPATCH_TASK, FINISH_TASK, FinishTask, START_WORKFLOW, StartWorkflow, WorkflowMessage,
    dispatch_key,
};
pub use status::{TaskStatus, UnknownStatus, WorkflowStatus};
pub use store::{Changeset, WorkflowStore};
