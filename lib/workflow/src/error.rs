//! Error types for the workflow engine.
//!
//! Store and publish failures are transient: redelivering the message that
//! caused them may succeed. Definition errors and malformed messages are not.

use std::fmt;

/// Problems with a submitted workflow definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    EmptyName,
    EmptyCode,
    EmptyTaskName,
    DuplicateTaskName { name: String },
    EmptySink { task: String },
    UnknownPredecessor { task: String, predecessor: String },
    UnknownTaskType { value: String },
    CycleDetected,
    MissingExpression { task: String },
    InvalidExpression { task: String, reason: String },
    MissingWaitDuration { task: String },
    /// Ids could not be minted for the definition.
    IdGeneration,
}

impl fmt::Display for DefinitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyName => write!(f, "workflow definition name is empty"),
            Self::EmptyCode => write!(f, "workflow definition code is empty"),
            Self::EmptyTaskName => write!(f, "task name is empty"),
            Self::DuplicateTaskName { name } => write!(f, "duplicate task name '{name}'"),
            Self::EmptySink { task } => write!(f, "task '{task}' has no sink"),
            Self::UnknownPredecessor { task, predecessor } => {
                write!(f, "task '{task}' follows unknown task '{predecessor}'")
            }
            Self::UnknownTaskType { value } => write!(f, "unknown task type '{value}'"),
            Self::CycleDetected => write!(f, "task graph contains a cycle"),
            Self::MissingExpression { task } => {
                write!(f, "CASE_WHEN task '{task}' has no expression")
            }
            Self::InvalidExpression { task, reason } => {
                write!(f, "task '{task}' has an invalid expression: {reason}")
            }
            Self::MissingWaitDuration { task } => {
                write!(f, "WAIT task '{task}' has no waiting duration")
            }
            Self::IdGeneration => write!(f, "failed to generate definition ids"),
        }
    }
}

impl std::error::Error for DefinitionError {}

/// A workflow message that cannot become a decider command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    MissingField { field: &'static str },
    UnsupportedSubject { subject: Option<String> },
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField { field } => write!(f, "message is missing '{field}'"),
            Self::UnsupportedSubject { subject: Some(subject) } => {
                write!(f, "unsupported subject '{subject}'")
            }
            Self::UnsupportedSubject { subject: None } => write!(f, "message has no subject"),
        }
    }
}

impl std::error::Error for MessageError {}

/// Errors from a [`WorkflowStore`](crate::WorkflowStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The database could not be reached or a statement failed.
    Database { message: String },
    /// An update was based on a stale version.
    VersionConflict { entity: &'static str, id: u64 },
    /// A stored row could not be mapped back into a record.
    Decode { message: String },
    /// A unique constraint rejected the write.
    Duplicate { message: String },
}

impl StoreError {
    /// Creates a database error.
    #[must_use]
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    /// Creates a decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database { message } => write!(f, "database error: {message}"),
            Self::VersionConflict { entity, id } => {
                write!(f, "{entity} {id} was modified concurrently")
            }
            Self::Decode { message } => write!(f, "failed to decode stored record: {message}"),
            Self::Duplicate { message } => write!(f, "duplicate record: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors from the [`Decider`](crate::Decider).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeciderError {
    /// Reading or committing state failed.
    Store,
    /// A dispatch event could not be published.
    Publish,
    /// The id generator refused to mint an id.
    IdGeneration,
    /// A dispatch event could not be serialized.
    Serialization,
}

impl DeciderError {
    /// Whether redelivering the triggering message may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Store | Self::Publish)
    }
}

impl fmt::Display for DeciderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store => write!(f, "workflow store failure"),
            Self::Publish => write!(f, "failed to publish dispatch event"),
            Self::IdGeneration => write!(f, "failed to generate instance id"),
            Self::Serialization => write!(f, "failed to serialize dispatch event"),
        }
    }
}

impl std::error::Error for DeciderError {}
