//! Workflow and task definitions.
//!
//! A workflow definition is a named template: an input template with default
//! values and a set of task definitions. Each task names its predecessors;
//! tasks without predecessors are roots and are dispatched when a workflow
//! starts. The task type decides how a task is reached once a predecessor
//! completes:
//!
//! - `SWITCH` / `BROADCAST`: dispatched unconditionally
//! - `JOIN`: dispatched once every predecessor succeeded
//! - `CASE_WHEN`: dispatched when its predicate holds on the finishing
//!   task's outputs
//! - `WAIT`: parked until a deadline, then re-injected by the poller

use crate::audit::Audit;
use crate::error::DefinitionError;
use crate::expression::Predicate;
use chrono::{DateTime, Utc};
use petgraph::graph::{DiGraph, NodeIndex};
use rootcause::prelude::ResultExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use switchyard_core::{IdGenerator, Result, TaskDefinitionId, WorkflowDefinitionId};

/// String-keyed parameter map used for inputs, outputs and templates.
pub type Parameters = Map<String, Value>;

/// How a task is reached from its predecessors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    #[default]
    Switch,
    Broadcast,
    Join,
    CaseWhen,
    Wait,
}

impl TaskType {
    pub const ALL: [Self; 5] = [
        Self::Switch,
        Self::Broadcast,
        Self::Join,
        Self::CaseWhen,
        Self::Wait,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Switch => "SWITCH",
            Self::Broadcast => "BROADCAST",
            Self::Join => "JOIN",
            Self::CaseWhen => "CASE_WHEN",
            Self::Wait => "WAIT",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = DefinitionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DefinitionError::UnknownTaskType {
                value: s.to_string(),
            })
    }
}

/// One node of a workflow's task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub id: TaskDefinitionId,
    pub workflow_definition_id: WorkflowDefinitionId,
    pub workflow_definition_name: String,
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Predicate source, only used by `CASE_WHEN`.
    #[serde(rename = "expressionDef")]
    pub expression: Option<String>,
    /// Wait duration in milliseconds, only used by `WAIT`.
    #[serde(rename = "waiting")]
    pub waiting_ms: Option<u64>,
    pub description: Option<String>,
    pub required_input_parameters: Vec<String>,
    pub required_output_parameters: Vec<String>,
    /// Topic dispatch events for this task are published to.
    pub sink: String,
    /// Predecessor task definitions. Empty for roots.
    pub previous_task_ids: BTreeSet<TaskDefinitionId>,
    pub audit: Audit,
}

impl TaskDefinition {
    /// Returns true if the task has no predecessors.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.previous_task_ids.is_empty()
    }

    /// Compiles the `CASE_WHEN` predicate.
    ///
    /// # Errors
    ///
    /// Returns an error if the task has no expression or it does not compile.
    pub fn predicate(&self) -> Result<Predicate, DefinitionError> {
        let Some(source) = self.expression.as_deref() else {
            return Err(DefinitionError::MissingExpression {
                task: self.name.clone(),
            }
            .into());
        };
        Predicate::compile(source).map_err(|e| {
            DefinitionError::InvalidExpression {
                task: self.name.clone(),
                reason: e.to_string(),
            }
            .into()
        })
    }
}

/// A workflow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: WorkflowDefinitionId,
    /// Business key used to start workflows.
    pub name: String,
    pub code: String,
    pub description: Option<String>,
    /// Default input values. Never overrides upstream outputs.
    pub input_template: Parameters,
    pub schema_version: i32,
    pub tasks: Vec<TaskDefinition>,
    pub audit: Audit,
}

impl WorkflowDefinition {
    /// Tasks dispatched when a workflow starts.
    pub fn root_tasks(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.tasks.iter().filter(|t| t.is_root())
    }

    #[must_use]
    pub fn task(&self, id: TaskDefinitionId) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Tasks that list `id` as a predecessor.
    pub fn successors_of(&self, id: TaskDefinitionId) -> impl Iterator<Item = &TaskDefinition> {
        self.tasks
            .iter()
            .filter(move |t| t.previous_task_ids.contains(&id))
    }

    /// Checks the definition is dispatchable.
    ///
    /// # Errors
    ///
    /// Returns the first problem found: blank names or sinks, predecessors
    /// outside the definition, cycles, bad `CASE_WHEN` expressions or `WAIT`
    /// tasks without a duration.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.name.trim().is_empty() {
            return Err(DefinitionError::EmptyName.into());
        }
        if self.code.trim().is_empty() {
            return Err(DefinitionError::EmptyCode.into());
        }

        let known: HashSet<TaskDefinitionId> = self.tasks.iter().map(|t| t.id).collect();
        for task in &self.tasks {
            if task.name.trim().is_empty() {
                return Err(DefinitionError::EmptyTaskName.into());
            }
            if task.sink.trim().is_empty() {
                return Err(DefinitionError::EmptySink {
                    task: task.name.clone(),
                }
                .into());
            }
            if let Some(missing) = task.previous_task_ids.iter().find(|p| !known.contains(p)) {
                return Err(DefinitionError::UnknownPredecessor {
                    task: task.name.clone(),
                    predecessor: missing.to_string(),
                }
                .into());
            }
            match task.task_type {
                TaskType::CaseWhen => {
                    task.predicate()?;
                }
                TaskType::Wait if task.waiting_ms.is_none() => {
                    return Err(DefinitionError::MissingWaitDuration {
                        task: task.name.clone(),
                    }
                    .into());
                }
                _ => {}
            }
        }

        if self.has_cycle() {
            return Err(DefinitionError::CycleDetected.into());
        }
        Ok(())
    }

    fn has_cycle(&self) -> bool {
        let mut graph = DiGraph::<TaskDefinitionId, ()>::new();
        let index: HashMap<TaskDefinitionId, NodeIndex> = self
            .tasks
            .iter()
            .map(|t| (t.id, graph.add_node(t.id)))
            .collect();

        for task in &self.tasks {
            for previous in &task.previous_task_ids {
                if let (Some(from), Some(to)) = (index.get(previous), index.get(&task.id)) {
                    graph.add_edge(*from, *to, ());
                }
            }
        }

        petgraph::algo::is_cyclic_directed(&graph)
    }
}

/// A task definition as submitted, with predecessors named rather than
/// identified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDraft {
    pub name: String,
    #[serde(default, rename = "type")]
    pub task_type: TaskType,
    #[serde(default, rename = "expressionDef")]
    pub expression: Option<String>,
    #[serde(default, rename = "waiting")]
    pub waiting_ms: Option<u64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required_input_parameters: Vec<String>,
    #[serde(default)]
    pub required_output_parameters: Vec<String>,
    pub sink: String,
    /// Names of predecessor tasks in the same draft.
    #[serde(default)]
    pub previous_tasks: Vec<String>,
}

impl TaskDraft {
    /// A `SWITCH` task publishing to `sink`.
    #[must_use]
    pub fn new(name: impl Into<String>, sink: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task_type: TaskType::Switch,
            expression: None,
            waiting_ms: None,
            description: None,
            required_input_parameters: Vec::new(),
            required_output_parameters: Vec::new(),
            sink: sink.into(),
            previous_tasks: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    #[must_use]
    pub fn after(mut self, predecessors: &[&str]) -> Self {
        self.previous_tasks = predecessors.iter().map(|p| (*p).to_string()).collect();
        self
    }

    #[must_use]
    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    #[must_use]
    pub fn with_wait(mut self, waiting_ms: u64) -> Self {
        self.waiting_ms = Some(waiting_ms);
        self
    }

    #[must_use]
    pub fn with_inputs(mut self, keys: &[&str]) -> Self {
        self.required_input_parameters = keys.iter().map(|k| (*k).to_string()).collect();
        self
    }

    #[must_use]
    pub fn with_outputs(mut self, keys: &[&str]) -> Self {
        self.required_output_parameters = keys.iter().map(|k| (*k).to_string()).collect();
        self
    }
}

/// A workflow definition as submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionDraft {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_template: Parameters,
    #[serde(default)]
    pub tasks: Vec<TaskDraft>,
}

impl DefinitionDraft {
    #[must_use]
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
            description: None,
            input_template: Parameters::new(),
            tasks: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_template(mut self, template: Parameters) -> Self {
        self.input_template = template;
        self
    }

    #[must_use]
    pub fn with_task(mut self, task: TaskDraft) -> Self {
        self.tasks.push(task);
        self
    }

    /// Assigns ids, resolves predecessor names and validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error for duplicate or unknown task names, any
    /// [`WorkflowDefinition::validate`] failure, or if ids cannot be minted.
    pub fn build(
        self,
        ids: &IdGenerator,
        schema_version: i32,
        now: DateTime<Utc>,
    ) -> Result<WorkflowDefinition, DefinitionError> {
        let definition_id: WorkflowDefinitionId =
            ids.next().context(DefinitionError::IdGeneration)?;

        let mut by_name = HashMap::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let id: TaskDefinitionId = ids.next().context(DefinitionError::IdGeneration)?;
            if by_name.insert(task.name.clone(), id).is_some() {
                return Err(DefinitionError::DuplicateTaskName {
                    name: task.name.clone(),
                }
                .into());
            }
        }

        let mut tasks = Vec::with_capacity(self.tasks.len());
        for draft in self.tasks {
            let mut previous_task_ids = BTreeSet::new();
            for predecessor in &draft.previous_tasks {
                let Some(id) = by_name.get(predecessor) else {
                    return Err(DefinitionError::UnknownPredecessor {
                        task: draft.name.clone(),
                        predecessor: predecessor.clone(),
                    }
                    .into());
                };
                previous_task_ids.insert(*id);
            }

            tasks.push(TaskDefinition {
                id: by_name[&draft.name],
                workflow_definition_id: definition_id,
                workflow_definition_name: self.name.clone(),
                name: draft.name,
                task_type: draft.task_type,
                expression: draft.expression,
                waiting_ms: draft.waiting_ms,
                description: draft.description,
                required_input_parameters: draft.required_input_parameters,
                required_output_parameters: draft.required_output_parameters,
                sink: draft.sink,
                previous_task_ids,
                audit: Audit::new(now),
            });
        }

        let definition = WorkflowDefinition {
            id: definition_id,
            name: self.name,
            code: self.code,
            description: self.description,
            input_template: self.input_template,
            schema_version,
            tasks,
            audit: Audit::new(now),
        };
        definition.validate()?;
        Ok(definition)
    }
}
