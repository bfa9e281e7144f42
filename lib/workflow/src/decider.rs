//! Workflow state machine.
//!
//! The [`Decider`] reacts to two commands. [`Decider::start_workflow`]
//! creates a run and dispatches its root tasks. [`Decider::finish_task`]
//! records a worker's result and decides which successors are reached.
//!
//! Each command produces one decision: the records to write and the
//! dispatch events to publish. Events are published before the records are
//! committed, so a failure anywhere leaves the triggering message to be
//! retried and workers may see a dispatch more than once, never zero times.
//! A dispatch whose commit failed names a task that was never stored; its
//! finish event finds no IN_PROGRESS task and is ignored.

use crate::definition::{Parameters, TaskDefinition, TaskType, WorkflowDefinition};
use crate::error::DeciderError;
use crate::instance::{TaskInstance, WorkflowInstance};
use crate::message::{DISPATCH_TASK, FinishTask, StartWorkflow, WorkflowMessage, dispatch_key};
use crate::status::TaskStatus;
use crate::store::{Changeset, WorkflowStore};
use chrono::{DateTime, Utc};
use rootcause::prelude::ResultExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use switchyard_core::{
    IdGenerator, MessageId, Result, TaskDefinitionId, TaskInstanceId, WorkflowInstanceId,
};
use switchyard_messaging::{Envelope, MessageBus, publish_json};
use tracing::{debug, error, info, instrument, warn};

/// What a decision did, for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecisionReport {
    /// Names of tasks published to their sink.
    pub dispatched: Vec<String>,
    /// Names of `WAIT` tasks parked for the poller.
    pub parked: Vec<String>,
    /// The workflow reached `COMPLETED`.
    pub workflow_completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// No live definition has the requested name.
    UnknownDefinition,
    Started {
        workflow_id: WorkflowInstanceId,
        report: DecisionReport,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishOutcome {
    /// The task does not exist or is no longer `IN_PROGRESS`.
    NotInProgress,
    /// The task's workflow does not exist.
    UnknownWorkflow,
    /// The result was stored but the workflow is not running.
    NotPropagated,
    /// The result was stored; a non-`COMPLETED` status reaches no successor.
    Recorded,
    /// The result was stored but its definition could not be found.
    UnknownTaskDefinition,
    Advanced(DecisionReport),
}

struct Outbound {
    topic: String,
    key: String,
    envelope: Envelope<WorkflowMessage>,
}

#[derive(Default)]
struct Decision {
    changes: Changeset,
    outbound: Vec<Outbound>,
    report: DecisionReport,
}

/// Advances workflow runs through their task graphs.
pub struct Decider<S, B> {
    store: S,
    bus: B,
    ids: Arc<IdGenerator>,
}

impl<S, B> Decider<S, B>
where
    S: WorkflowStore,
    B: MessageBus,
{
    pub fn new(store: S, bus: B, ids: Arc<IdGenerator>) -> Self {
        Self { store, bus, ids }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Starts a run of the named workflow definition.
    ///
    /// A definition without root tasks completes immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or bus fails, or no id can be minted.
    #[instrument(
        skip_all,
        fields(
            correlation_id = %command.correlation_id,
            workflow_definition = %command.workflow_def_name
        )
    )]
    pub async fn start_workflow(
        &self,
        command: StartWorkflow,
    ) -> Result<StartOutcome, DeciderError> {
        let Some(definition) = self
            .store
            .find_definition_by_name(&command.workflow_def_name)
            .await
            .context(DeciderError::Store)?
        else {
            warn!("unknown workflow definition, dropping start request");
            return Ok(StartOutcome::UnknownDefinition);
        };

        let now = Utc::now();
        let mut inputs = command.input_parameters;
        fill_from_template(&mut inputs, &definition.input_template);

        let mut workflow = WorkflowInstance::start(
            self.ids.next().context(DeciderError::IdGeneration)?,
            command.correlation_id,
            &definition,
            inputs,
            now,
        );
        let workflow_id = workflow.id;
        let mut decision = Decision::default();

        let roots: Vec<&TaskDefinition> = definition.root_tasks().collect();
        if roots.is_empty() {
            info!("definition has no root tasks, completing immediately");
            workflow.complete(now);
            decision.report.workflow_completed = true;
        }
        for root in roots {
            self.plan(
                &mut decision,
                &definition,
                &workflow,
                root,
                &workflow.input_parameters,
                now,
            )?;
        }

        decision.changes.insert_workflows.push(workflow);
        let report = self.apply(decision).await?;
        info!(%workflow_id, dispatched = ?report.dispatched, "workflow started");
        Ok(StartOutcome::Started {
            workflow_id,
            report,
        })
    }

    /// Records a task result and advances its workflow.
    ///
    /// A task that is no longer `IN_PROGRESS` is left untouched, which makes
    /// repeated finish events harmless.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or bus fails, or no id can be minted.
    #[instrument(skip_all, fields(task_id = %command.task_id, status = %command.status))]
    pub async fn finish_task(&self, command: FinishTask) -> Result<FinishOutcome, DeciderError> {
        let Some(mut task) = self
            .store
            .find_task_in_status(command.task_id, TaskStatus::InProgress)
            .await
            .context(DeciderError::Store)?
        else {
            warn!("task is not in progress, ignoring finish");
            return Ok(FinishOutcome::NotInProgress);
        };

        let Some(mut workflow) = self
            .store
            .find_workflow(task.workflow_instance_id)
            .await
            .context(DeciderError::Store)?
        else {
            error!(workflow_id = %task.workflow_instance_id, "task belongs to unknown workflow");
            return Ok(FinishOutcome::UnknownWorkflow);
        };

        let now = Utc::now();
        task.finish(
            command.status,
            command.output_parameters,
            command.worker_name,
            now,
        );
        let mut decision = Decision::default();

        if !workflow.is_running() {
            info!(workflow_status = %workflow.status, "workflow not running, recording only");
            decision.changes.update_tasks.push(task);
            self.apply(decision).await?;
            return Ok(FinishOutcome::NotPropagated);
        }
        if command.status != TaskStatus::Completed {
            info!("task did not complete, no successors evaluated");
            decision.changes.update_tasks.push(task);
            self.apply(decision).await?;
            return Ok(FinishOutcome::Recorded);
        }

        let definition = self
            .store
            .find_definition(workflow.workflow_definition_id)
            .await
            .context(DeciderError::Store)?
            .filter(|d| d.task(task.task_definition_id).is_some());
        let Some(definition) = definition else {
            error!(
                task_definition_id = %task.task_definition_id,
                "task definition not found, recording only"
            );
            decision.changes.update_tasks.push(task);
            self.apply(decision).await?;
            return Ok(FinishOutcome::UnknownTaskDefinition);
        };

        for successor in definition.successors_of(task.task_definition_id) {
            match successor.task_type {
                TaskType::Switch | TaskType::Broadcast | TaskType::Wait => {
                    self.plan(
                        &mut decision,
                        &definition,
                        &workflow,
                        successor,
                        &task.output_parameters,
                        now,
                    )?;
                }
                TaskType::CaseWhen => match successor.predicate() {
                    Ok(predicate) if predicate.evaluate(&task.output_parameters) => {
                        self.plan(
                            &mut decision,
                            &definition,
                            &workflow,
                            successor,
                            &task.output_parameters,
                            now,
                        )?;
                    }
                    Ok(predicate) => {
                        debug!(
                            successor = %successor.name,
                            expression = predicate.source(),
                            "condition not met"
                        );
                    }
                    Err(report) => {
                        error!(successor = %successor.name, error = %report, "skipping successor");
                    }
                },
                TaskType::Join => {
                    self.plan_join(&mut decision, &definition, &workflow, &task, successor, now)
                        .await?;
                }
            }
        }

        if decision.changes.insert_tasks.is_empty() {
            let unfinished = self
                .store
                .count_unfinished_tasks(workflow.id, Some(task.id))
                .await
                .context(DeciderError::Store)?;
            if unfinished == 0 {
                info!("no tasks remain, completing workflow");
                workflow.complete(now);
                decision.changes.update_workflows.push(workflow);
                decision.report.workflow_completed = true;
            } else {
                debug!(unfinished, "branch ended, workflow still has work");
            }
        }

        decision.changes.update_tasks.push(task);
        let report = self.apply(decision).await?;
        Ok(FinishOutcome::Advanced(report))
    }

    async fn plan_join(
        &self,
        decision: &mut Decision,
        definition: &WorkflowDefinition,
        workflow: &WorkflowInstance,
        finished: &TaskInstance,
        join: &TaskDefinition,
        now: DateTime<Utc>,
    ) -> Result<(), DeciderError> {
        let existing = self
            .store
            .find_tasks_for_definitions(workflow.id, &[join.id], &TaskStatus::ALL)
            .await
            .context(DeciderError::Store)?;
        if !existing.is_empty() {
            debug!(join = %join.name, "join already dispatched");
            return Ok(());
        }

        let predecessors: Vec<TaskDefinitionId> = join.previous_task_ids.iter().copied().collect();
        let succeeded = self
            .store
            .find_tasks_for_definitions(workflow.id, &predecessors, &TaskStatus::SUCCESSFUL_TERMINAL)
            .await
            .context(DeciderError::Store)?;

        let mut outputs: BTreeMap<TaskDefinitionId, &Parameters> = succeeded
            .iter()
            .filter(|t| t.id != finished.id)
            .map(|t| (t.task_definition_id, &t.output_parameters))
            .collect();
        outputs.insert(finished.task_definition_id, &finished.output_parameters);

        if predecessors.iter().any(|p| !outputs.contains_key(p)) {
            info!(
                join = %join.name,
                satisfied = outputs.len(),
                required = predecessors.len(),
                "join waiting for predecessors"
            );
            return Ok(());
        }

        let mut merged = Parameters::new();
        for id in &predecessors {
            if let Some(output) = outputs.get(id) {
                merged.extend(output.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        self.plan(decision, definition, workflow, join, &merged, now)
    }

    /// Creates the task instance for `task` and, unless it waits, its
    /// dispatch event.
    fn plan(
        &self,
        decision: &mut Decision,
        definition: &WorkflowDefinition,
        workflow: &WorkflowInstance,
        task: &TaskDefinition,
        upstream: &Parameters,
        now: DateTime<Utc>,
    ) -> Result<(), DeciderError> {
        let inputs = resolve_inputs(task, upstream, &definition.input_template);
        let id: TaskInstanceId = self.ids.next().context(DeciderError::IdGeneration)?;

        if task.task_type == TaskType::Wait {
            let wait = i64::try_from(task.waiting_ms.unwrap_or_default()).unwrap_or(i64::MAX);
            let deadline = now.timestamp_millis().saturating_add(wait);
            debug!(task = %task.name, deadline, "parking wait task");
            decision
                .changes
                .insert_tasks
                .push(TaskInstance::parked(id, workflow, task, inputs, deadline, now));
            decision.report.parked.push(task.name.clone());
            return Ok(());
        }

        let instance = TaskInstance::in_progress(id, workflow, task, inputs, now);
        let message_id: MessageId = self.ids.next().context(DeciderError::IdGeneration)?;
        decision.outbound.push(Outbound {
            topic: task.sink.clone(),
            key: dispatch_key(&definition.name, &workflow.correlation_id),
            envelope: Envelope::new(
                message_id,
                Some(DISPATCH_TASK),
                WorkflowMessage::dispatch(workflow, task, &instance),
            ),
        });
        decision.changes.insert_tasks.push(instance);
        decision.report.dispatched.push(task.name.clone());
        Ok(())
    }

    async fn apply(&self, decision: Decision) -> Result<DecisionReport, DeciderError> {
        for outbound in &decision.outbound {
            publish_json(&self.bus, &outbound.topic, &outbound.key, &outbound.envelope)
                .await
                .context(DeciderError::Publish)?;
        }
        if !decision.changes.is_empty() {
            self.store
                .commit(decision.changes)
                .await
                .context(DeciderError::Store)?;
        }
        Ok(decision.report)
    }
}

/// Adds template defaults for keys the inputs do not already have.
fn fill_from_template(inputs: &mut Parameters, template: &Parameters) {
    for (key, value) in template {
        inputs.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

/// Projects upstream values and template defaults onto the task's required
/// inputs. Unresolved keys are left out.
fn resolve_inputs(task: &TaskDefinition, upstream: &Parameters, template: &Parameters) -> Parameters {
    let mut available = upstream.clone();
    fill_from_template(&mut available, template);

    let mut resolved = Parameters::new();
    let mut missing = Vec::new();
    for key in &task.required_input_parameters {
        match available.get(key) {
            Some(value) => {
                resolved.insert(key.clone(), value.clone());
            }
            None => missing.push(key.as_str()),
        }
    }
    if !missing.is_empty() {
        warn!(task = %task.name, ?missing, "dispatching with unresolved inputs");
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{DefinitionDraft, TaskDraft};
    use crate::memory::InMemoryWorkflowStore;
    use crate::status::WorkflowStatus;
    use serde_json::{Value, json};
    use switchyard_messaging::InMemoryBus;

    const SINK: &str = "workers";

    struct Harness {
        decider: Decider<InMemoryWorkflowStore, InMemoryBus>,
        store: InMemoryWorkflowStore,
        bus: InMemoryBus,
    }

    fn harness(draft: DefinitionDraft) -> Harness {
        let ids = Arc::new(IdGenerator::with_node_id(11).expect("node id"));
        let store = InMemoryWorkflowStore::new();
        store.insert_definition(draft.build(&ids, 1, Utc::now()).expect("valid definition"));
        let bus = InMemoryBus::new();
        Harness {
            decider: Decider::new(store.clone(), bus.clone(), ids),
            store,
            bus,
        }
    }

    fn params(value: Value) -> Parameters {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn start_command(inputs: Value) -> StartWorkflow {
        StartWorkflow {
            correlation_id: "order-1".into(),
            workflow_def_name: "order-flow".into(),
            input_parameters: params(inputs),
        }
    }

    fn finish_command(task: &TaskInstance, status: TaskStatus, outputs: Value) -> FinishTask {
        FinishTask {
            task_id: task.id,
            status,
            output_parameters: params(outputs),
            worker_name: Some("worker-1".into()),
        }
    }

    async fn start(h: &Harness, inputs: Value) -> WorkflowInstanceId {
        match h.decider.start_workflow(start_command(inputs)).await.expect("start") {
            StartOutcome::Started { workflow_id, .. } => workflow_id,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    fn only_task(h: &Harness, workflow: WorkflowInstanceId, name: &str) -> TaskInstance {
        let mut tasks = h.store.tasks_named(workflow, name);
        assert_eq!(tasks.len(), 1, "expected one instance of {name}");
        tasks.remove(0)
    }

    fn dispatched_names(h: &Harness) -> Vec<String> {
        h.bus
            .published_on(SINK)
            .iter()
            .map(|m| {
                let envelope: Envelope<WorkflowMessage> = m.decode().expect("envelope");
                envelope
                    .content
                    .and_then(|c| c.task_def_name)
                    .expect("task name")
            })
            .collect()
    }

    fn order_flow() -> DefinitionDraft {
        DefinitionDraft::new("order-flow", "ORDER_FLOW")
            .with_task(TaskDraft::new("A", SINK))
            .with_task(TaskDraft::new("C", SINK))
            .with_task(
                TaskDraft::new("B", SINK)
                    .with_type(TaskType::Join)
                    .after(&["A", "C"])
                    .with_inputs(&["fromA", "fromC"]),
            )
    }

    #[tokio::test]
    async fn order_flow_end_to_end() {
        let h = harness(order_flow());
        let workflow = start(&h, json!({})).await;

        let mut names = dispatched_names(&h);
        names.sort();
        assert_eq!(names, vec!["A", "C"]);

        let a = only_task(&h, workflow, "A");
        let c = only_task(&h, workflow, "C");

        let outcome = h
            .decider
            .finish_task(finish_command(&a, TaskStatus::Completed, json!({"fromA": 1})))
            .await
            .expect("finish A");
        assert_eq!(outcome, FinishOutcome::Advanced(DecisionReport::default()));
        assert!(h.store.tasks_named(workflow, "B").is_empty());

        h.decider
            .finish_task(finish_command(&c, TaskStatus::Completed, json!({"fromC": 2})))
            .await
            .expect("finish C");

        let b = only_task(&h, workflow, "B");
        assert_eq!(b.input_parameters, params(json!({"fromA": 1, "fromC": 2})));
        assert_eq!(dispatched_names(&h).iter().filter(|n| *n == "B").count(), 1);

        let dispatch = h.bus.published_on(SINK).pop().expect("dispatch of B");
        assert_eq!(dispatch.key, "order-flow:order-1");
        let envelope: Envelope<WorkflowMessage> = dispatch.decode().expect("envelope");
        assert_eq!(envelope.subject.as_deref(), Some(DISPATCH_TASK));
        let content = envelope.content.expect("content");
        assert_eq!(content.task_id, Some(b.id));
        assert_eq!(content.task_status, Some(TaskStatus::InProgress));
        assert_eq!(content.correlation_id.as_deref(), Some("order-1"));

        let outcome = h
            .decider
            .finish_task(finish_command(&b, TaskStatus::Completed, json!({})))
            .await
            .expect("finish B");
        let FinishOutcome::Advanced(report) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert!(report.workflow_completed);
        assert_eq!(
            h.store.workflow(workflow).expect("workflow").status,
            WorkflowStatus::Completed
        );
    }

    #[tokio::test]
    async fn join_never_fires_with_a_failed_predecessor() {
        let h = harness(order_flow());
        let workflow = start(&h, json!({})).await;
        let a = only_task(&h, workflow, "A");
        let c = only_task(&h, workflow, "C");

        h.decider
            .finish_task(finish_command(&a, TaskStatus::Failed, json!({})))
            .await
            .expect("fail A");
        h.decider
            .finish_task(finish_command(&c, TaskStatus::Completed, json!({})))
            .await
            .expect("finish C");

        assert!(h.store.tasks_named(workflow, "B").is_empty());
    }

    #[tokio::test]
    async fn join_accepts_predecessor_completed_with_errors() {
        let h = harness(order_flow());
        let workflow = start(&h, json!({})).await;
        let a = only_task(&h, workflow, "A");
        let c = only_task(&h, workflow, "C");

        let outcome = h
            .decider
            .finish_task(finish_command(
                &c,
                TaskStatus::CompletedWithErrors,
                json!({"fromC": 2}),
            ))
            .await
            .expect("finish C");
        assert_eq!(outcome, FinishOutcome::Recorded);
        assert!(h.store.tasks_named(workflow, "B").is_empty());

        h.decider
            .finish_task(finish_command(&a, TaskStatus::Completed, json!({"fromA": 1})))
            .await
            .expect("finish A");

        let b = only_task(&h, workflow, "B");
        assert_eq!(b.input_parameters, params(json!({"fromA": 1, "fromC": 2})));
        assert_eq!(dispatched_names(&h).iter().filter(|n| *n == "B").count(), 1);
    }

    #[tokio::test]
    async fn finishing_twice_is_a_no_op() {
        let h = harness(order_flow());
        let workflow = start(&h, json!({})).await;
        let a = only_task(&h, workflow, "A");
        let command = finish_command(&a, TaskStatus::Completed, json!({"fromA": 1}));

        h.decider.finish_task(command.clone()).await.expect("first");
        let tasks = h.store.tasks();
        let workflows = h.store.workflows();
        let published = h.bus.published().len();

        let outcome = h.decider.finish_task(command).await.expect("second");
        assert_eq!(outcome, FinishOutcome::NotInProgress);
        assert_eq!(h.store.tasks(), tasks);
        assert_eq!(h.store.workflows(), workflows);
        assert_eq!(h.bus.published().len(), published);
    }

    fn gated() -> DefinitionDraft {
        DefinitionDraft::new("order-flow", "ORDER_FLOW")
            .with_task(TaskDraft::new("price", SINK))
            .with_task(
                TaskDraft::new("review", SINK)
                    .with_type(TaskType::CaseWhen)
                    .with_expression("output.amount > 100")
                    .after(&["price"])
                    .with_inputs(&["amount"]),
            )
    }

    #[tokio::test]
    async fn case_when_dispatches_when_predicate_holds() {
        let h = harness(gated());
        let workflow = start(&h, json!({})).await;
        let price = only_task(&h, workflow, "price");

        h.decider
            .finish_task(finish_command(&price, TaskStatus::Completed, json!({"amount": 150})))
            .await
            .expect("finish");

        let review = only_task(&h, workflow, "review");
        assert_eq!(review.input_parameters["amount"], 150);
    }

    #[tokio::test]
    async fn case_when_skips_and_completes_when_predicate_fails() {
        let h = harness(gated());
        let workflow = start(&h, json!({})).await;
        let price = only_task(&h, workflow, "price");

        let outcome = h
            .decider
            .finish_task(finish_command(&price, TaskStatus::Completed, json!({"amount": 50})))
            .await
            .expect("finish");

        assert!(h.store.tasks_named(workflow, "review").is_empty());
        let FinishOutcome::Advanced(report) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert!(report.workflow_completed);
    }

    #[tokio::test]
    async fn definition_without_roots_completes_on_start() {
        let h = harness(DefinitionDraft::new("order-flow", "ORDER_FLOW"));
        let outcome = h
            .decider
            .start_workflow(start_command(json!({})))
            .await
            .expect("start");

        let StartOutcome::Started {
            workflow_id,
            report,
        } = outcome
        else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert!(report.workflow_completed);
        assert_eq!(
            h.store.workflow(workflow_id).expect("workflow").status,
            WorkflowStatus::Completed
        );
        assert!(h.store.tasks().is_empty());
        assert!(h.bus.published().is_empty());
    }

    #[tokio::test]
    async fn unknown_definition_is_dropped() {
        let h = harness(order_flow());
        let outcome = h
            .decider
            .start_workflow(StartWorkflow {
                workflow_def_name: "missing".into(),
                ..start_command(json!({}))
            })
            .await
            .expect("start");
        assert_eq!(outcome, StartOutcome::UnknownDefinition);
        assert!(h.store.workflows().is_empty());
    }

    #[tokio::test]
    async fn wait_task_is_parked_not_published() {
        let h = harness(
            DefinitionDraft::new("order-flow", "ORDER_FLOW")
                .with_task(TaskDraft::new("A", SINK))
                .with_task(
                    TaskDraft::new("cool-off", "workflow-event")
                        .with_type(TaskType::Wait)
                        .with_wait(5_000)
                        .after(&["A"])
                        .with_inputs(&["orderId"]),
                ),
        );
        let workflow = start(&h, json!({})).await;
        let a = only_task(&h, workflow, "A");
        let published = h.bus.published().len();

        let before = Utc::now().timestamp_millis();
        h.decider
            .finish_task(finish_command(&a, TaskStatus::Completed, json!({"orderId": "o-9"})))
            .await
            .expect("finish");
        let after = Utc::now().timestamp_millis();

        let parked = only_task(&h, workflow, "cool-off");
        assert_eq!(parked.status, TaskStatus::InProgress);
        let deadline = parked.waiting.expect("deadline");
        assert!(deadline >= before + 5_000 && deadline <= after + 5_000);
        assert_eq!(parked.input_parameters["orderId"], "o-9");
        assert_eq!(h.bus.published().len(), published);
        assert!(h.store.workflow(workflow).expect("workflow").is_running());
    }

    #[tokio::test]
    async fn template_fills_only_missing_inputs() {
        let h = harness(
            DefinitionDraft::new("order-flow", "ORDER_FLOW")
                .with_template(params(json!({"currency": "NZD", "amount": 0})))
                .with_task(TaskDraft::new("A", SINK).with_inputs(&["currency", "amount", "note"])),
        );
        let workflow = start(&h, json!({"amount": 75})).await;

        let a = only_task(&h, workflow, "A");
        assert_eq!(a.input_parameters, params(json!({"currency": "NZD", "amount": 75})));
    }

    #[tokio::test]
    async fn failed_status_is_recorded_without_successors() {
        let h = harness(gated());
        let workflow = start(&h, json!({})).await;
        let price = only_task(&h, workflow, "price");

        let outcome = h
            .decider
            .finish_task(finish_command(&price, TaskStatus::TimedOut, json!({"amount": 500})))
            .await
            .expect("finish");
        assert_eq!(outcome, FinishOutcome::Recorded);
        assert_eq!(
            h.store.task(price.id).expect("task").status,
            TaskStatus::TimedOut
        );
        assert!(h.store.tasks_named(workflow, "review").is_empty());
        assert!(h.store.workflow(workflow).expect("workflow").is_running());
    }

    #[tokio::test]
    async fn task_of_stopped_workflow_is_not_propagated() {
        let h = harness(gated());
        let workflow_id = start(&h, json!({})).await;
        let price = only_task(&h, workflow_id, "price");

        let mut workflow = h.store.workflow(workflow_id).expect("workflow");
        workflow.status = WorkflowStatus::Paused;
        h.store
            .commit(Changeset {
                update_workflows: vec![workflow],
                ..Changeset::default()
            })
            .await
            .expect("pause");

        let outcome = h
            .decider
            .finish_task(finish_command(&price, TaskStatus::Completed, json!({"amount": 500})))
            .await
            .expect("finish");
        assert_eq!(outcome, FinishOutcome::NotPropagated);
        assert_eq!(h.store.task(price.id).expect("task").status, TaskStatus::Completed);
        assert!(h.store.tasks_named(workflow_id, "review").is_empty());
    }

    #[tokio::test]
    async fn store_failure_is_retryable_and_leaves_task_in_progress() {
        let h = harness(gated());
        let workflow = start(&h, json!({})).await;
        let price = only_task(&h, workflow, "price");

        h.store.fail_next_commits(1);
        let err = h
            .decider
            .finish_task(finish_command(&price, TaskStatus::Completed, json!({"amount": 500})))
            .await
            .expect_err("commit fails");
        assert!(err.current_context().is_retryable());
        assert_eq!(h.store.task(price.id).expect("task").status, TaskStatus::InProgress);
        assert!(h.store.tasks_named(workflow, "review").is_empty());

        h.decider
            .finish_task(finish_command(&price, TaskStatus::Completed, json!({"amount": 500})))
            .await
            .expect("retry succeeds");
        assert_eq!(only_task(&h, workflow, "review").status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn dispatch_from_a_failed_commit_is_ignored_when_finished() {
        let h = harness(gated());
        let workflow = start(&h, json!({})).await;
        let price = only_task(&h, workflow, "price");
        let before = h.bus.published_on(SINK).len();

        h.store.fail_next_commits(1);
        h.decider
            .finish_task(finish_command(&price, TaskStatus::Completed, json!({"amount": 500})))
            .await
            .expect_err("commit fails");

        let published = h.bus.published_on(SINK);
        assert_eq!(published.len(), before + 1);
        let envelope: Envelope<WorkflowMessage> =
            published.last().expect("dispatch").decode().expect("envelope");
        let orphan = envelope
            .content
            .and_then(|c| c.task_id)
            .expect("dispatched task id");
        assert!(h.store.task(orphan).is_none());

        let tasks = h.store.tasks();
        let workflows = h.store.workflows();
        let outcome = h
            .decider
            .finish_task(FinishTask {
                task_id: orphan,
                status: TaskStatus::Completed,
                output_parameters: Parameters::new(),
                worker_name: Some("worker-1".into()),
            })
            .await
            .expect("finish orphan");
        assert_eq!(outcome, FinishOutcome::NotInProgress);
        assert_eq!(h.store.tasks(), tasks);
        assert_eq!(h.store.workflows(), workflows);
        assert_eq!(h.bus.published_on(SINK).len(), before + 1);
    }

    #[tokio::test]
    async fn publish_failure_writes_nothing() {
        let h = harness(gated());
        h.bus.fail_next(1);
        let err = h
            .decider
            .start_workflow(start_command(json!({})))
            .await
            .expect_err("publish fails");
        assert_eq!(err.current_context(), &DeciderError::Publish);
        assert!(h.store.workflows().is_empty());
        assert!(h.store.tasks().is_empty());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_successor() {
        let h = harness(
            DefinitionDraft::new("order-flow", "ORDER_FLOW")
                .with_task(TaskDraft::new("A", SINK))
                .with_task(TaskDraft::new("X", SINK).with_type(TaskType::Broadcast).after(&["A"]))
                .with_task(TaskDraft::new("Y", SINK).with_type(TaskType::Broadcast).after(&["A"])),
        );
        let workflow = start(&h, json!({})).await;
        let a = only_task(&h, workflow, "A");

        let outcome = h
            .decider
            .finish_task(finish_command(&a, TaskStatus::Completed, json!({})))
            .await
            .expect("finish");
        let FinishOutcome::Advanced(report) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(report.dispatched, vec!["X", "Y"]);
        assert!(!report.workflow_completed);
    }
}
