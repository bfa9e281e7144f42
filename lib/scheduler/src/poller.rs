//! Fixed-delay sweep over parked WAIT tasks.

use crate::error::PollerError;
use chrono::Utc;
use rootcause::prelude::ResultExt;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{IdGenerator, MessageId, Result, TaskInstanceId};
use switchyard_messaging::{Envelope, MessageBus, publish_json};
use switchyard_workflow::{
    FINISH_TASK, StoreError, TaskInstance, TaskStatus, WorkflowMessage, WorkflowStore,
    dispatch_key,
};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Default delay between sweeps.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of tasks read per page.
pub const DEFAULT_PAGE_SIZE: usize = 1_000;

/// Poller settings.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Delay between the end of one sweep and the start of the next.
    pub interval: Duration,
    pub page_size: usize,
    /// Reported as the worker of released tasks.
    pub worker_name: String,
}

impl PollerConfig {
    #[must_use]
    pub fn new(worker_name: impl Into<String>) -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            page_size: DEFAULT_PAGE_SIZE,
            worker_name: worker_name.into(),
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Tasks whose ready event was published.
    pub published: usize,
    /// Tasks left alone because their definition or workflow is gone, or
    /// because they changed after the page was read.
    pub skipped: usize,
}

/// Releases parked WAIT tasks once their deadline passes.
pub struct WaitTaskPoller<S, B> {
    store: S,
    bus: B,
    ids: Arc<IdGenerator>,
    config: PollerConfig,
}

impl<S, B> WaitTaskPoller<S, B>
where
    S: WorkflowStore,
    B: MessageBus,
{
    pub fn new(store: S, bus: B, ids: Arc<IdGenerator>, config: PollerConfig) -> Self {
        Self {
            store,
            bus,
            ids,
            config,
        }
    }

    /// Sweeps until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.config.interval, "wait-task poller started");
        loop {
            match self.sweep(Utc::now().timestamp_millis()).await {
                Ok(report) if report.published + report.skipped > 0 => {
                    info!(published = report.published, skipped = report.skipped, "sweep finished");
                }
                Ok(_) => debug!("no wait tasks due"),
                Err(report) => error!(error = %report, "sweep failed"),
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("wait-task poller shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Releases every task whose deadline is before `now_ms`, oldest id first.
    ///
    /// # Errors
    ///
    /// Stops at the first store or bus failure. Tasks released before the
    /// failure stay released.
    #[instrument(skip(self))]
    pub async fn sweep(&self, now_ms: i64) -> Result<SweepReport, PollerError> {
        let mut report = SweepReport::default();
        let mut after: Option<TaskInstanceId> = None;

        loop {
            let page = self
                .store
                .find_due_waiting_tasks(now_ms, after, self.config.page_size)
                .await
                .context(PollerError::Store)?;

            for task in &page {
                if self.release(task).await? {
                    report.published += 1;
                } else {
                    report.skipped += 1;
                }
            }

            if page.len() < self.config.page_size {
                break;
            }
            after = page.last().map(|task| task.id);
        }

        Ok(report)
    }

    async fn release(&self, task: &TaskInstance) -> Result<bool, PollerError> {
        let Some(definition) = self
            .store
            .find_task_definition(task.task_definition_id)
            .await
            .context(PollerError::Store)?
        else {
            warn!(
                task_id = %task.id,
                task_definition_id = %task.task_definition_id,
                "parked task has no definition, skipping"
            );
            return Ok(false);
        };
        let Some(workflow) = self
            .store
            .find_workflow(task.workflow_instance_id)
            .await
            .context(PollerError::Store)?
        else {
            warn!(task_id = %task.id, "parked task has no workflow, skipping");
            return Ok(false);
        };

        let message = WorkflowMessage {
            input_parameters: Some(task.input_parameters.clone()),
            ..WorkflowMessage::finish(
                task.id,
                TaskStatus::Completed,
                task.input_parameters.clone(),
                &self.config.worker_name,
            )
            .for_task(&definition.name, &workflow.correlation_id)
        };
        let message_id: MessageId = self.ids.next().context(PollerError::IdGeneration)?;
        let envelope = Envelope::new(message_id, Some(FINISH_TASK), message);

        // The deadline is cleared before the ready event exists, so the
        // decider always reads the released version of the task.
        let released = match self.store.set_waiting(task, None).await {
            Ok(released) => released,
            Err(report) if matches!(report.current_context(), StoreError::VersionConflict { .. }) => {
                warn!(task_id = %task.id, "task changed while releasing it, skipping");
                return Ok(false);
            }
            Err(report) => return Err(report).context(PollerError::Store),
        };

        let published = publish_json(
            &self.bus,
            &definition.sink,
            &dispatch_key(&definition.workflow_definition_name, &workflow.correlation_id),
            &envelope,
        )
        .await;
        if let Err(report) = published {
            if let Err(restore) = self.store.set_waiting(&released, task.waiting).await {
                error!(task_id = %task.id, error = %restore, "failed to restore wait deadline");
            }
            return Err(report).context(PollerError::Publish);
        }

        debug!(task_id = %task.id, sink = %definition.sink, "wait task released");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use switchyard_messaging::{BusError, InMemoryBus};
    use switchyard_workflow::{
        Decider, DefinitionDraft, FinishOutcome, FinishTask, InMemoryWorkflowStore, StartOutcome,
        StartWorkflow, TaskDraft, TaskType,
    };

    const EVENTS: &str = "workflow-event";

    struct Harness {
        decider: Decider<InMemoryWorkflowStore, InMemoryBus>,
        poller: WaitTaskPoller<InMemoryWorkflowStore, InMemoryBus>,
        store: InMemoryWorkflowStore,
        bus: InMemoryBus,
    }

    fn harness(page_size: usize) -> Harness {
        let ids = Arc::new(IdGenerator::with_node_id(21).expect("node id"));
        let store = InMemoryWorkflowStore::new();
        store.insert_definition(
            DefinitionDraft::new("order-flow", "ORDER_FLOW")
                .with_task(TaskDraft::new("A", "workers"))
                .with_task(
                    TaskDraft::new("cool-off", EVENTS)
                        .with_type(TaskType::Wait)
                        .with_wait(5_000)
                        .after(&["A"])
                        .with_inputs(&["orderId"]),
                )
                .with_task(TaskDraft::new("ship", "workers").after(&["cool-off"]).with_inputs(&["orderId"]))
                .build(&ids, 1, Utc::now())
                .expect("valid"),
        );
        let bus = InMemoryBus::new();
        Harness {
            decider: Decider::new(store.clone(), bus.clone(), Arc::clone(&ids)),
            poller: WaitTaskPoller::new(
                store.clone(),
                bus.clone(),
                ids,
                PollerConfig::new("switchyard").with_page_size(page_size),
            ),
            store,
            bus,
        }
    }

    async fn park(h: &Harness, correlation_id: &str) -> TaskInstance {
        let StartOutcome::Started { workflow_id, .. } = h
            .decider
            .start_workflow(StartWorkflow {
                correlation_id: correlation_id.into(),
                workflow_def_name: "order-flow".into(),
                input_parameters: Default::default(),
            })
            .await
            .expect("start")
        else {
            panic!("definition missing");
        };
        let a = h.store.tasks_named(workflow_id, "A").pop().expect("A");
        let outputs = json!({"orderId": correlation_id});
        h.decider
            .finish_task(FinishTask {
                task_id: a.id,
                status: TaskStatus::Completed,
                output_parameters: outputs.as_object().cloned().expect("object"),
                worker_name: None,
            })
            .await
            .expect("finish A");
        h.store.tasks_named(workflow_id, "cool-off").pop().expect("parked")
    }

    #[tokio::test]
    async fn releases_exactly_once_after_deadline() {
        let h = harness(DEFAULT_PAGE_SIZE);
        let parked = park(&h, "order-1").await;
        let deadline = parked.waiting.expect("deadline");

        let early = h.poller.sweep(deadline - 1).await.expect("sweep");
        assert_eq!(early, SweepReport::default());
        assert!(h.bus.published_on(EVENTS).is_empty());

        let due = h.poller.sweep(deadline + 1).await.expect("sweep");
        assert_eq!(due.published, 1);
        let again = h.poller.sweep(deadline + 2).await.expect("sweep");
        assert_eq!(again, SweepReport::default());

        let events = h.bus.published_on(EVENTS);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, "order-flow:order-1");
        let envelope: Envelope<WorkflowMessage> = events[0].decode().expect("envelope");
        assert_eq!(envelope.subject.as_deref(), Some(FINISH_TASK));
        let message = envelope.content.expect("content");
        assert_eq!(message.task_id, Some(parked.id));
        assert_eq!(message.task_status, Some(TaskStatus::Completed));
        assert_eq!(message.worker_name.as_deref(), Some("switchyard"));
        assert_eq!(
            message.output_parameters.as_ref().and_then(|o| o.get("orderId")),
            Some(&json!("order-1"))
        );
        assert_eq!(h.store.task(parked.id).expect("task").waiting, None);
    }

    #[tokio::test]
    async fn released_task_advances_the_workflow() {
        let h = harness(DEFAULT_PAGE_SIZE);
        let parked = park(&h, "order-2").await;
        h.poller
            .sweep(parked.waiting.expect("deadline") + 1)
            .await
            .expect("sweep");

        let envelope: Envelope<WorkflowMessage> = h.bus.published_on(EVENTS)[0]
            .decode()
            .expect("envelope");
        let finish = FinishTask::try_from(envelope.content().expect("content")).expect("finish");
        h.decider.finish_task(finish).await.expect("finish wait task");

        let ship = h
            .store
            .tasks_named(parked.workflow_instance_id, "ship")
            .pop()
            .expect("ship dispatched");
        assert_eq!(ship.input_parameters["orderId"], "order-2");
    }

    #[tokio::test]
    async fn pages_through_every_due_task() {
        let h = harness(2);
        let mut latest = 0;
        for i in 0..5 {
            let parked = park(&h, &format!("order-{i}")).await;
            latest = latest.max(parked.waiting.expect("deadline"));
        }

        let report = h.poller.sweep(latest + 1).await.expect("sweep");
        assert_eq!(report.published, 5);
        assert_eq!(h.bus.published_on(EVENTS).len(), 5);
    }

    #[tokio::test]
    async fn publish_failure_keeps_task_parked() {
        let h = harness(DEFAULT_PAGE_SIZE);
        let parked = park(&h, "order-3").await;
        let deadline = parked.waiting.expect("deadline");

        h.bus.fail_next(1);
        let err = h.poller.sweep(deadline + 1).await.expect_err("publish fails");
        assert_eq!(err.current_context(), &PollerError::Publish);
        assert_eq!(h.store.task(parked.id).expect("task").waiting, Some(deadline));

        let report = h.poller.sweep(deadline + 1).await.expect("sweep");
        assert_eq!(report.published, 1);
    }

    /// Captures the stored task at the moment its ready event is published.
    struct ObservingBus {
        store: InMemoryWorkflowStore,
        task: TaskInstanceId,
        seen: Arc<Mutex<Vec<TaskInstance>>>,
    }

    #[async_trait]
    impl MessageBus for ObservingBus {
        async fn publish(&self, _topic: &str, _key: &str, _payload: Vec<u8>) -> Result<(), BusError> {
            if let Some(task) = self.store.task(self.task) {
                self.seen.lock().expect("lock").push(task);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn deadline_is_cleared_before_the_ready_event() {
        let h = harness(DEFAULT_PAGE_SIZE);
        let parked = park(&h, "order-4").await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let poller = WaitTaskPoller::new(
            h.store.clone(),
            ObservingBus {
                store: h.store.clone(),
                task: parked.id,
                seen: Arc::clone(&seen),
            },
            Arc::new(IdGenerator::with_node_id(22).expect("node id")),
            PollerConfig::new("switchyard"),
        );

        let report = poller
            .sweep(parked.waiting.expect("deadline") + 1)
            .await
            .expect("sweep");
        assert_eq!(report.published, 1);

        let seen = seen.lock().expect("lock").clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].waiting, None);
        assert_eq!(seen[0].audit.version, parked.audit.version + 1);

        // A consumer reading the task after the event commits without conflict.
        let outcome = h
            .decider
            .finish_task(FinishTask {
                task_id: parked.id,
                status: TaskStatus::Completed,
                output_parameters: parked.input_parameters.clone(),
                worker_name: Some("switchyard".into()),
            })
            .await
            .expect("finish wait task");
        assert!(matches!(outcome, FinishOutcome::Advanced(_)));
        assert_eq!(
            h.store.task(parked.id).expect("task").status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn task_changed_since_read_is_skipped() {
        let h = harness(DEFAULT_PAGE_SIZE);
        let parked = park(&h, "order-5").await;
        h.store
            .set_waiting(&parked, parked.waiting)
            .await
            .expect("touch task");

        let released = h.poller.release(&parked).await.expect("release");
        assert!(!released);
        assert!(h.bus.published_on(EVENTS).is_empty());
        assert_eq!(h.store.task(parked.id).expect("task").waiting, parked.waiting);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let h = harness(DEFAULT_PAGE_SIZE);
        let (tx, rx) = watch::channel(false);
        let stop = async {
            tx.send(true).expect("receiver alive");
        };
        tokio::join!(h.poller.run(rx), stop);
    }
}
