//! Bridges the workflow event topic to the [`Decider`].

use crate::decider::Decider;
use crate::error::{DeciderError, MessageError};
use crate::message::{FINISH_TASK, FinishTask, START_WORKFLOW, StartWorkflow, WorkflowMessage};
use crate::store::WorkflowStore;
use async_trait::async_trait;
use rootcause::Report;
use std::sync::Arc;
use switchyard_core::Result;
use switchyard_messaging::{DeliveryContext, Envelope, HandlerError, MessageBus, MessageHandler};
use tracing::debug;

/// Routes `START_WORKFLOW` and `FINISH_TASK` envelopes to the decider.
pub struct WorkflowEventHandler<S, B> {
    decider: Arc<Decider<S, B>>,
}

impl<S, B> WorkflowEventHandler<S, B> {
    pub fn new(decider: Arc<Decider<S, B>>) -> Self {
        Self { decider }
    }
}

impl<S, B> Clone for WorkflowEventHandler<S, B> {
    fn clone(&self) -> Self {
        Self {
            decider: Arc::clone(&self.decider),
        }
    }
}

#[async_trait]
impl<S, B> MessageHandler<WorkflowMessage> for WorkflowEventHandler<S, B>
where
    S: WorkflowStore,
    B: MessageBus,
{
    async fn handle(
        &self,
        context: &DeliveryContext,
        envelope: &Envelope<WorkflowMessage>,
    ) -> Result<(), HandlerError> {
        let Some(message) = envelope.content() else {
            return Err(HandlerError::unrecoverable("message has no content").into());
        };

        match envelope.subject.as_deref() {
            Some(START_WORKFLOW) => {
                let command = StartWorkflow::try_from(message).map_err(rejected)?;
                let outcome = self
                    .decider
                    .start_workflow(command)
                    .await
                    .map_err(classify)?;
                debug!(topic = %context.topic, ?outcome, "start handled");
                Ok(())
            }
            Some(FINISH_TASK) => {
                let command = FinishTask::try_from(message).map_err(rejected)?;
                let outcome = self.decider.finish_task(command).await.map_err(classify)?;
                debug!(topic = %context.topic, ?outcome, "finish handled");
                Ok(())
            }
            other => Err(rejected(MessageError::UnsupportedSubject {
                subject: other.map(str::to_string),
            })),
        }
    }
}

fn rejected(error: MessageError) -> Report<HandlerError> {
    HandlerError::unrecoverable(error.to_string()).into()
}

fn classify(report: Report<DeciderError>) -> Report<HandlerError> {
    let reason = report.to_string();
    if report.current_context().is_retryable() {
        HandlerError::transient(reason).into()
    } else {
        HandlerError::unrecoverable(reason).into()
    }
}
