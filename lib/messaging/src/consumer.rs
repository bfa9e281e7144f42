//! Generic at-least-once consumer.
//!
//! A [`Consumer`] owns the delivery policy and a [`MessageHandler`] owns the
//! business logic. For every delivery on the primary feed:
//!
//! 1. decode; undecodable or content-less messages are dropped
//! 2. give a blank message id the `{topic}_{partition}_{offset}` fallback
//! 3. claim the id in the dedup store; duplicates stop here
//! 4. handle; transient failures become a retry `INSERT` intent
//! 5. acknowledge, whatever happened
//!
//! The retry feed follows the same steps with the retry record's own id and
//! answers with `DELETE` (done or abandoned) or `UPDATE` (try again).

use crate::bus::{Acknowledge, Delivery, DeliveryContext, MessageBus, Subscription, publish_json};
use crate::dedup::{Claim, DEFAULT_DEDUP_TTL, DedupKey, DedupStore};
use crate::envelope::Envelope;
use crate::error::{BusError, DedupError, HandlerError};
use crate::retry::{RetryPolicy, RetryRecord};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{IdGenerator, MessageId, Result};
use tokio::sync::watch;
use tracing::{Span, debug, error, info, instrument, warn};

/// Business logic for one message type.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    /// Decodes a payload into an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a valid envelope.
    fn decode(&self, bytes: &[u8]) -> std::result::Result<Envelope<T>, serde_json::Error> {
        Envelope::from_json_bytes(bytes)
    }

    /// Processes a decoded, first-seen message.
    ///
    /// # Errors
    ///
    /// A [`HandlerError::Transient`] report schedules a retry; an
    /// [`HandlerError::Unrecoverable`] report drops the message.
    async fn handle(&self, context: &DeliveryContext, envelope: &Envelope<T>) -> Result<(), HandlerError>;
}

/// Which feed a consumption loop reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    /// Envelopes published by producers.
    Primary,
    /// Retry records re-fed by the retry store.
    Retries,
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handled successfully.
    Processed,
    /// Already claimed by an earlier delivery.
    Duplicate,
    /// Poison message, dropped without handling.
    Dropped,
    /// Handler reported an unrecoverable failure.
    Rejected,
    /// A retry intent was published.
    RetryScheduled,
    /// A retry attempt succeeded and the retry row was closed.
    RetryCompleted,
    /// No attempts left, or retries disabled.
    Abandoned,
    /// The retry intent itself could not be published.
    RetryLost,
}

/// Delivery policy for a [`Consumer`].
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Application name, used as the retry `source`.
    pub application: String,
    /// Broker family recorded in dedup keys.
    pub broker_type: String,
    /// Topic retry intents are published to.
    pub retries_topic: String,
    /// Retry attempts and backoff.
    pub retry: RetryPolicy,
    /// How long dedup claims are kept.
    pub dedup_ttl: Duration,
}

impl ConsumerOptions {
    /// Creates options with default retry policy and dedup TTL.
    #[must_use]
    pub fn new(
        application: impl Into<String>,
        broker_type: impl Into<String>,
        retries_topic: impl Into<String>,
    ) -> Self {
        Self {
            application: application.into(),
            broker_type: broker_type.into(),
            retries_topic: retries_topic.into(),
            retry: RetryPolicy::default(),
            dedup_ttl: DEFAULT_DEDUP_TTL,
        }
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replaces the dedup TTL.
    #[must_use]
    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = ttl;
        self
    }
}

/// Consumption loop for messages of type `T`.
pub struct Consumer<T, H, B, D> {
    handler: H,
    bus: B,
    dedup: D,
    ids: Arc<IdGenerator>,
    options: ConsumerOptions,
    _payload: PhantomData<fn() -> T>,
}

impl<T, H, B, D> Consumer<T, H, B, D>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    H: MessageHandler<T>,
    B: MessageBus,
    D: DedupStore,
{
    /// Creates a consumer.
    pub fn new(handler: H, bus: B, dedup: D, ids: Arc<IdGenerator>, options: ConsumerOptions) -> Self {
        Self {
            handler,
            bus,
            dedup,
            ids,
            options,
            _payload: PhantomData,
        }
    }

    /// Returns the delivery policy.
    #[must_use]
    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    /// Reads `subscription` until it closes or `shutdown` flips to true.
    ///
    /// A delivery already being processed is finished before returning.
    pub async fn run<S: Subscription>(
        &self,
        mut subscription: S,
        feed: Feed,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(?feed, "consumer started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(?feed, "consumer shutting down");
                        break;
                    }
                }
                next = subscription.next_delivery() => match next {
                    Some(Ok(delivery)) => {
                        let outcome = match feed {
                            Feed::Primary => self.process(delivery).await,
                            Feed::Retries => self.process_retry(delivery).await,
                        };
                        debug!(?outcome, "delivery finished");
                    }
                    Some(Err(report)) => {
                        warn!(error = %report, "failed to receive message");
                    }
                    None => {
                        info!(?feed, "subscription closed");
                        break;
                    }
                },
            }
        }
    }

    /// Processes one delivery from the primary feed and acknowledges it.
    #[instrument(
        skip_all,
        fields(
            topic = %delivery.context().topic,
            partition = delivery.context().partition,
            offset = delivery.context().offset,
            message_id
        )
    )]
    pub async fn process(&self, delivery: Delivery) -> Outcome {
        let (context, payload, acker) = delivery.into_parts();

        let outcome = match self.handler.decode(&payload) {
            Err(e) => {
                error!(error = %e, "dropping undecodable message");
                Outcome::Dropped
            }
            Ok(envelope) if envelope.content.is_none() => {
                error!("dropping message without content");
                Outcome::Dropped
            }
            Ok(mut envelope) => {
                envelope.ensure_message_id(&context);
                Span::current().record("message_id", envelope.message_id.as_str());
                self.consume(&context, envelope).await
            }
        };

        acknowledge(acker).await;
        outcome
    }

    async fn consume(&self, context: &DeliveryContext, envelope: Envelope<T>) -> Outcome {
        match self.claim(&envelope.message_id, &context.topic).await {
            Ok(Claim::Duplicate) => {
                debug!("duplicate message, skipping");
                return Outcome::Duplicate;
            }
            Ok(Claim::First) => {}
            Err(report) => {
                warn!(error = %report, "dedup claim failed");
                return self.schedule_retry(context, envelope).await;
            }
        }

        match self.handler.handle(context, &envelope).await {
            Ok(()) => Outcome::Processed,
            Err(report) if !report.current_context().is_retryable() => {
                error!(error = %report, "message rejected");
                Outcome::Rejected
            }
            Err(report) => {
                warn!(error = %report, "handler failed");
                self.schedule_retry(context, envelope).await
            }
        }
    }

    async fn schedule_retry(&self, context: &DeliveryContext, envelope: Envelope<T>) -> Outcome {
        if self.options.retry.repeat_count == 0 {
            error!("retries disabled, abandoning message");
            return Outcome::Abandoned;
        }

        let id = match self.ids.next::<MessageId>() {
            Ok(id) => id,
            Err(report) => {
                error!(error = %report, "cannot mint retry id");
                return Outcome::RetryLost;
            }
        };
        let record = RetryRecord::insert(
            id,
            envelope,
            &context.topic,
            &self.options.application,
            &self.options.retry,
            Utc::now(),
        );

        match self.publish_intent(&record).await {
            Ok(()) => {
                info!(retry_id = %record.message_id, "retry scheduled");
                Outcome::RetryScheduled
            }
            Err(report) => {
                error!(error = %report, "failed to publish retry intent");
                Outcome::RetryLost
            }
        }
    }

    /// Processes one re-fed retry record and acknowledges it.
    #[instrument(
        skip_all,
        fields(
            topic = %delivery.context().topic,
            partition = delivery.context().partition,
            offset = delivery.context().offset,
            message_id,
            origin_message_id,
            attempt
        )
    )]
    pub async fn process_retry(&self, delivery: Delivery) -> Outcome {
        let (context, payload, acker) = delivery.into_parts();

        let outcome = match serde_json::from_slice::<RetryRecord<T>>(&payload) {
            Err(e) => {
                error!(error = %e, "dropping undecodable retry record");
                Outcome::Dropped
            }
            Ok(record) if record.data.as_ref().and_then(Envelope::content).is_none() => {
                error!(origin = %record.origin_message_id, "dropping retry record without payload");
                Outcome::Dropped
            }
            Ok(mut record) => {
                if record.message_id.trim().is_empty() {
                    record.message_id = context.fallback_message_id();
                }
                let span = Span::current();
                span.record("message_id", record.message_id.as_str());
                span.record("origin_message_id", record.origin_message_id.as_str());
                span.record("attempt", record.attempt());
                self.consume_retry(&context, record).await
            }
        };

        acknowledge(acker).await;
        outcome
    }

    async fn consume_retry(&self, context: &DeliveryContext, record: RetryRecord<T>) -> Outcome {
        let result = match self.claim(&record.message_id, &context.topic).await {
            Ok(Claim::Duplicate) => {
                debug!("duplicate retry record, skipping");
                return Outcome::Duplicate;
            }
            Ok(Claim::First) => match &record.data {
                Some(envelope) => self.handler.handle(context, envelope).await,
                None => return Outcome::Dropped,
            },
            Err(report) => {
                warn!(error = %report, "dedup claim failed");
                Err(HandlerError::transient(report.to_string()).into())
            }
        };

        match result {
            Ok(()) => self.close_retry(&record, Outcome::RetryCompleted).await,
            Err(report) if !report.current_context().is_retryable() => {
                error!(error = %report, "retry attempt rejected");
                self.close_retry(&record, Outcome::Rejected).await
            }
            Err(report) if record.is_exhausted(self.options.retry.repeat_count) => {
                error!(
                    error = %report,
                    attempts = record.attempt(),
                    "retry attempts exhausted, abandoning message"
                );
                self.close_retry(&record, Outcome::Abandoned).await
            }
            Err(report) => {
                warn!(error = %report, "retry attempt failed");
                let id = match self.ids.next::<MessageId>() {
                    Ok(id) => id,
                    Err(report) => {
                        error!(error = %report, "cannot mint retry id");
                        return Outcome::RetryLost;
                    }
                };
                let update = record.increment(id, &self.options.retry, Utc::now());
                match self.publish_intent(&update).await {
                    Ok(()) => Outcome::RetryScheduled,
                    Err(report) => {
                        error!(error = %report, "failed to publish retry update");
                        Outcome::RetryLost
                    }
                }
            }
        }
    }

    async fn close_retry(&self, record: &RetryRecord<T>, outcome: Outcome) -> Outcome {
        let id = match self.ids.next::<MessageId>() {
            Ok(id) => id,
            Err(report) => {
                error!(error = %report, "cannot mint retry id");
                return Outcome::RetryLost;
            }
        };
        match self.publish_intent(&record.delete(id)).await {
            Ok(()) => outcome,
            Err(report) => {
                error!(error = %report, "failed to publish retry delete");
                Outcome::RetryLost
            }
        }
    }

    async fn claim(&self, message_id: &str, topic: &str) -> Result<Claim, DedupError> {
        let key = DedupKey::new(message_id, topic, self.options.broker_type.as_str());
        self.dedup.claim(&key, self.options.dedup_ttl).await
    }

    async fn publish_intent(&self, record: &RetryRecord<T>) -> Result<(), BusError> {
        publish_json(
            &self.bus,
            &self.options.retries_topic,
            &record.origin_message_id,
            record,
        )
        .await
    }
}

async fn acknowledge(acker: Box<dyn Acknowledge>) {
    if let Err(report) = acker.ack().await {
        warn!(error = %report, "failed to acknowledge message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryBus, InMemoryDedupStore, InMemorySubscription, ack_tracker};
    use crate::retry::RetryStatus;
    use serde::Deserialize;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        amount: u32,
    }

    /// Records calls and fails according to the configured mode.
    #[derive(Clone, Default)]
    struct RecordingHandler {
        calls: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<String>>>,
        fail: Arc<Mutex<Option<HandlerError>>>,
    }

    impl RecordingHandler {
        fn failing(error: HandlerError) -> Self {
            let handler = Self::default();
            *handler.fail.lock().unwrap() = Some(error);
            handler
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessageHandler<Order> for RecordingHandler {
        async fn handle(
            &self,
            _context: &DeliveryContext,
            envelope: &Envelope<Order>,
        ) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(envelope.message_id.clone());
            match self.fail.lock().unwrap().clone() {
                Some(error) => Err(error.into()),
                None => Ok(()),
            }
        }
    }

    type TestConsumer = Consumer<Order, RecordingHandler, InMemoryBus, InMemoryDedupStore>;

    fn consumer(handler: RecordingHandler, bus: InMemoryBus, dedup: InMemoryDedupStore) -> TestConsumer {
        let options = ConsumerOptions::new("switchyard", "TEST", "retries-event").with_retry(
            RetryPolicy {
                repeat_count: 2,
                delay: Duration::from_millis(300),
                max_delay: Duration::from_secs(5),
            },
        );
        let ids = Arc::new(IdGenerator::with_node_id(1).expect("node id"));
        Consumer::new(handler, bus, dedup, ids, options)
    }

    fn order_payload(message_id: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "messageId": message_id,
            "subject": "ORDER",
            "content": {"amount": 10}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn processes_and_acks() {
        let handler = RecordingHandler::default();
        let consumer = consumer(handler.clone(), InMemoryBus::new(), InMemoryDedupStore::new());
        let (acker, acked) = ack_tracker();

        let outcome = consumer
            .process(Delivery::new("orders", 0, 1, order_payload("11"), acker))
            .await;

        assert_eq!(outcome, Outcome::Processed);
        assert_eq!(handler.calls(), 1);
        assert!(acked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn redelivery_does_not_reach_handler() {
        let handler = RecordingHandler::default();
        let consumer = consumer(handler.clone(), InMemoryBus::new(), InMemoryDedupStore::new());

        let (first, _) = ack_tracker();
        let (second, second_acked) = ack_tracker();
        consumer
            .process(Delivery::new("orders", 0, 1, order_payload("11"), first))
            .await;
        let outcome = consumer
            .process(Delivery::new("orders", 0, 1, order_payload("11"), second))
            .await;

        assert_eq!(outcome, Outcome::Duplicate);
        assert_eq!(handler.calls(), 1);
        assert!(second_acked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn poison_messages_are_dropped_and_acked() {
        let handler = RecordingHandler::default();
        let consumer = consumer(handler.clone(), InMemoryBus::new(), InMemoryDedupStore::new());

        let (garbage_ack, garbage_acked) = ack_tracker();
        let garbage = consumer
            .process(Delivery::new("orders", 0, 1, b"not json".to_vec(), garbage_ack))
            .await;
        let (null_ack, _) = ack_tracker();
        let null = consumer
            .process(Delivery::new(
                "orders",
                0,
                2,
                br#"{"messageId":"12","content":null}"#.to_vec(),
                null_ack,
            ))
            .await;

        assert_eq!(garbage, Outcome::Dropped);
        assert_eq!(null, Outcome::Dropped);
        assert_eq!(handler.calls(), 0);
        assert!(garbage_acked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn blank_id_uses_delivery_coordinates() {
        let handler = RecordingHandler::default();
        let consumer = consumer(handler.clone(), InMemoryBus::new(), InMemoryDedupStore::new());
        let (acker, _) = ack_tracker();

        consumer
            .process(Delivery::new("orders", 3, 42, order_payload(""), acker))
            .await;

        assert_eq!(handler.seen.lock().unwrap().as_slice(), ["orders_3_42"]);
    }

    #[tokio::test]
    async fn transient_failure_publishes_insert_intent() {
        let handler = RecordingHandler::failing(HandlerError::transient("db down"));
        let bus = InMemoryBus::new();
        let consumer = consumer(handler, bus.clone(), InMemoryDedupStore::new());
        let (acker, acked) = ack_tracker();

        let outcome = consumer
            .process(Delivery::new("orders", 0, 1, order_payload("11"), acker))
            .await;

        assert_eq!(outcome, Outcome::RetryScheduled);
        assert!(acked.load(Ordering::SeqCst));

        let published = bus.published_on("retries-event");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key, "11");
        let record: RetryRecord<Order> = published[0].decode().expect("retry record");
        assert_eq!(record.status, RetryStatus::Insert);
        assert_eq!(record.retries_no, Some(1));
        assert_eq!(record.topic.as_deref(), Some("orders"));
        assert_eq!(record.destination.as_deref(), Some("orders.SWITCHYARD.RETRIES"));
        assert_eq!(
            record.data.and_then(|e| e.content),
            Some(Order { amount: 10 })
        );
    }

    #[tokio::test]
    async fn unrecoverable_failure_is_not_retried() {
        let handler = RecordingHandler::failing(HandlerError::unrecoverable("unknown workflow"));
        let bus = InMemoryBus::new();
        let consumer = consumer(handler, bus.clone(), InMemoryDedupStore::new());
        let (acker, acked) = ack_tracker();

        let outcome = consumer
            .process(Delivery::new("orders", 0, 1, order_payload("11"), acker))
            .await;

        assert_eq!(outcome, Outcome::Rejected);
        assert!(acked.load(Ordering::SeqCst));
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn dedup_outage_goes_to_retry() {
        let handler = RecordingHandler::default();
        let bus = InMemoryBus::new();
        let dedup = InMemoryDedupStore::new();
        dedup.set_unavailable(true);
        let consumer = consumer(handler.clone(), bus.clone(), dedup);
        let (acker, _) = ack_tracker();

        let outcome = consumer
            .process(Delivery::new("orders", 0, 1, order_payload("11"), acker))
            .await;

        assert_eq!(outcome, Outcome::RetryScheduled);
        assert_eq!(handler.calls(), 0);
    }

    fn retry_payload(message_id: &str, attempt: u32) -> Vec<u8> {
        let mut record = RetryRecord::insert(
            MessageId::new(900),
            Envelope {
                message_id: "11".to_string(),
                subject: Some("ORDER".to_string()),
                content: Some(Order { amount: 10 }),
            },
            "orders",
            "switchyard",
            &RetryPolicy::default(),
            Utc::now(),
        );
        record.message_id = message_id.to_string();
        record.retries_no = Some(attempt);
        record.repeat_count = Some(2);
        serde_json::to_vec(&record).unwrap()
    }

    #[tokio::test]
    async fn successful_retry_publishes_delete() {
        let handler = RecordingHandler::default();
        let bus = InMemoryBus::new();
        let consumer = consumer(handler.clone(), bus.clone(), InMemoryDedupStore::new());
        let (acker, acked) = ack_tracker();

        let outcome = consumer
            .process_retry(Delivery::new(
                "orders.SWITCHYARD.RETRIES",
                0,
                1,
                retry_payload("901", 1),
                acker,
            ))
            .await;

        assert_eq!(outcome, Outcome::RetryCompleted);
        assert!(acked.load(Ordering::SeqCst));
        assert_eq!(handler.seen.lock().unwrap().as_slice(), ["11"]);

        let published = bus.published_on("retries-event");
        let record: RetryRecord<Order> = published[0].decode().expect("record");
        assert_eq!(record.status, RetryStatus::Delete);
        assert_eq!(record.origin_message_id, "11");
        assert_eq!(published[0].key, "11");
    }

    #[tokio::test]
    async fn failed_retry_publishes_update() {
        let handler = RecordingHandler::failing(HandlerError::transient("db down"));
        let bus = InMemoryBus::new();
        let consumer = consumer(handler, bus.clone(), InMemoryDedupStore::new());
        let (acker, _) = ack_tracker();

        let outcome = consumer
            .process_retry(Delivery::new("feed", 0, 1, retry_payload("901", 1), acker))
            .await;

        assert_eq!(outcome, Outcome::RetryScheduled);
        let record: RetryRecord<Order> = bus.published_on("retries-event")[0]
            .decode()
            .expect("record");
        assert_eq!(record.status, RetryStatus::Update);
        assert_eq!(record.retries_no, Some(2));
        assert!(record.data.is_none());
    }

    #[tokio::test]
    async fn exhausted_retry_is_abandoned() {
        let handler = RecordingHandler::failing(HandlerError::transient("db down"));
        let bus = InMemoryBus::new();
        let consumer = consumer(handler, bus.clone(), InMemoryDedupStore::new());
        let (acker, _) = ack_tracker();

        let outcome = consumer
            .process_retry(Delivery::new("feed", 0, 1, retry_payload("902", 2), acker))
            .await;

        assert_eq!(outcome, Outcome::Abandoned);
        let record: RetryRecord<Order> = bus.published_on("retries-event")[0]
            .decode()
            .expect("record");
        assert_eq!(record.status, RetryStatus::Delete);
    }

    #[tokio::test]
    async fn retry_records_are_deduplicated_by_their_own_id() {
        let handler = RecordingHandler::default();
        let consumer = consumer(handler.clone(), InMemoryBus::new(), InMemoryDedupStore::new());

        for _ in 0..2 {
            let (acker, _) = ack_tracker();
            consumer
                .process_retry(Delivery::new("feed", 0, 1, retry_payload("903", 1), acker))
                .await;
        }
        let (acker, _) = ack_tracker();
        let fresh = consumer
            .process_retry(Delivery::new("feed", 0, 2, retry_payload("904", 2), acker))
            .await;

        assert_eq!(handler.calls(), 2);
        assert_eq!(fresh, Outcome::RetryCompleted);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let handler = RecordingHandler::default();
        let consumer = Arc::new(consumer(
            handler.clone(),
            InMemoryBus::new(),
            InMemoryDedupStore::new(),
        ));
        let (sender, subscription) = InMemorySubscription::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (acker, _) = ack_tracker();
        sender
            .send(Delivery::new("orders", 0, 1, order_payload("11"), acker))
            .unwrap();

        let task = tokio::spawn({
            let consumer = Arc::clone(&consumer);
            async move { consumer.run(subscription, Feed::Primary, shutdown_rx).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(handler.calls(), 1);
    }
}
