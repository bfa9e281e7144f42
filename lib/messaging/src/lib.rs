//! Message delivery for switchyard.
//!
//! This crate turns an at-least-once, partitioned log into safe input for a
//! non-idempotent handler:
//!
//! - **Envelope**: `{messageId, subject, content}` wrapper for every payload
//! - **Dedup**: set-if-absent claims keyed by message id, topic and broker
//! - **Retry ledger**: explicit INSERT/UPDATE/DELETE retry intents with backoff
//! - **Consumer**: the generic receive, dedup, handle, retry, ack loop
//! - **NATS**: JetStream bus and key-value dedup store
//! - **Memory**: in-process bus and dedup store for tests and local runs

pub mod bus;
pub mod consumer;
pub mod dedup;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod nats;
pub mod retry;

pub use bus::{
    Acknowledge, Delivery, DeliveryContext, MessageBus, Subscription, partition_for, publish_json,
};
pub use consumer::{Consumer, ConsumerOptions, Feed, MessageHandler, Outcome};
pub use dedup::{Claim, DEFAULT_DEDUP_TTL, DedupKey, DedupStore};
pub use envelope::Envelope;
pub use error::{BusError, DedupError, HandlerError};
pub use memory::{
    InMemoryAck, InMemoryBus, InMemoryDedupStore, InMemorySubscription, PublishedMessage, ack_tracker,
};
pub use nats::{BROKER_TYPE, NatsBus, NatsConfig, NatsDedupStore, NatsSubscription};
pub use retry::{RetryPolicy, RetryRecord, RetryStatus, retry_feed_topic};
