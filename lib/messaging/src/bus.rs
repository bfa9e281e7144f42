//! Publish/consume seam over a partitioned, ordered log.
//!
//! Messages are published under a key. All messages with the same key land on
//! the same partition and are delivered in publish order. Consumers receive a
//! [`Delivery`] and must acknowledge it explicitly.

use crate::error::BusError;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use switchyard_core::{Result, stable_hash};

/// Where a message was delivered from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryContext {
    /// Topic the message was consumed from.
    pub topic: String,
    /// Partition within the topic.
    pub partition: u32,
    /// Position within the partition.
    pub offset: u64,
}

impl DeliveryContext {
    /// Message id used when an envelope arrives without one.
    #[must_use]
    pub fn fallback_message_id(&self) -> String {
        format!("{}_{}_{}", self.topic, self.partition, self.offset)
    }
}

/// Acknowledges a single delivery back to the broker.
#[async_trait]
pub trait Acknowledge: Send {
    /// Marks the delivery as consumed.
    async fn ack(self: Box<Self>) -> Result<(), BusError>;
}

/// A message received from a subscription, not yet acknowledged.
pub struct Delivery {
    context: DeliveryContext,
    payload: Vec<u8>,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    /// Creates a delivery.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        partition: u32,
        offset: u64,
        payload: Vec<u8>,
        acker: impl Acknowledge + 'static,
    ) -> Self {
        Self {
            context: DeliveryContext {
                topic: topic.into(),
                partition,
                offset,
            },
            payload,
            acker: Box::new(acker),
        }
    }

    /// Returns the delivery coordinates.
    #[must_use]
    pub fn context(&self) -> &DeliveryContext {
        &self.context
    }

    /// Returns the raw payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Splits the delivery so the acknowledgement can be held across awaits.
    #[must_use]
    pub fn into_parts(self) -> (DeliveryContext, Vec<u8>, Box<dyn Acknowledge>) {
        (self.context, self.payload, self.acker)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("context", &self.context)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

/// Publishes keyed messages.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes `payload` to `topic` under `key`.
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), BusError>;
}

/// A stream of deliveries for one partition of one topic.
#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next delivery. `None` means the subscription closed.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BusError>>;
}

/// Serializes `value` as JSON and publishes it.
///
/// # Errors
///
/// Returns an error if serialization or the publish fails.
pub async fn publish_json<B, T>(bus: &B, topic: &str, key: &str, value: &T) -> Result<(), BusError>
where
    B: MessageBus + ?Sized,
    T: Serialize + Sync,
{
    let payload = serde_json::to_vec(value).map_err(|e| BusError::Serialization {
        message: e.to_string(),
    })?;
    bus.publish(topic, key, payload).await
}

/// Maps a key onto one of `partitions` partitions.
///
/// Stable across processes and releases.
#[must_use]
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let partitions = u64::from(partitions.max(1));
    (stable_hash(key.as_bytes()) % partitions) as u32
}
