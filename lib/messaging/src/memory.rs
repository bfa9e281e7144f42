//! In-process bus and dedup store.
//!
//! Cloning shares state, so a test can keep a handle while a consumer or
//! decider owns another.

use crate::bus::{Acknowledge, Delivery, MessageBus, Subscription};
use crate::dedup::{Claim, DedupKey, DedupStore};
use crate::error::{BusError, DedupError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use switchyard_core::Result;
use tokio::sync::mpsc;

/// A message captured by [`InMemoryBus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

impl PublishedMessage {
    /// Decodes the payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not valid JSON for `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Bus that records every publish.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBus {
    published: Arc<Mutex<Vec<PublishedMessage>>>,
    failures: Arc<AtomicUsize>,
}

impl InMemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` publishes fail.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Everything published so far, in order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Everything published to `topic`, in order.
    #[must_use]
    pub fn published_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }

    /// Forgets everything published so far.
    pub fn clear(&self) {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let should_fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(BusError::PublishFailed {
                topic: topic.to_string(),
                message: "injected failure".to_string(),
            }
            .into());
        }

        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PublishedMessage {
                topic: topic.to_string(),
                key: key.to_string(),
                payload,
            });
        Ok(())
    }
}

/// Acknowledgement that flips a shared flag.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAck {
    acked: Arc<AtomicBool>,
}

#[async_trait]
impl Acknowledge for InMemoryAck {
    async fn ack(self: Box<Self>) -> Result<(), BusError> {
        self.acked.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Returns an acknowledgement and the flag it sets.
#[must_use]
pub fn ack_tracker() -> (InMemoryAck, Arc<AtomicBool>) {
    let ack = InMemoryAck::default();
    let flag = Arc::clone(&ack.acked);
    (ack, flag)
}

/// Subscription fed from a channel.
#[derive(Debug)]
pub struct InMemorySubscription {
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl InMemorySubscription {
    /// Creates a subscription and the sender that feeds it.
    #[must_use]
    pub fn channel() -> (mpsc::UnboundedSender<Delivery>, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (sender, Self { receiver })
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BusError>> {
        self.receiver.recv().await.map(Ok)
    }
}

/// Dedup store backed by a map of expiry instants.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDedupStore {
    claims: Arc<Mutex<HashMap<String, Instant>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryDedupStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every claim fail while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn claim(&self, key: &DedupKey, ttl: Duration) -> Result<Claim, DedupError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DedupError::Unavailable {
                message: "injected outage".to_string(),
            }
            .into());
        }

        let now = Instant::now();
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        match claims.get(&key.storage_key()) {
            Some(expires) if *expires > now => Ok(Claim::Duplicate),
            _ => {
                claims.insert(key.storage_key(), now + ttl);
                Ok(Claim::First)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dedup_claims_once() {
        let store = InMemoryDedupStore::new();
        let key = DedupKey::new("1", "orders", "TEST");

        assert_eq!(
            store.claim(&key, Duration::from_secs(60)).await.unwrap(),
            Claim::First
        );
        assert_eq!(
            store.claim(&key, Duration::from_secs(60)).await.unwrap(),
            Claim::Duplicate
        );
    }

    #[tokio::test]
    async fn dedup_claims_expire() {
        let store = InMemoryDedupStore::new();
        let key = DedupKey::new("1", "orders", "TEST");

        store.claim(&key, Duration::ZERO).await.unwrap();
        assert_eq!(
            store.claim(&key, Duration::from_secs(60)).await.unwrap(),
            Claim::First
        );
    }

    #[tokio::test]
    async fn bus_records_and_injects_failures() {
        let bus = InMemoryBus::new();
        bus.fail_next(1);

        assert!(bus.publish("t", "k", b"1".to_vec()).await.is_err());
        bus.publish("t", "k", b"2".to_vec()).await.unwrap();

        let published = bus.published_on("t");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].payload, b"2");
    }
}
