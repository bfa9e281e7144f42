//! NATS JetStream implementations of the bus and dedup store.
//!
//! - Topic `t` is stream `T` with subjects `t.*`, so a topic never captures
//!   the partitions of a longer topic such as its retry feed
//! - A message keyed by `k` goes to subject `t.{partition_for(k)}`
//! - Each partition is read by one durable pull consumer with explicit ack,
//!   one in-flight message at a time, which keeps per-key order
//! - Dedup claims are `create` calls on a key-value bucket whose `max_age`
//!   is the claim TTL

use crate::bus::{Acknowledge, Delivery, MessageBus, Subscription, partition_for};
use crate::dedup::{Claim, DEFAULT_DEDUP_TTL, DedupKey, DedupStore};
use crate::error::{BusError, DedupError};
use async_nats::jetstream;
use async_nats::jetstream::consumer::{AckPolicy, pull};
use async_nats::jetstream::kv;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use switchyard_core::Result;
use tracing::{debug, info};

/// Broker family recorded in dedup keys.
pub const BROKER_TYPE: &str = "NATS";

/// Header carrying the partition key.
pub const KEY_HEADER: &str = "Switchyard-Key";

const DEFAULT_PARTITIONS: u32 = 8;
const DEFAULT_DEDUP_BUCKET: &str = "switchyard-dedup";

/// Configuration for the NATS adapters.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URL.
    pub url: String,
    /// Partitions per topic (defaults to 8).
    pub partitions: Option<u32>,
    /// Key-value bucket for dedup claims (defaults to switchyard-dedup).
    pub dedup_bucket_name: Option<String>,
    /// Claim TTL (defaults to 12 hours).
    pub dedup_ttl: Option<Duration>,
}

impl NatsConfig {
    /// Creates a new config with the given NATS URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            partitions: None,
            dedup_bucket_name: None,
            dedup_ttl: None,
        }
    }

    #[must_use]
    pub fn partitions(&self) -> u32 {
        self.partitions.unwrap_or(DEFAULT_PARTITIONS).max(1)
    }

    fn dedup_bucket(&self) -> &str {
        self.dedup_bucket_name
            .as_deref()
            .unwrap_or(DEFAULT_DEDUP_BUCKET)
    }

    fn dedup_ttl(&self) -> Duration {
        self.dedup_ttl.unwrap_or(DEFAULT_DEDUP_TTL)
    }
}

/// Connects to NATS and returns a JetStream context.
///
/// # Errors
///
/// Returns an error if the connection fails.
pub async fn connect(config: &NatsConfig) -> Result<jetstream::Context, BusError> {
    let client =
        async_nats::connect(&config.url)
            .await
            .map_err(|e| BusError::ConnectionFailed {
                message: e.to_string(),
            })?;
    info!(url = %config.url, "connected to NATS");
    Ok(jetstream::new(client))
}

/// JetStream-backed message bus.
#[derive(Clone)]
pub struct NatsBus {
    jetstream: jetstream::Context,
    partitions: u32,
    known_streams: Arc<Mutex<HashSet<String>>>,
}

impl NatsBus {
    /// Creates a bus over an existing JetStream context.
    #[must_use]
    pub fn new(jetstream: jetstream::Context, config: &NatsConfig) -> Self {
        Self {
            jetstream,
            partitions: config.partitions(),
            known_streams: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Number of partitions per topic.
    #[must_use]
    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Stream name for a topic.
    #[must_use]
    pub fn stream_name(topic: &str) -> String {
        topic
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    }

    /// Subject for one partition of a topic.
    #[must_use]
    pub fn subject(topic: &str, partition: u32) -> String {
        format!("{topic}.{partition}")
    }

    async fn stream(&self, topic: &str) -> Result<jetstream::stream::Stream, BusError> {
        let config = jetstream::stream::Config {
            name: Self::stream_name(topic),
            subjects: vec![format!("{topic}.*")],
            storage: jetstream::stream::StorageType::File,
            retention: jetstream::stream::RetentionPolicy::Limits,
            ..Default::default()
        };

        self.jetstream
            .get_or_create_stream(config)
            .await
            .map_err(|e| {
                BusError::ConnectionFailed {
                    message: format!("failed to create stream for '{topic}': {e}"),
                }
                .into()
            })
    }

    async fn ensure_stream(&self, topic: &str) -> Result<(), BusError> {
        let known = self
            .known_streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(topic);
        if !known {
            self.stream(topic).await?;
            self.known_streams
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(topic.to_string());
        }
        Ok(())
    }

    /// Opens the durable subscription for one partition of `topic`.
    ///
    /// `group` names the consuming application; the durable consumer is
    /// `{group}-{partition}`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream or consumer cannot be created.
    pub async fn subscribe(
        &self,
        topic: &str,
        partition: u32,
        group: &str,
    ) -> Result<NatsSubscription, BusError> {
        let stream = self.stream(topic).await?;
        let durable = format!("{}-{partition}", Self::stream_name(group).to_lowercase());
        let subscribe_failed = |e: String| BusError::SubscribeFailed {
            topic: topic.to_string(),
            message: e,
        };

        let consumer = stream
            .get_or_create_consumer(
                &durable,
                pull::Config {
                    durable_name: Some(durable.clone()),
                    filter_subject: Self::subject(topic, partition),
                    ack_policy: AckPolicy::Explicit,
                    max_ack_pending: 1,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| subscribe_failed(e.to_string()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| subscribe_failed(e.to_string()))?;

        debug!(%topic, partition, %durable, "subscribed");
        Ok(NatsSubscription {
            topic: topic.to_string(),
            partition,
            messages,
        })
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.ensure_stream(topic).await?;

        let subject = Self::subject(topic, partition_for(key, self.partitions));
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(KEY_HEADER, key);

        let publish_failed = |e: String| BusError::PublishFailed {
            topic: topic.to_string(),
            message: e,
        };

        self.jetstream
            .publish_with_headers(subject, headers, payload.into())
            .await
            .map_err(|e| publish_failed(e.to_string()))?
            .await
            .map_err(|e| publish_failed(e.to_string()))?;

        Ok(())
    }
}

/// Pull subscription on one partition.
pub struct NatsSubscription {
    topic: String,
    partition: u32,
    messages: pull::Stream,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BusError>> {
        let message = match self.messages.next().await? {
            Ok(message) => message,
            Err(e) => {
                return Some(Err(BusError::ReceiveFailed {
                    message: e.to_string(),
                }
                .into()));
            }
        };

        let offset = message
            .info()
            .map(|info| info.stream_sequence)
            .unwrap_or_default();
        let payload = message.payload.to_vec();

        Some(Ok(Delivery::new(
            self.topic.clone(),
            self.partition,
            offset,
            payload,
            NatsAck { message },
        )))
    }
}

struct NatsAck {
    message: jetstream::Message,
}

#[async_trait]
impl Acknowledge for NatsAck {
    async fn ack(self: Box<Self>) -> Result<(), BusError> {
        self.message.ack().await.map_err(|e| {
            BusError::AckFailed {
                message: e.to_string(),
            }
            .into()
        })
    }
}

/// Dedup store on a JetStream key-value bucket.
///
/// The TTL is a bucket property, so the `ttl` passed to
/// [`DedupStore::claim`] is ignored in favour of [`NatsConfig::dedup_ttl`].
pub struct NatsDedupStore {
    kv: kv::Store,
}

impl NatsDedupStore {
    /// Opens the dedup bucket, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket cannot be opened or created.
    pub async fn new(jetstream: &jetstream::Context, config: &NatsConfig) -> Result<Self, DedupError> {
        let bucket = config.dedup_bucket();
        let kv = match jetstream.get_key_value(bucket).await {
            Ok(kv) => kv,
            Err(_) => jetstream
                .create_key_value(kv::Config {
                    bucket: bucket.to_string(),
                    history: 1,
                    max_age: config.dedup_ttl(),
                    ..Default::default()
                })
                .await
                .map_err(|e| DedupError::Unavailable {
                    message: format!("failed to create bucket '{bucket}': {e}"),
                })?,
        };

        Ok(Self { kv })
    }
}

#[async_trait]
impl DedupStore for NatsDedupStore {
    async fn claim(&self, key: &DedupKey, _ttl: Duration) -> Result<Claim, DedupError> {
        let storage_key = key.storage_key();
        match self.kv.create(&storage_key, vec![b'1'].into()).await {
            Ok(_) => Ok(Claim::First),
            Err(e) if e.kind() == kv::CreateErrorKind::AlreadyExists => Ok(Claim::Duplicate),
            Err(e) => Err(DedupError::ClaimFailed {
                key: storage_key,
                message: e.to_string(),
            }
            .into()),
        }
    }
}
