//! Deduplication store seam.
//!
//! A message is processed only by whoever first claims its key. Claims expire
//! after a TTL, so the store only needs to outlive the bus's redelivery window.

use crate::error::DedupError;
use async_trait::async_trait;
use std::time::Duration;
use switchyard_core::Result;

/// How long a claim is remembered.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// Result of a set-if-absent claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The key was absent and is now held by the caller.
    First,
    /// The key already existed.
    Duplicate,
}

/// Identity of a processed message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    /// Message id from the envelope.
    pub message_id: String,
    /// Topic the message was consumed from.
    pub topic: String,
    /// Broker family, e.g. `NATS`.
    pub broker_type: String,
}

impl DedupKey {
    /// Creates a key.
    #[must_use]
    pub fn new(
        message_id: impl Into<String>,
        topic: impl Into<String>,
        broker_type: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            topic: topic.into(),
            broker_type: broker_type.into(),
        }
    }

    /// Flattened key, safe for key-value stores with restricted alphabets.
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!(
            "{}.{}.{}",
            sanitize(&self.broker_type),
            sanitize(&self.topic),
            sanitize(&self.message_id)
        )
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Set-if-absent store with per-key expiry.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Claims `key` for `ttl`.
    async fn claim(&self, key: &DedupKey, ttl: Duration) -> Result<Claim, DedupError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_key_is_sanitized() {
        let key = DedupKey::new("workflow-event_0_12", "workflow-event.SWITCHYARD.RETRIES", "NATS");
        assert_eq!(
            key.storage_key(),
            "NATS.workflow-event_SWITCHYARD_RETRIES.workflow-event_0_12"
        );
    }

    #[test]
    fn topic_is_part_of_identity() {
        let a = DedupKey::new("1", "a", "NATS");
        let b = DedupKey::new("1", "b", "NATS");
        assert_ne!(a.storage_key(), b.storage_key());
    }
}
