//! Application-level retry ledger.
//!
//! A failed delivery is not handed back to the broker. Instead the consumer
//! publishes retry *intents* keyed by the original message id:
//!
//! - `INSERT` when the original message first fails, carrying the envelope
//! - `UPDATE` when a retry attempt fails again, with the next deadline
//! - `DELETE` when an attempt succeeds or the message is abandoned
//!
//! An external retry store folds these intents into rows and re-feeds due
//! rows onto the retry feed topic (`{topic}.{SOURCE}.RETRIES`).

use crate::envelope::Envelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use switchyard_core::MessageId;

/// Intent carried by a retry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryStatus {
    /// A new retry row.
    Insert,
    /// Another attempt is due later.
    Update,
    /// The retry row is finished.
    Delete,
}

/// Bounded exponential backoff for retry attempts.
///
/// The delay before attempt N is `min(delay * 2^(N-1), max_delay)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of retry attempts after the original failure. Zero disables
    /// the ledger.
    pub repeat_count: u32,
    /// Delay before the first retry.
    pub delay: Duration,
    /// Cap on the delay between attempts.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            repeat_count: 10,
            delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.delay.saturating_mul(multiplier).min(self.max_delay)
    }

    /// Deadline for attempt `attempt` counted from `now`.
    #[must_use]
    pub fn deadline(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.backoff(attempt))
            .unwrap_or_else(|_| chrono::Duration::zero());
        now + delay
    }
}

/// One retry intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRecord<T> {
    /// Fresh id for this intent, deduplicated on its own.
    pub message_id: String,
    /// Id of the message that originally failed.
    pub origin_message_id: String,
    /// The original envelope, only present on `INSERT` and on re-feeds.
    pub data: Option<Envelope<T>>,
    /// Topic the original message was consumed from.
    pub topic: Option<String>,
    /// Upper-cased name of the application that owns the retry.
    pub source: Option<String>,
    /// Topic due attempts are re-fed to.
    pub destination: Option<String>,
    /// Attempt number, starting at 1.
    pub retries_no: Option<u32>,
    /// Maximum number of attempts.
    pub repeat_count: Option<u32>,
    /// Base delay in milliseconds.
    pub delay_time: Option<u64>,
    /// When the next attempt is due.
    pub pre_execute_at: Option<DateTime<Utc>>,
    /// Intent.
    pub status: RetryStatus,
}

/// Retry feed topic for messages consumed from `topic` by `application`.
#[must_use]
pub fn retry_feed_topic(topic: &str, application: &str) -> String {
    format!("{topic}.{}.RETRIES", application.to_uppercase())
}

impl<T> RetryRecord<T> {
    /// Creates the `INSERT` intent for a message that failed on `topic`.
    #[must_use]
    pub fn insert(
        message_id: MessageId,
        envelope: Envelope<T>,
        topic: &str,
        application: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: message_id.to_string(),
            origin_message_id: envelope.message_id.clone(),
            data: Some(envelope),
            topic: Some(topic.to_string()),
            source: Some(application.to_uppercase()),
            destination: Some(retry_feed_topic(topic, application)),
            retries_no: Some(1),
            repeat_count: Some(policy.repeat_count),
            delay_time: Some(duration_millis(policy.delay)),
            pre_execute_at: Some(policy.deadline(1, now)),
            status: RetryStatus::Insert,
        }
    }

    /// Creates the `UPDATE` intent after this attempt failed.
    ///
    /// The payload and routing fields are dropped; the retry store keeps them
    /// from the `INSERT`.
    #[must_use]
    pub fn increment(&self, message_id: MessageId, policy: &RetryPolicy, now: DateTime<Utc>) -> Self {
        let next = self.attempt() + 1;
        Self {
            message_id: message_id.to_string(),
            origin_message_id: self.origin_message_id.clone(),
            data: None,
            topic: None,
            source: None,
            destination: None,
            retries_no: Some(next),
            repeat_count: None,
            delay_time: self.delay_time,
            pre_execute_at: Some(policy.deadline(next, now)),
            status: RetryStatus::Update,
        }
    }

    /// Creates the `DELETE` intent that closes this retry row.
    #[must_use]
    pub fn delete(&self, message_id: MessageId) -> Self {
        Self {
            message_id: message_id.to_string(),
            origin_message_id: self.origin_message_id.clone(),
            data: None,
            topic: None,
            source: None,
            destination: None,
            retries_no: None,
            repeat_count: None,
            delay_time: None,
            pre_execute_at: self.pre_execute_at,
            status: RetryStatus::Delete,
        }
    }

    /// Current attempt number.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.retries_no.unwrap_or(1)
    }

    /// Returns true once no further attempt is allowed. `default_limit`
    /// applies when the record carries no repeat count.
    #[must_use]
    pub fn is_exhausted(&self, default_limit: u32) -> bool {
        self.attempt() >= self.repeat_count.unwrap_or(default_limit)
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
