//! Error types for message delivery.
//!
//! Bus and dedup errors describe infrastructure failures and are always
//! transient from the consumer's point of view. `HandlerError` is what a
//! [`MessageHandler`](crate::MessageHandler) reports, and its variant decides
//! whether the consumer schedules a retry or drops the message.

use std::fmt;

/// Errors from the message bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Could not connect to the broker.
    ConnectionFailed { message: String },
    /// Publishing to a topic failed.
    PublishFailed { topic: String, message: String },
    /// Creating a subscription failed.
    SubscribeFailed { topic: String, message: String },
    /// Receiving the next message failed.
    ReceiveFailed { message: String },
    /// Acknowledging a message failed.
    AckFailed { message: String },
    /// A payload could not be serialized.
    Serialization { message: String },
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed { message } => write!(f, "bus connection failed: {message}"),
            Self::PublishFailed { topic, message } => {
                write!(f, "publish to '{topic}' failed: {message}")
            }
            Self::SubscribeFailed { topic, message } => {
                write!(f, "subscribe to '{topic}' failed: {message}")
            }
            Self::ReceiveFailed { message } => write!(f, "receive failed: {message}"),
            Self::AckFailed { message } => write!(f, "ack failed: {message}"),
            Self::Serialization { message } => write!(f, "serialization failed: {message}"),
        }
    }
}

impl std::error::Error for BusError {}

/// Errors from the deduplication store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupError {
    /// The store could not be reached or set up.
    Unavailable { message: String },
    /// A set-if-absent claim failed for a reason other than an existing key.
    ClaimFailed { key: String, message: String },
}

impl fmt::Display for DedupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { message } => write!(f, "dedup store unavailable: {message}"),
            Self::ClaimFailed { key, message } => {
                write!(f, "dedup claim for '{key}' failed: {message}")
            }
        }
    }
}

impl std::error::Error for DedupError {}

/// Failure reported by a message handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The failure may clear on a later attempt (I/O, conflicts).
    Transient { reason: String },
    /// Redelivery cannot change the outcome.
    Unrecoverable { reason: String },
}

impl HandlerError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    /// Creates an unrecoverable error.
    #[must_use]
    pub fn unrecoverable(reason: impl Into<String>) -> Self {
        Self::Unrecoverable {
            reason: reason.into(),
        }
    }

    /// Returns true if the message should go to the retry ledger.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient { reason } => write!(f, "transient handler failure: {reason}"),
            Self::Unrecoverable { reason } => write!(f, "unrecoverable handler failure: {reason}"),
        }
    }
}

impl std::error::Error for HandlerError {}
