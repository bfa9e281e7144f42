//! Message envelope shared by every topic.
//!
//! ```json
//! { "messageId": "<decimal uint64>", "subject": "START_WORKFLOW", "content": { ... } }
//! ```
//!
//! A message whose `content` is absent or `null` is a poison message.

use crate::bus::DeliveryContext;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use switchyard_core::MessageId;

/// A payload with its message id and optional subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    /// Message id. Normally a decimal Snowflake id.
    #[serde(default)]
    pub message_id: String,
    /// Subject naming the operation the content is for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// The payload.
    pub content: Option<T>,
}

impl<T> Envelope<T> {
    /// Creates an envelope with a generated message id.
    #[must_use]
    pub fn new(message_id: MessageId, subject: Option<&str>, content: T) -> Self {
        Self {
            message_id: message_id.to_string(),
            subject: subject.map(str::to_string),
            content: Some(content),
        }
    }

    /// Returns the payload, if present.
    #[must_use]
    pub fn content(&self) -> Option<&T> {
        self.content.as_ref()
    }

    /// Returns true if the message id is missing or blank.
    #[must_use]
    pub fn has_blank_id(&self) -> bool {
        self.message_id.trim().is_empty()
    }

    /// Gives a blank message id a value derived from where it was delivered.
    pub fn ensure_message_id(&mut self, context: &DeliveryContext) {
        if self.has_blank_id() {
            self.message_id = context.fallback_message_id();
        }
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serializes the envelope to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Deserializes an envelope from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
