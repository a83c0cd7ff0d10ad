//! Message envelope.
//!
//! Every agent invocation takes one message in and returns one message out.
//! The payload is the only field generic aggregation code interprets; metadata
//! rides along untouched unless a pattern deliberately adds to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::{Metadata, Value};

/// Conventional values for [`Message::kind`].
pub mod kind {
    pub const REQUEST: &str = "request";
    pub const RESPONSE: &str = "response";
    pub const EVENT: &str = "event";
}

/// An opaque message envelope.
///
/// Wire shape: `{id, type, payload, timestamp, metadata}` with the timestamp
/// encoded as epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Type tag
    #[serde(rename = "type")]
    pub kind: String,

    /// The text content
    pub payload: String,

    /// Creation time
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    /// Free-form metadata
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl Message {
    /// Create a message with an explicit type tag.
    pub fn new(kind: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            payload: payload.into(),
            timestamp: Utc::now(),
            metadata: Metadata::new(),
        }
    }

    /// Create a request message.
    pub fn request(payload: impl Into<String>) -> Self {
        Self::new(kind::REQUEST, payload)
    }

    /// Create a response message.
    pub fn response(payload: impl Into<String>) -> Self {
        Self::new(kind::RESPONSE, payload)
    }

    /// Builder-style metadata insertion.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    /// A fresh message with a new payload that keeps this message's type and
    /// metadata. Used when a pattern re-derives input for the next hop.
    pub fn derive(&self, payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: self.kind.clone(),
            payload: payload.into(),
            timestamp: Utc::now(),
            metadata: self.metadata.clone(),
        }
    }

    /// Timestamp as epoch milliseconds, as it appears on the wire.
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}
