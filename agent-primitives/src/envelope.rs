//! Message envelope exchanged between agents.
//!
//! The envelope is a self-describing JSON object. Field names and their order
//! are part of the wire contract and match what every peer on the fabric
//! emits:
//!
//! ```json
//! {"message_type": "request", "from_agent": "Planner", "to_agent": "Weather Bot",
//!  "content": "forecast?", "metadata": {}, "timestamp": "2025-01-31T09:15:02.318220",
//!  "message_id": "6f1c...", "in_reply_to": null, "priority": 3}
//! ```
//!
//! Unknown fields are ignored on decode so newer peers can extend the format.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::clock::{now_iso8601, parse_iso8601};
use crate::Error;

/// Kind of envelope, which decides how a receiver routes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Work sent to another agent.
    Request,
    /// Answer correlated to an earlier request.
    Response,
    /// Transfer of task ownership.
    Handoff,
    /// Presence change or broadcast.
    Announcement,
    /// Periodic liveness signal.
    Heartbeat,
}

impl MessageType {
    /// Returns the wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Handoff => "handoff",
            Self::Announcement => "announcement",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory priority from 1 (highest) to 5 (lowest).
///
/// The transport does not reorder by priority; receivers may.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    /// Highest priority.
    pub const HIGHEST: Self = Self(1);
    /// Priority used for handoffs.
    pub const HANDOFF: Self = Self(2);
    /// Default priority.
    pub const NORMAL: Self = Self(3);
    /// Lowest priority.
    pub const LOWEST: Self = Self(5);

    /// Creates a priority after checking its range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPriority`] for values outside `1..=5`.
    pub fn new(value: u8) -> crate::Result<Self> {
        if (1..=5).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::InvalidPriority(value))
        }
    }

    /// Creates a priority, clamping `value` into `1..=5`.
    #[must_use]
    pub fn clamped(value: i64) -> Self {
        // Clamped into 1..=5, so the cast is exact.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let value = value.clamp(1, 5) as u8;
        Self(value)
    }

    /// Returns the numeric value.
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl TryFrom<u8> for Priority {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.0
    }
}

/// Unit of communication between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Routing kind.
    pub message_type: MessageType,
    /// Sender identity.
    pub from_agent: String,
    /// Recipient identity; `None` for broadcasts.
    #[serde(default)]
    pub to_agent: Option<String>,
    /// Free-form text payload.
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: String,
    /// Auxiliary JSON data.
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Map<String, Value>,
    /// Creation time set by the sender.
    #[serde(default = "now_iso8601", deserialize_with = "null_as_now")]
    pub timestamp: String,
    /// Sender-generated identifier, required when a reply may follow.
    #[serde(default)]
    pub message_id: Option<String>,
    /// Identifier of the envelope this one answers.
    #[serde(default)]
    pub in_reply_to: Option<String>,
    /// Advisory priority.
    #[serde(default, deserialize_with = "lenient_priority")]
    pub priority: Priority,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

fn null_as_now<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(|value| value.unwrap_or_else(now_iso8601))
}

// Null, textual and out-of-range priorities decode to a valid `Priority`.
#[allow(clippy::cast_possible_truncation)]
fn lenient_priority<'de, D>(deserializer: D) -> Result<Priority, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    let priority = match value {
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64))
            .map_or_else(Priority::default, Priority::clamped),
        Some(Value::String(text)) => text
            .trim()
            .parse::<i64>()
            .map_or_else(|_| Priority::default(), Priority::clamped),
        _ => Priority::default(),
    };
    Ok(priority)
}

impl MessageEnvelope {
    /// Creates an envelope stamped with the current time and default priority.
    #[must_use]
    pub fn new(message_type: MessageType, from_agent: impl Into<String>) -> Self {
        Self {
            message_type,
            from_agent: from_agent.into(),
            to_agent: None,
            content: String::new(),
            metadata: Map::new(),
            timestamp: now_iso8601(),
            message_id: None,
            in_reply_to: None,
            priority: Priority::default(),
        }
    }

    /// Creates a `request` envelope with a fresh message id.
    #[must_use]
    pub fn request(
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(MessageType::Request, from_agent)
            .with_recipient(to_agent)
            .with_content(content)
            .with_fresh_id()
    }

    /// Creates a `handoff` envelope with a fresh message id and handoff priority.
    #[must_use]
    pub fn handoff(
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(MessageType::Handoff, from_agent)
            .with_recipient(to_agent)
            .with_content(content)
            .with_fresh_id()
            .with_priority(Priority::HANDOFF)
    }

    /// Creates a broadcast `announcement` envelope.
    #[must_use]
    pub fn announcement(from_agent: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(MessageType::Announcement, from_agent).with_content(content)
    }

    /// Creates a `heartbeat` envelope.
    #[must_use]
    pub fn heartbeat(from_agent: impl Into<String>) -> Self {
        Self::new(MessageType::Heartbeat, from_agent)
    }

    /// Creates a `response` answering `request`.
    ///
    /// The reply is addressed to the request's sender and carries the request's
    /// `message_id` in `in_reply_to`.
    #[must_use]
    pub fn reply_to(
        request: &Self,
        from_agent: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut reply = Self::new(MessageType::Response, from_agent)
            .with_recipient(request.from_agent.clone())
            .with_content(content)
            .with_fresh_id();
        reply.in_reply_to.clone_from(&request.message_id);
        reply
    }

    /// Sets the recipient.
    #[must_use]
    pub fn with_recipient(mut self, to_agent: impl Into<String>) -> Self {
        self.to_agent = Some(to_agent.into());
        self
    }

    /// Sets the text payload.
    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Replaces the metadata map.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Inserts a single metadata entry.
    #[must_use]
    pub fn with_metadata_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Assigns a freshly generated UUID as the message id.
    #[must_use]
    pub fn with_fresh_id(mut self) -> Self {
        self.message_id = Some(Uuid::new_v4().to_string());
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Returns `true` when the envelope has no specific recipient.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.to_agent.is_none()
    }

    /// Returns a metadata value as a string slice, if present and textual.
    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Parses the sender timestamp.
    #[must_use]
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        parse_iso8601(&self.timestamp)
    }

    /// Serializes the envelope into UTF-8 JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encode`] if a metadata value cannot be rendered.
    pub fn to_bytes(&self) -> crate::Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|source| Error::Encode { source })
    }

    /// Decodes an envelope from UTF-8 JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedEnvelope`] when the payload is not JSON, lacks
    /// `message_type` or `from_agent`, or carries values of the wrong shape.
    pub fn from_bytes(payload: &[u8]) -> crate::Result<Self> {
        let envelope: Self =
            serde_json::from_slice(payload).map_err(|err| Error::malformed(err.to_string()))?;
        if envelope.from_agent.trim().is_empty() {
            return Err(Error::malformed("from_agent cannot be empty"));
        }
        Ok(envelope)
    }
}
