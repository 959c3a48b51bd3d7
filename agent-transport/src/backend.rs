//! Traits implemented by pub/sub backends and subscription handlers.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::{TransportConfig, TransportResult};

/// Message delivered to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    subject: String,
    payload: Bytes,
    reply: Option<String>,
}

impl InboundMessage {
    /// Creates an inbound message.
    #[must_use]
    pub fn new(subject: impl Into<String>, payload: Bytes, reply: Option<String>) -> Self {
        Self {
            subject: subject.into(),
            payload,
            reply,
        }
    }

    /// Returns the subject the message was published on.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Returns the raw payload.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Returns the transport-generated reply address, when the sender expects
    /// an answer.
    #[must_use]
    pub fn reply(&self) -> Option<&str> {
        self.reply.as_deref()
    }
}

/// Stream of messages for one subscription. Dropping it unsubscribes.
pub type MessageStream = BoxStream<'static, InboundMessage>;

/// Out-of-band signals raised by a backend about its link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link to the server dropped.
    Lost {
        /// Human-readable context.
        reason: String,
    },
    /// A backend that reconnects on its own restored the link.
    Restored,
    /// A backend that reconnects on its own gave up.
    Exhausted {
        /// Human-readable context.
        reason: String,
    },
}

/// An established backend together with its link event feed.
pub struct Link {
    /// The connected backend.
    pub backend: std::sync::Arc<dyn Backend>,
    /// Link events raised by the backend for the lifetime of the connection.
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens connections to a pub/sub server.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects using the supplied configuration.
    ///
    /// The session enforces the connect timeout around this call.
    async fn connect(&self, config: &TransportConfig) -> TransportResult<Link>;
}

/// A live connection to a pub/sub server.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Publishes `payload` on `subject` without waiting for delivery.
    async fn publish(&self, subject: &str, payload: Bytes) -> TransportResult<()>;

    /// Subscribes to `subject`, which may contain `*` and `>` wildcards.
    async fn subscribe(&self, subject: &str) -> TransportResult<MessageStream>;

    /// Publishes `payload` with an ephemeral reply address and waits for the
    /// first reply.
    ///
    /// The reply subscription must be released on every exit path.
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> TransportResult<Bytes>;

    /// Waits until previously published messages have reached the server.
    async fn flush(&self) -> TransportResult<()>;

    /// Makes one attempt to restore a dropped link.
    ///
    /// Not called for backends that [reconnect on their own](Self::reconnects_itself).
    async fn reconnect(&self) -> TransportResult<()>;

    /// Returns `true` when the backend runs its own reconnect loop and reports
    /// the outcome with [`LinkEvent::Restored`] or [`LinkEvent::Exhausted`].
    fn reconnects_itself(&self) -> bool {
        false
    }

    /// Releases the connection.
    async fn close(&self) -> TransportResult<()> {
        Ok(())
    }
}

/// Callback invoked once per message arriving on a subscription.
///
/// Implementations must not let failures escape: the subscription keeps
/// running regardless of what the handler does with a message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one inbound message.
    async fn handle(&self, message: InboundMessage);
}
