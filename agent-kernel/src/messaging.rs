//! The four communication primitives: direct message, broadcast,
//! request/response, and handoff.

use std::time::Duration;

use agent_config::ConfigError;
use agent_primitives::{AgentName, MessageEnvelope, MessageType, channels};
use agent_transport::{SessionState, TransportError, TransportSession};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::SchedulerError;

/// Errors surfaced by the messaging client and its primitives.
#[derive(Debug, Error)]
pub enum MessagingError {
    /// The transport rejected the operation.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// An envelope could not be encoded or decoded.
    #[error(transparent)]
    Envelope(#[from] agent_primitives::Error),
    /// Configuration could not be loaded or was invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A background task could not be started.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    /// The client has not connected yet, or was disconnected.
    #[error("messaging client is not connected")]
    NotConnected,
    /// `connect` was called on a client that is already connected.
    #[error("messaging client is already connected")]
    AlreadyConnected,
    /// The client was assembled with unusable settings.
    #[error("invalid messaging configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Result alias for messaging operations.
pub type MessagingResult<T> = Result<T, MessagingError>;

/// Cheap handle exposing the communication primitives of one agent.
///
/// Obtained from [`MessagingClient::messenger`](crate::MessagingClient::messenger);
/// clones share the agent's transport session.
#[derive(Debug, Clone)]
pub struct Messenger {
    identity: AgentName,
    session: TransportSession,
    request_timeout: Duration,
}

impl Messenger {
    /// Creates a messenger publishing as `identity` through `session`.
    #[must_use]
    pub fn new(identity: AgentName, session: TransportSession, request_timeout: Duration) -> Self {
        Self {
            identity,
            session,
            request_timeout,
        }
    }

    /// Returns the sending agent's identity.
    #[must_use]
    pub fn identity(&self) -> &AgentName {
        &self.identity
    }

    /// Returns the timeout used by [`request_from_agent`](Self::request_from_agent)
    /// when none is given.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Sends a `request` envelope to `to_agent`'s direct channel without
    /// waiting for a reply. Returns the envelope's message id.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::NotConnected`] before connect or after
    /// disconnect, or the transport's publish error.
    pub async fn send_direct_message(
        &self,
        to_agent: &str,
        content: impl Into<String>,
        metadata: Option<Map<String, Value>>,
    ) -> MessagingResult<String> {
        let envelope = MessageEnvelope::request(self.identity.as_str(), to_agent, content)
            .with_metadata(metadata.unwrap_or_default());
        self.publish_envelope(&channels::direct_channel(to_agent), &envelope)
            .await?;
        info!(agent = %self.identity, to = to_agent, "sent direct message");
        Ok(envelope.message_id.unwrap_or_default())
    }

    /// Publishes an `announcement` envelope on the all-agents channel.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::NotConnected`] before connect or after
    /// disconnect, or the transport's publish error.
    pub async fn broadcast_message(
        &self,
        content: impl Into<String>,
        metadata: Option<Map<String, Value>>,
    ) -> MessagingResult<()> {
        let envelope = MessageEnvelope::announcement(self.identity.as_str(), content)
            .with_fresh_id()
            .with_metadata(metadata.unwrap_or_default());
        self.publish_envelope(channels::all_agents_channel(), &envelope)
            .await?;
        info!(agent = %self.identity, "broadcast message");
        Ok(())
    }

    /// Asks `to_agent` a question and waits for its answer.
    ///
    /// Returns `Ok(None)` when nobody answers within `timeout` (or the default
    /// request timeout); an unresponsive peer is an expected outcome. A reply
    /// that is not a `response` to this request's id also yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Envelope`] when the reply cannot be decoded,
    /// [`MessagingError::NotConnected`] when the client is not connected, or
    /// any other transport error.
    pub async fn request_from_agent(
        &self,
        to_agent: &str,
        content: impl Into<String>,
        timeout: Option<Duration>,
    ) -> MessagingResult<Option<String>> {
        self.ensure_connected()?;
        let timeout = timeout.unwrap_or(self.request_timeout);
        let envelope = MessageEnvelope::request(self.identity.as_str(), to_agent, content);
        let channel = channels::request_channel(to_agent);

        let payload = match self
            .session
            .request(&channel, envelope.to_bytes()?, timeout)
            .await
        {
            Ok(payload) => payload,
            Err(err) if err.is_unanswered() => {
                warn!(agent = %self.identity, to = to_agent, ?timeout, %err, "request went unanswered");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let reply = MessageEnvelope::from_bytes(&payload)?;
        if reply.message_type != MessageType::Response || reply.in_reply_to != envelope.message_id
        {
            warn!(
                agent = %self.identity,
                from = %reply.from_agent,
                message_type = %reply.message_type,
                in_reply_to = ?reply.in_reply_to,
                "discarding reply not correlated with the request"
            );
            return Ok(None);
        }
        debug!(agent = %self.identity, from = %reply.from_agent, "received reply");
        Ok(Some(reply.content))
    }

    /// Hands a task over to `to_agent`.
    ///
    /// The `handoff` envelope (priority 2) is published on the target's
    /// direct channel, which triggers its kickoff processing, and on the
    /// `from -> to` handoff channel for observers. Both copies share one
    /// message id, which is returned.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::NotConnected`] before connect or after
    /// disconnect, or the transport's publish error.
    pub async fn handoff_to_agent(
        &self,
        to_agent: &str,
        content: impl Into<String>,
        metadata: Option<Map<String, Value>>,
    ) -> MessagingResult<String> {
        let envelope = MessageEnvelope::handoff(self.identity.as_str(), to_agent, content)
            .with_metadata(metadata.unwrap_or_default());
        self.publish_envelope(&channels::direct_channel(to_agent), &envelope)
            .await?;
        self.publish_envelope(
            &channels::handoff_channel(self.identity.as_str(), to_agent),
            &envelope,
        )
        .await?;
        info!(agent = %self.identity, to = to_agent, "handed off task");
        Ok(envelope.message_id.unwrap_or_default())
    }

    pub(crate) async fn publish_envelope(
        &self,
        channel: &str,
        envelope: &MessageEnvelope,
    ) -> MessagingResult<()> {
        self.ensure_connected()?;
        self.session.publish(channel, envelope.to_bytes()?).await?;
        Ok(())
    }

    fn ensure_connected(&self) -> MessagingResult<()> {
        match self.session.state() {
            SessionState::Disconnected | SessionState::Connecting | SessionState::Closed => {
                Err(MessagingError::NotConnected)
            }
            SessionState::Connected | SessionState::Reconnecting => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use agent_transport::{InboundMessage, MemoryBroker, MessageHandler, TransportConfig};
    use async_trait::async_trait;

    /// Answers every request with a response pointing at `in_reply_to`, or at
    /// the request itself when unset.
    struct Answer {
        session: TransportSession,
        in_reply_to: Option<&'static str>,
    }

    #[async_trait]
    impl MessageHandler for Answer {
        async fn handle(&self, message: InboundMessage) {
            let request = MessageEnvelope::from_bytes(message.payload()).unwrap();
            let mut reply = MessageEnvelope::reply_to(&request, "Oracle", "42");
            if let Some(other) = self.in_reply_to {
                reply.in_reply_to = Some(other.to_owned());
            }
            let reply_to = message.reply().unwrap();
            self.session
                .publish(reply_to, reply.to_bytes().unwrap())
                .await
                .unwrap();
        }
    }

    async fn messenger_with_oracle(in_reply_to: Option<&'static str>) -> Messenger {
        let broker = MemoryBroker::new();
        let session = TransportSession::new(broker.connector(), TransportConfig::new("memory://"));
        session.connect().await.unwrap();
        session
            .subscribe(
                &channels::request_channel("Oracle"),
                Arc::new(Answer {
                    session: session.clone(),
                    in_reply_to,
                }),
            )
            .await
            .unwrap();
        Messenger::new(
            AgentName::new("Asker").unwrap(),
            session,
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn correlated_reply_is_returned() {
        let messenger = messenger_with_oracle(None).await;
        let answer = messenger
            .request_from_agent("Oracle", "meaning of life?", None)
            .await
            .unwrap();
        assert_eq!(answer.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn reply_to_another_request_is_discarded() {
        let messenger = messenger_with_oracle(Some("some-other-request")).await;
        let answer = messenger
            .request_from_agent("Oracle", "meaning of life?", None)
            .await
            .unwrap();
        assert_eq!(answer, None);
    }

    #[tokio::test]
    async fn primitives_require_a_live_session() {
        let broker = MemoryBroker::new();
        let session = TransportSession::new(broker.connector(), TransportConfig::new("memory://"));
        let messenger = Messenger::new(AgentName::new("Asker").unwrap(), session, Duration::from_secs(1));
        let err = messenger
            .broadcast_message("hello", None)
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::NotConnected));
    }
}
