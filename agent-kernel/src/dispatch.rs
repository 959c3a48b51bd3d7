//! Routing of inbound envelopes to the owning agent's behavior.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use agent_primitives::{AgentName, MessageEnvelope, MessageType, channels};
use agent_transport::{InboundMessage, MessageHandler, TransportSession};
use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{PeerRegistry, TaskScheduler};

/// Failure reported by an [`AgentBehavior`] callback.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BehaviorError {
    /// The callback returned an error.
    #[error("{0}")]
    Failed(String),
    /// The callback panicked.
    #[error("callback panicked: {0}")]
    Panicked(String),
}

impl BehaviorError {
    /// Creates a [`BehaviorError::Failed`] from a string-like value.
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// Result alias for behavior callbacks.
pub type BehaviorResult<T = String> = Result<T, BehaviorError>;

/// Decision logic plugged into a messaging client.
#[async_trait]
pub trait AgentBehavior: Send + Sync + 'static {
    /// Answers a request arriving on the agent's request channel.
    ///
    /// Runs on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// A failure is reported back to the requester as an error reply.
    fn handle_request(&self, content: &str) -> BehaviorResult;

    /// Processes a task kicked off through the agent's direct channel.
    ///
    /// # Errors
    ///
    /// A failure is logged; no completion reply is sent.
    async fn handle_kickoff(&self, content: &str) -> BehaviorResult;
}

/// Optional hooks for presence and completion traffic.
#[async_trait]
pub trait MeshObserver: Send + Sync {
    /// Called for each announcement from another agent.
    async fn on_announcement(&self, envelope: &MessageEnvelope) {
        let _ = envelope;
    }

    /// Called for each `response` envelope on the direct channel, typically a
    /// kickoff completion notice.
    async fn on_completion(&self, envelope: &MessageEnvelope) {
        let _ = envelope;
    }
}

/// Subscription an inbound message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// The shared all-agents channel.
    AllAgents,
    /// The agent's direct channel.
    Direct,
    /// The agent's request channel.
    Request,
}

/// Routes decoded envelopes for one agent.
#[derive(Clone)]
pub struct Dispatcher {
    identity: AgentName,
    behavior: Arc<dyn AgentBehavior>,
    observer: Option<Arc<dyn MeshObserver>>,
    session: TransportSession,
    scheduler: TaskScheduler,
    peers: PeerRegistry,
    completion_replies: bool,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("identity", &self.identity)
            .field("observer", &self.observer.is_some())
            .field("completion_replies", &self.completion_replies)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher with completion replies enabled and no observer.
    #[must_use]
    pub fn new(
        identity: AgentName,
        behavior: Arc<dyn AgentBehavior>,
        session: TransportSession,
        scheduler: TaskScheduler,
        peers: PeerRegistry,
    ) -> Self {
        Self {
            identity,
            behavior,
            observer: None,
            session,
            scheduler,
            peers,
            completion_replies: true,
        }
    }

    /// Attaches an observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Option<Arc<dyn MeshObserver>>) -> Self {
        self.observer = observer;
        self
    }

    /// Enables or disables kickoff completion replies.
    #[must_use]
    pub const fn with_completion_replies(mut self, enabled: bool) -> Self {
        self.completion_replies = enabled;
        self
    }

    /// Returns a subscription handler feeding `kind` traffic into this
    /// dispatcher.
    #[must_use]
    pub fn channel_handler(&self, kind: ChannelKind) -> Arc<dyn MessageHandler> {
        Arc::new(ChannelHandler {
            dispatcher: self.clone(),
            kind,
        })
    }

    /// Handles an envelope from the all-agents channel.
    ///
    /// Announcements reach the peer registry and the observer; heartbeats
    /// refresh the peer registry. The agent's own traffic and other message
    /// types are ignored.
    pub async fn on_all_agents(&self, envelope: MessageEnvelope) {
        if self.identity.is(&envelope.from_agent) {
            return;
        }
        match envelope.message_type {
            MessageType::Announcement => {
                debug!(agent = %self.identity, from = %envelope.from_agent, "announcement received");
                self.peers.record_announcement(&envelope);
                if let Some(observer) = &self.observer {
                    observer.on_announcement(&envelope).await;
                }
            }
            MessageType::Heartbeat => self.peers.record_heartbeat(&envelope),
            other => {
                debug!(agent = %self.identity, message_type = %other, "ignoring message on all-agents channel");
            }
        }
    }

    /// Handles an envelope from the direct channel.
    ///
    /// Requests and handoffs start a kickoff task without blocking the
    /// subscription; responses go to the observer.
    pub async fn on_direct(&self, envelope: MessageEnvelope) {
        match envelope.message_type {
            MessageType::Request | MessageType::Handoff => self.spawn_kickoff(envelope),
            MessageType::Response => {
                info!(
                    agent = %self.identity,
                    from = %envelope.from_agent,
                    status = envelope.metadata_str("status").unwrap_or("unknown"),
                    "completion received"
                );
                if let Some(observer) = &self.observer {
                    observer.on_completion(&envelope).await;
                }
            }
            other => {
                debug!(agent = %self.identity, message_type = %other, "ignoring message on direct channel");
            }
        }
    }

    /// Handles an envelope from the request channel and publishes the answer
    /// to `reply`, the transport-provided reply address.
    ///
    /// A failing or panicking callback still produces a reply whose content
    /// starts with `error:`.
    pub async fn on_request(&self, envelope: MessageEnvelope, reply: Option<&str>) {
        let Some(reply) = reply else {
            warn!(agent = %self.identity, from = %envelope.from_agent, "request without reply address dropped");
            return;
        };

        let behavior = Arc::clone(&self.behavior);
        let content = envelope.content.clone();
        let outcome = match tokio::task::spawn_blocking(move || behavior.handle_request(&content))
            .await
        {
            Ok(result) => result,
            Err(join) if join.is_panic() => {
                Err(BehaviorError::Panicked(panic_message(join.into_panic().as_ref())))
            }
            Err(join) => Err(BehaviorError::failed(join.to_string())),
        };

        let response = match outcome {
            Ok(answer) => MessageEnvelope::reply_to(&envelope, self.identity.as_str(), answer),
            Err(err) => {
                error!(agent = %self.identity, from = %envelope.from_agent, %err, "request handler failed");
                MessageEnvelope::reply_to(&envelope, self.identity.as_str(), format!("error: {err}"))
                    .with_metadata_entry("status", "error")
                    .with_metadata_entry("error", err.to_string())
            }
        }
        .with_metadata_entry("original_request", envelope.content.clone());

        match response.to_bytes() {
            Ok(payload) => {
                if let Err(err) = self.session.publish(reply, payload).await {
                    warn!(agent = %self.identity, %err, "failed to publish reply");
                } else {
                    debug!(agent = %self.identity, to = %envelope.from_agent, "reply sent");
                }
            }
            Err(err) => error!(agent = %self.identity, %err, "failed to encode reply"),
        }
    }

    fn spawn_kickoff(&self, envelope: MessageEnvelope) {
        let dispatcher = self.clone();
        let spawned = self
            .scheduler
            .spawn_bounded("kickoff", async move { dispatcher.run_kickoff(envelope).await });
        if let Err(err) = spawned {
            warn!(agent = %self.identity, %err, "kickoff rejected");
        }
    }

    async fn run_kickoff(&self, envelope: MessageEnvelope) {
        info!(
            agent = %self.identity,
            from = %envelope.from_agent,
            message_type = %envelope.message_type,
            "kicking off task"
        );
        let result = AssertUnwindSafe(self.behavior.handle_kickoff(&envelope.content))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(BehaviorError::Panicked(panic_message(panic.as_ref()))));

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                error!(agent = %self.identity, from = %envelope.from_agent, %err, "kickoff failed");
                return;
            }
        };
        info!(agent = %self.identity, from = %envelope.from_agent, "kickoff completed");

        if !self.completion_replies {
            return;
        }
        let completion = MessageEnvelope::reply_to(&envelope, self.identity.as_str(), output)
            .with_metadata_entry("status", "completed");
        let channel = channels::direct_channel(&envelope.from_agent);
        let published = match completion.to_bytes() {
            Ok(payload) => self.session.publish(&channel, payload).await.map_err(|e| e.to_string()),
            Err(err) => Err(err.to_string()),
        };
        if let Err(err) = published {
            warn!(agent = %self.identity, channel = %channel, %err, "failed to send completion");
        }
    }
}

struct ChannelHandler {
    dispatcher: Dispatcher,
    kind: ChannelKind,
}

#[async_trait]
impl MessageHandler for ChannelHandler {
    async fn handle(&self, message: InboundMessage) {
        let envelope = match MessageEnvelope::from_bytes(message.payload()) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(
                    agent = %self.dispatcher.identity,
                    channel = message.subject(),
                    %err,
                    "dropping malformed envelope"
                );
                return;
            }
        };

        match self.kind {
            ChannelKind::AllAgents => self.dispatcher.on_all_agents(envelope).await,
            ChannelKind::Direct => self.dispatcher.on_direct(envelope).await,
            ChannelKind::Request => self.dispatcher.on_request(envelope, message.reply()).await,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|text| (*text).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}
