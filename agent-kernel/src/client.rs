//! Composition entry point tying an agent's behavior to the mesh.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use agent_config::MessagingConfig;
use agent_primitives::{AgentMetadata, AgentName, channels};
use agent_transport::{Connector, SubscriptionHandle, TransportConfig, TransportSession};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    AgentBehavior, ChannelKind, Dispatcher, MeshObserver, MessagingError, MessagingResult,
    Messenger, PeerRegistry, PresenceManager, SchedulerConfig, TaskScheduler,
};

/// Builder for [`MessagingClient`].
#[must_use]
pub struct MessagingClientBuilder {
    identity: AgentName,
    behavior: Arc<dyn AgentBehavior>,
    tools: Vec<String>,
    model: Option<String>,
    version: Option<String>,
    observer: Option<Arc<dyn MeshObserver>>,
    connector: Option<Arc<dyn Connector>>,
    config: MessagingConfig,
    scheduler: SchedulerConfig,
    completion_replies: bool,
}

impl fmt::Debug for MessagingClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagingClientBuilder")
            .field("identity", &self.identity)
            .field("tools", &self.tools)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MessagingClientBuilder {
    /// Sets the tool names advertised in the agent's metadata.
    pub fn tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the model identifier advertised in the agent's metadata.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the semantic version advertised in the agent's metadata.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Installs an observer for announcements and completion notices.
    pub fn observer(mut self, observer: Arc<dyn MeshObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Overrides the transport connector. Defaults to NATS.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Replaces the messaging configuration.
    pub fn config(mut self, config: MessagingConfig) -> Self {
        self.config = config;
        self
    }

    /// Bounds how many kickoff tasks run at once.
    pub const fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    /// Enables or disables completion replies after kickoffs. Enabled by default.
    pub const fn completion_replies(mut self, enabled: bool) -> Self {
        self.completion_replies = enabled;
        self
    }

    /// Finalises the client.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Config`] for an invalid configuration,
    /// [`MessagingError::Envelope`] for an empty version, and
    /// [`MessagingError::InvalidConfig`] when no connector is available.
    pub fn build(self) -> MessagingResult<MessagingClient> {
        self.config.validate()?;

        let mut metadata = AgentMetadata::builder(&self.identity).tools(self.tools);
        if let Some(model) = self.model {
            metadata = metadata.model(model);
        }
        if let Some(version) = self.version {
            metadata = metadata.version(version)?;
        }

        let connector = match self.connector {
            Some(connector) => connector,
            None => default_connector()?,
        };
        let session = TransportSession::new(connector, TransportConfig::from(&self.config));
        let peers =
            PeerRegistry::from_heartbeats(self.config.heartbeat_interval(), self.config.missed_heartbeats());
        let messenger = Messenger::new(
            self.identity.clone(),
            session.clone(),
            self.config.request_timeout(),
        );

        Ok(MessagingClient {
            identity: self.identity,
            behavior: self.behavior,
            observer: self.observer,
            template: metadata.build(),
            config: self.config,
            completion_replies: self.completion_replies,
            scheduler: TaskScheduler::new(self.scheduler),
            session,
            peers,
            messenger,
            connection: Mutex::new(Connection::Idle),
        })
    }
}

#[cfg(feature = "nats")]
#[allow(clippy::unnecessary_wraps)]
fn default_connector() -> MessagingResult<Arc<dyn Connector>> {
    Ok(agent_transport::NatsConnector::shared())
}

#[cfg(not(feature = "nats"))]
fn default_connector() -> MessagingResult<Arc<dyn Connector>> {
    Err(MessagingError::InvalidConfig(
        "no transport connector configured",
    ))
}

enum Connection {
    Idle,
    Connected {
        presence: PresenceManager,
        subscriptions: Vec<SubscriptionHandle>,
    },
    Closed,
}

/// An agent's membership in the mesh.
///
/// Owns one transport session. [`connect`](Self::connect) subscribes to the
/// agent's channels, announces it, and starts the heartbeat;
/// [`disconnect`](Self::disconnect) undoes all of that. A client connects
/// once: after disconnecting, build a new one.
pub struct MessagingClient {
    identity: AgentName,
    behavior: Arc<dyn AgentBehavior>,
    observer: Option<Arc<dyn MeshObserver>>,
    template: AgentMetadata,
    config: MessagingConfig,
    completion_replies: bool,
    scheduler: TaskScheduler,
    session: TransportSession,
    peers: PeerRegistry,
    messenger: Messenger,
    connection: Mutex<Connection>,
}

impl fmt::Debug for MessagingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagingClient")
            .field("identity", &self.identity)
            .field("session", &self.session)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl MessagingClient {
    /// Starts building a client for `identity` driven by `behavior`.
    pub fn builder(identity: AgentName, behavior: Arc<dyn AgentBehavior>) -> MessagingClientBuilder {
        MessagingClientBuilder {
            identity,
            behavior,
            tools: Vec::new(),
            model: None,
            version: None,
            observer: None,
            connector: None,
            config: MessagingConfig::default(),
            scheduler: SchedulerConfig::default(),
            completion_replies: true,
        }
    }

    /// Returns the agent's identity.
    #[must_use]
    pub fn identity(&self) -> &AgentName {
        &self.identity
    }

    /// Returns the messaging configuration.
    #[must_use]
    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    /// Returns the transport session.
    #[must_use]
    pub fn session(&self) -> &TransportSession {
        &self.session
    }

    /// Returns the registry of peers seen on the all-agents channel.
    #[must_use]
    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    /// Returns the scheduler owning the agent's background tasks.
    #[must_use]
    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Returns a handle exposing the communication primitives.
    #[must_use]
    pub fn messenger(&self) -> Messenger {
        self.messenger.clone()
    }

    /// Returns `true` between a successful connect and disconnect, unless the
    /// transport was lost in between.
    pub async fn is_connected(&self) -> bool {
        matches!(*self.connection.lock().await, Connection::Connected { .. })
            && !self.session.state().is_terminal()
    }

    /// Returns the live metadata snapshot while connected.
    pub async fn metadata(&self) -> Option<AgentMetadata> {
        match &*self.connection.lock().await {
            Connection::Connected { presence, .. } => Some(presence.metadata()),
            Connection::Idle | Connection::Closed => None,
        }
    }

    /// Joins the mesh.
    ///
    /// Opens the transport session, subscribes to the all-agents, direct, and
    /// request channels, announces the agent with `capabilities` and
    /// `description`, and starts the heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::AlreadyConnected`] on a second call, the
    /// transport error when the server is unreachable or a subscription fails,
    /// and the publish error when the announcement cannot be sent. On error
    /// the session is closed again.
    pub async fn connect(
        &self,
        capabilities: Vec<String>,
        description: impl Into<String>,
    ) -> MessagingResult<()> {
        let mut connection = self.connection.lock().await;
        match *connection {
            Connection::Connected { .. } => return Err(MessagingError::AlreadyConnected),
            Connection::Closed => return Err(MessagingError::NotConnected),
            Connection::Idle => {}
        }

        self.session.connect().await?;
        match self.join(capabilities, description.into()).await {
            Ok(joined) => {
                *connection = joined;
                info!(
                    agent = %self.identity,
                    server = %self.config.server_address(),
                    "connected to messaging fabric"
                );
                Ok(())
            }
            Err(err) => {
                self.scheduler.shutdown();
                if let Err(close_err) = self.session.close().await {
                    warn!(agent = %self.identity, %close_err, "failed to close session after connect error");
                }
                *connection = Connection::Closed;
                Err(err)
            }
        }
    }

    async fn join(&self, capabilities: Vec<String>, description: String) -> MessagingResult<Connection> {
        let metadata = AgentMetadata::builder(&self.identity)
            .description(description)
            .capabilities(capabilities)
            .tools(self.template.tools().to_vec())
            .model(self.template.model())
            .version(self.template.version())?
            .build();

        let dispatcher = Dispatcher::new(
            self.identity.clone(),
            Arc::clone(&self.behavior),
            self.session.clone(),
            self.scheduler.clone(),
            self.peers.clone(),
        )
        .with_observer(self.observer.clone())
        .with_completion_replies(self.completion_replies);

        let name = self.identity.as_str();
        let mut subscriptions = Vec::with_capacity(3);
        for (channel, kind) in [
            (channels::all_agents_channel().to_owned(), ChannelKind::AllAgents),
            (channels::direct_channel(name), ChannelKind::Direct),
            (channels::request_channel(name), ChannelKind::Request),
        ] {
            let handle = self
                .session
                .subscribe(&channel, dispatcher.channel_handler(kind))
                .await?;
            info!(agent = %self.identity, channel = %channel, "subscribed");
            subscriptions.push(handle);
        }

        let presence = PresenceManager::new(
            self.identity.clone(),
            self.session.clone(),
            metadata,
            self.peers.clone(),
            self.config.heartbeat_interval(),
        );
        presence.watch_session(&self.scheduler)?;
        presence.announce().await?;
        presence.start_heartbeat(&self.scheduler)?;

        Ok(Connection::Connected {
            presence,
            subscriptions,
        })
    }

    /// Leaves the mesh.
    ///
    /// Publishes a going-offline announcement (best-effort), cancels every
    /// background task, and closes the transport session. Calling it again,
    /// or before connecting, does nothing.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the session fails to close.
    pub async fn disconnect(&self) -> MessagingResult<()> {
        let mut connection = self.connection.lock().await;
        let Connection::Connected {
            presence,
            subscriptions,
        } = std::mem::replace(&mut *connection, Connection::Closed)
        else {
            return Ok(());
        };

        if let Err(err) = presence.announce_offline().await {
            warn!(agent = %self.identity, %err, "offline announcement failed");
        }
        self.scheduler.shutdown();
        for handle in subscriptions {
            self.session.unsubscribe(handle);
        }
        self.session.close().await?;
        info!(agent = %self.identity, "disconnected from messaging fabric");
        Ok(())
    }

    /// See [`Messenger::send_direct_message`].
    ///
    /// # Errors
    ///
    /// Same as [`Messenger::send_direct_message`].
    pub async fn send_direct_message(
        &self,
        to_agent: &str,
        content: impl Into<String>,
        metadata: Option<Map<String, Value>>,
    ) -> MessagingResult<String> {
        self.messenger
            .send_direct_message(to_agent, content, metadata)
            .await
    }

    /// See [`Messenger::broadcast_message`].
    ///
    /// # Errors
    ///
    /// Same as [`Messenger::broadcast_message`].
    pub async fn broadcast_message(
        &self,
        content: impl Into<String>,
        metadata: Option<Map<String, Value>>,
    ) -> MessagingResult<()> {
        self.messenger.broadcast_message(content, metadata).await
    }

    /// See [`Messenger::request_from_agent`].
    ///
    /// # Errors
    ///
    /// Same as [`Messenger::request_from_agent`].
    pub async fn request_from_agent(
        &self,
        to_agent: &str,
        content: impl Into<String>,
        timeout: Option<Duration>,
    ) -> MessagingResult<Option<String>> {
        self.messenger
            .request_from_agent(to_agent, content, timeout)
            .await
    }

    /// See [`Messenger::handoff_to_agent`].
    ///
    /// # Errors
    ///
    /// Same as [`Messenger::handoff_to_agent`].
    pub async fn handoff_to_agent(
        &self,
        to_agent: &str,
        content: impl Into<String>,
        metadata: Option<Map<String, Value>>,
    ) -> MessagingResult<String> {
        self.messenger
            .handoff_to_agent(to_agent, content, metadata)
            .await
    }
}
