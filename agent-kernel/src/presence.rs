//! Presence announcements and the heartbeat loop.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use agent_primitives::{AgentMetadata, AgentName, AgentStatus, MessageEnvelope, channels};
use agent_transport::{SessionNotice, SessionState, TransportSession};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::{MessagingError, MessagingResult, PeerRegistry, SchedulerResult, TaskHandle, TaskScheduler};

/// Announces an agent on the all-agents channel and keeps its heartbeat going.
///
/// Clones share the same metadata.
#[derive(Clone)]
pub struct PresenceManager {
    identity: AgentName,
    session: TransportSession,
    metadata: Arc<Mutex<AgentMetadata>>,
    peers: PeerRegistry,
    heartbeat_interval: Duration,
}

impl fmt::Debug for PresenceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceManager")
            .field("identity", &self.identity)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish_non_exhaustive()
    }
}

impl PresenceManager {
    /// Creates a presence manager for `identity`.
    #[must_use]
    pub fn new(
        identity: AgentName,
        session: TransportSession,
        metadata: AgentMetadata,
        peers: PeerRegistry,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            identity,
            session,
            metadata: Arc::new(Mutex::new(metadata)),
            peers,
            heartbeat_interval,
        }
    }

    /// Returns a snapshot of the agent's metadata.
    #[must_use]
    pub fn metadata(&self) -> AgentMetadata {
        self.lock_metadata().clone()
    }

    /// Returns the heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Publishes an `announcement` carrying the full metadata snapshot.
    ///
    /// # Errors
    ///
    /// Returns the transport or encoding error when the announcement cannot be
    /// published.
    pub async fn announce(&self) -> MessagingResult<()> {
        let snapshot = self.metadata().to_metadata_map();
        let envelope = MessageEnvelope::announcement(
            self.identity.as_str(),
            format!("Agent '{}' is now online", self.identity),
        )
        .with_fresh_id()
        .with_metadata(snapshot);
        self.publish(&envelope).await?;
        info!(agent = %self.identity, "presence announced");
        Ok(())
    }

    /// Marks the agent offline and publishes a going-offline announcement.
    ///
    /// # Errors
    ///
    /// Returns the transport or encoding error; callers treat it as
    /// best-effort.
    pub async fn announce_offline(&self) -> MessagingResult<()> {
        self.lock_metadata().set_status(AgentStatus::Offline);
        let envelope = MessageEnvelope::announcement(
            self.identity.as_str(),
            format!("Agent '{}' going offline", self.identity),
        )
        .with_fresh_id()
        .with_metadata_entry("status", AgentStatus::Offline.as_str());
        self.publish(&envelope).await?;
        info!(agent = %self.identity, "offline announcement sent");
        Ok(())
    }

    /// Refreshes `last_heartbeat` and publishes one `heartbeat` envelope.
    ///
    /// # Errors
    ///
    /// Returns the transport or encoding error.
    pub async fn heartbeat(&self) -> MessagingResult<()> {
        let snapshot = {
            let mut metadata = self.lock_metadata();
            metadata.touch_heartbeat();
            metadata.to_metadata_map()
        };
        let envelope = MessageEnvelope::heartbeat(self.identity.as_str())
            .with_fresh_id()
            .with_metadata(snapshot);
        self.publish(&envelope).await?;
        debug!(agent = %self.identity, "heartbeat sent");
        Ok(())
    }

    /// Starts the heartbeat loop on `scheduler`.
    ///
    /// Every interval the loop sends a heartbeat and expires silent peers.
    /// Failures are logged and retried on the next tick. The loop ends when
    /// the session closes or the task is aborted.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Closed`](crate::SchedulerError::Closed) after
    /// scheduler shutdown.
    pub fn start_heartbeat(&self, scheduler: &TaskScheduler) -> SchedulerResult<TaskHandle> {
        let presence = self.clone();
        let states = self.session.state_changes();
        scheduler.spawn("heartbeat", async move { presence.run_heartbeat(states).await })
    }

    /// Starts a task that re-announces presence after each reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Closed`](crate::SchedulerError::Closed) after
    /// scheduler shutdown.
    pub fn watch_session(&self, scheduler: &TaskScheduler) -> SchedulerResult<TaskHandle> {
        let presence = self.clone();
        let notices = self.session.notices();
        scheduler.spawn("presence-watch", async move {
            presence.run_notice_watch(notices).await;
        })
    }

    async fn run_heartbeat(self, mut states: watch::Receiver<SessionState>) {
        if states.borrow_and_update().is_terminal() {
            debug!(agent = %self.identity, "session already closed; heartbeat not started");
            return;
        }
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the announcement already covered it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = states.changed() => {
                    let closed = changed.is_err() || states.borrow_and_update().is_terminal();
                    if closed {
                        break;
                    }
                    continue;
                }
            }

            if let Err(err) = self.heartbeat().await {
                warn!(agent = %self.identity, %err, "heartbeat failed; retrying next tick");
            }
            self.peers.sweep();
        }
        debug!(agent = %self.identity, "heartbeat loop stopped");
    }

    async fn run_notice_watch(self, mut notices: tokio::sync::broadcast::Receiver<SessionNotice>) {
        loop {
            match notices.recv().await {
                Ok(SessionNotice::Reconnected) => {
                    info!(agent = %self.identity, "transport reconnected; re-announcing presence");
                    if let Err(err) = self.announce().await {
                        warn!(agent = %self.identity, %err, "re-announcement failed");
                    }
                }
                Ok(SessionNotice::TransportLost { attempts }) => {
                    error!(agent = %self.identity, attempts, "transport lost; presence stopped");
                    break;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(agent = %self.identity, skipped, "missed session notices");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn publish(&self, envelope: &MessageEnvelope) -> MessagingResult<()> {
        let payload = envelope.to_bytes()?;
        self.session
            .publish(channels::all_agents_channel(), payload)
            .await
            .map_err(MessagingError::from)
    }

    fn lock_metadata(&self) -> MutexGuard<'_, AgentMetadata> {
        self.metadata.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_transport::{InboundMessage, MemoryBroker, MessageHandler, TransportConfig};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct Collect(mpsc::UnboundedSender<MessageEnvelope>);

    #[async_trait]
    impl MessageHandler for Collect {
        async fn handle(&self, message: InboundMessage) {
            let _ = self
                .0
                .send(MessageEnvelope::from_bytes(message.payload()).unwrap());
        }
    }

    async fn setup(interval: Duration) -> (PresenceManager, mpsc::UnboundedReceiver<MessageEnvelope>) {
        let broker = MemoryBroker::new();
        let session = TransportSession::new(broker.connector(), TransportConfig::new("memory://"));
        session.connect().await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        session
            .subscribe(channels::ALL_AGENTS, Arc::new(Collect(tx)))
            .await
            .unwrap();

        let identity = AgentName::new("Weather Bot").unwrap();
        let metadata = AgentMetadata::builder(&identity)
            .capabilities(vec!["weather".into()])
            .build();
        let presence = PresenceManager::new(
            identity,
            session,
            metadata,
            PeerRegistry::new(Duration::from_secs(90)),
            interval,
        );
        (presence, rx)
    }

    #[tokio::test]
    async fn announcement_carries_metadata_snapshot() {
        let (presence, mut rx) = setup(Duration::from_secs(30)).await;
        presence.announce().await.unwrap();

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.content, "Agent 'Weather Bot' is now online");
        let snapshot = AgentMetadata::from_metadata_map(&envelope.metadata).unwrap();
        assert_eq!(snapshot, presence.metadata());
        assert!(envelope.is_broadcast());
    }

    #[tokio::test]
    async fn heartbeat_loop_ticks_and_stops_on_close() {
        let (presence, mut rx) = setup(Duration::from_millis(20)).await;
        let scheduler = TaskScheduler::default();
        let handle = presence.start_heartbeat(&scheduler).unwrap();

        for _ in 0..2 {
            let envelope = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(envelope.message_type, agent_primitives::MessageType::Heartbeat);
        }

        presence.session.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn heartbeat_does_not_start_on_closed_session() {
        let (presence, _rx) = setup(Duration::from_secs(30)).await;
        presence.session.close().await.unwrap();
        let scheduler = TaskScheduler::default();
        let handle = presence.start_heartbeat(&scheduler).unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn offline_announcement_sets_status() {
        let (presence, mut rx) = setup(Duration::from_secs(30)).await;
        presence.announce_offline().await.unwrap();

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.content, "Agent 'Weather Bot' going offline");
        assert_eq!(envelope.metadata_str("status"), Some("offline"));
        assert_eq!(presence.metadata().status(), AgentStatus::Offline);
    }
}
