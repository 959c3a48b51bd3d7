//! Liveness tracking for other agents on the mesh.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use agent_primitives::{AgentMetadata, AgentStatus, MessageEnvelope, normalize};
use tracing::{debug, info};

/// Last known state of a peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    name: String,
    status: AgentStatus,
    metadata: Option<AgentMetadata>,
    last_seen: Instant,
}

impl PeerRecord {
    /// Returns the peer's display name as last announced.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the peer's status as tracked locally.
    #[must_use]
    pub const fn status(&self) -> AgentStatus {
        self.status
    }

    /// Returns the last metadata snapshot, when the peer sent a parseable one.
    #[must_use]
    pub const fn metadata(&self) -> Option<&AgentMetadata> {
        self.metadata.as_ref()
    }

    /// Returns when the peer was last heard from.
    #[must_use]
    pub const fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Returns `true` unless the peer went offline or expired.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.status != AgentStatus::Offline
    }
}

/// Registry of peers fed by announcements and heartbeats.
///
/// A peer is reported offline when it announces so, or when it stays silent
/// for longer than the expiry window. Entries are keyed by normalized
/// identity. Clones share state.
#[derive(Clone)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<String, PeerRecord>>>,
    expiry: Duration,
}

impl fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("peers", &self.len())
            .field("expiry", &self.expiry)
            .finish()
    }
}

impl PeerRegistry {
    /// Creates a registry that expires silent peers after `expiry`.
    #[must_use]
    pub fn new(expiry: Duration) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            expiry,
        }
    }

    /// Creates a registry that expires peers after `missed` heartbeat intervals.
    #[must_use]
    pub fn from_heartbeats(heartbeat_interval: Duration, missed: u32) -> Self {
        Self::new(heartbeat_interval.saturating_mul(missed.max(1)))
    }

    /// Returns the expiry window.
    #[must_use]
    pub const fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Records an announcement from a peer.
    ///
    /// Announcements with `metadata.status == "offline"` mark the peer offline
    /// immediately.
    pub fn record_announcement(&self, envelope: &MessageEnvelope) {
        self.record_at(envelope, Instant::now());
    }

    /// Records a heartbeat from a peer.
    pub fn record_heartbeat(&self, envelope: &MessageEnvelope) {
        self.record_at(envelope, Instant::now());
    }

    fn record_at(&self, envelope: &MessageEnvelope, seen: Instant) {
        let going_offline = envelope.metadata_str("status") == Some(AgentStatus::Offline.as_str());
        let snapshot = if going_offline {
            None
        } else {
            AgentMetadata::from_metadata_map(&envelope.metadata)
                .inspect_err(|err| {
                    debug!(peer = %envelope.from_agent, %err, "peer sent unparseable metadata");
                })
                .ok()
        };

        let key = normalize(&envelope.from_agent);
        let mut peers = self.write();
        let record = peers.entry(key).or_insert_with(|| PeerRecord {
            name: envelope.from_agent.clone(),
            status: AgentStatus::Available,
            metadata: None,
            last_seen: seen,
        });
        let was_online = record.is_online();

        record.name.clone_from(&envelope.from_agent);
        record.last_seen = seen;
        if going_offline {
            record.status = AgentStatus::Offline;
            if was_online {
                info!(peer = %envelope.from_agent, "peer went offline");
            }
        } else {
            record.status = snapshot
                .as_ref()
                .map_or(AgentStatus::Available, AgentMetadata::status);
            if snapshot.is_some() {
                record.metadata = snapshot;
            }
            if !was_online {
                info!(peer = %envelope.from_agent, "peer is back online");
            }
        }
    }

    /// Marks silent peers offline and returns their names.
    pub fn sweep(&self) -> Vec<String> {
        self.sweep_at(Instant::now())
    }

    /// Marks peers not heard from within the expiry window before `now` as
    /// offline and returns their names.
    pub fn sweep_at(&self, now: Instant) -> Vec<String> {
        let mut expired = Vec::new();
        for record in self.write().values_mut() {
            if record.is_online() && now.saturating_duration_since(record.last_seen) > self.expiry
            {
                record.status = AgentStatus::Offline;
                expired.push(record.name.clone());
            }
        }
        for name in &expired {
            info!(peer = %name, expiry = ?self.expiry, "peer missed heartbeats; marked offline");
        }
        expired
    }

    /// Removes offline peers and returns how many were dropped.
    pub fn prune_offline(&self) -> usize {
        let mut peers = self.write();
        let before = peers.len();
        peers.retain(|_, record| record.is_online());
        before - peers.len()
    }

    /// Looks a peer up by name; normalization is applied.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<PeerRecord> {
        self.read().get(&normalize(name)).cloned()
    }

    /// Returns every known peer.
    #[must_use]
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.read().values().cloned().collect()
    }

    /// Returns peers currently considered online.
    #[must_use]
    pub fn online_peers(&self) -> Vec<PeerRecord> {
        self.read()
            .values()
            .filter(|record| record.is_online())
            .cloned()
            .collect()
    }

    /// Returns the number of known peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns `true` when no peer has been seen.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, PeerRecord>> {
        self.peers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, PeerRecord>> {
        self.peers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_primitives::AgentName;

    fn heartbeat(name: &str) -> MessageEnvelope {
        let identity = AgentName::new(name).unwrap();
        let metadata = AgentMetadata::builder(&identity)
            .capabilities(vec!["weather".into()])
            .build();
        MessageEnvelope::heartbeat(name).with_metadata(metadata.to_metadata_map())
    }

    #[test]
    fn heartbeats_register_peers_with_metadata() {
        let registry = PeerRegistry::new(Duration::from_secs(90));
        registry.record_heartbeat(&heartbeat("Weather Bot"));

        let record = registry.get("weather bot").unwrap();
        assert_eq!(record.name(), "Weather Bot");
        assert!(record.is_online());
        assert_eq!(
            record.metadata().unwrap().capabilities(),
            &["weather".to_owned()]
        );
    }

    #[test]
    fn silent_peers_expire_after_window() {
        let registry = PeerRegistry::from_heartbeats(Duration::from_secs(30), 3);
        assert_eq!(registry.expiry(), Duration::from_secs(90));
        let start = Instant::now();
        registry.record_at(&heartbeat("planner"), start);

        assert!(registry.sweep_at(start + Duration::from_secs(60)).is_empty());
        let expired = registry.sweep_at(start + Duration::from_secs(91));
        assert_eq!(expired, vec!["planner".to_owned()]);
        assert!(!registry.get("planner").unwrap().is_online());
        assert!(registry.sweep_at(start + Duration::from_secs(200)).is_empty());
    }

    #[test]
    fn offline_announcement_marks_peer_offline_and_prune_drops_it() {
        let registry = PeerRegistry::new(Duration::from_secs(90));
        registry.record_heartbeat(&heartbeat("planner"));
        registry.record_heartbeat(&heartbeat("writer"));

        let goodbye = MessageEnvelope::announcement("planner", "Agent 'planner' going offline")
            .with_metadata_entry("status", "offline");
        registry.record_announcement(&goodbye);

        assert_eq!(registry.online_peers().len(), 1);
        assert_eq!(registry.prune_offline(), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("planner").is_none());
    }

    #[test]
    fn heartbeat_revives_expired_peer() {
        let registry = PeerRegistry::new(Duration::from_secs(1));
        let start = Instant::now();
        registry.record_at(&heartbeat("planner"), start);
        registry.sweep_at(start + Duration::from_secs(5));
        assert!(!registry.get("planner").unwrap().is_online());

        registry.record_heartbeat(&heartbeat("planner"));
        assert!(registry.get("planner").unwrap().is_online());
    }
}
