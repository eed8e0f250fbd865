//! Connection registry.
//!
//! Authoritative in-process map of live connections with metadata, secondary
//! indices by user and ip, and conversation fan-out. Broadcast never holds a
//! lock across delivery: the recipient set is snapshotted first, then each
//! recipient is offered the envelope through its bounded outgoing queue. A
//! full queue marks that connection UNRESPONSIVE instead of dropping
//! silently.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::telemetry::Metrics;
use crate::websocket::Envelope;

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Initial,
    Connecting,
    Authenticating,
    Authenticated,
    Ready,
    Streaming,
    Unresponsive,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Whether `self -> next` is a permitted transition.
    ///
    /// Any state may move to CLOSING; UNRESPONSIVE may recover to READY when
    /// its queue drains before the grace period lapses.
    pub fn can_transition(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (_, Closing) => self != Closed,
            (Closing, Closed) => true,
            (Initial, Connecting) => true,
            (Connecting, Authenticating) => true,
            (Authenticating, Authenticated) => true,
            (Authenticated, Ready) => true,
            (Ready, Streaming) => true,
            (Streaming, Ready) => true,
            (Ready, Unresponsive) | (Streaming, Unresponsive) => true,
            (Unresponsive, Ready) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown connection")]
    UnknownConnection,

    #[error("invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// Mutable metadata for one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub connection_id: String,
    pub user_id: String,
    pub is_admin: bool,
    pub ip: String,
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub state: ConnectionState,
    pub is_typing: bool,
    pub last_message_id: Option<String>,
    pub unresponsive_since: Option<DateTime<Utc>>,
}

impl ConnectionMeta {
    pub fn new(
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        is_admin: bool,
        ip: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            is_admin,
            ip: ip.into(),
            conversation_id: conversation_id.into(),
            created_at: now,
            last_seen: now,
            state: ConnectionState::Connecting,
            is_typing: false,
            last_message_id: None,
            unresponsive_since: None,
        }
    }
}

/// Serializable projection of a connection for admin listings; never holds
/// transport handles.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub connection_id: String,
    pub user_id: String,
    pub ip: String,
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub state: ConnectionState,
    pub is_typing: bool,
    pub last_message_id: Option<String>,
}

impl From<&ConnectionMeta> for ConnectionSnapshot {
    fn from(meta: &ConnectionMeta) -> Self {
        Self {
            connection_id: meta.connection_id.clone(),
            user_id: meta.user_id.clone(),
            ip: meta.ip.clone(),
            conversation_id: meta.conversation_id.clone(),
            created_at: meta.created_at,
            last_seen: meta.last_seen,
            state: meta.state,
            is_typing: meta.is_typing,
            last_message_id: meta.last_message_id.clone(),
        }
    }
}

/// Lifecycle events published to interested subscribers.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Registered {
        connection_id: String,
        user_id: String,
    },
    StateChanged {
        connection_id: String,
        state: ConnectionState,
    },
    Unregistered {
        connection_id: String,
        user_id: String,
    },
}

struct ConnectionEntry {
    meta: ConnectionMeta,
    sender: mpsc::Sender<Envelope>,
}

pub struct ConnectionRegistry {
    connections: DashMap<String, ConnectionEntry>,
    by_user: DashMap<String, HashSet<String>>,
    by_ip: DashMap<String, HashSet<String>>,
    events: broadcast::Sender<RegistryEvent>,
    metrics: Arc<Metrics>,
}

impl ConnectionRegistry {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            connections: DashMap::new(),
            by_user: DashMap::new(),
            by_ip: DashMap::new(),
            events,
            metrics,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Insert a connection in CONNECTING state.
    pub fn register(&self, mut meta: ConnectionMeta, sender: mpsc::Sender<Envelope>) {
        meta.state = ConnectionState::Connecting;
        let connection_id = meta.connection_id.clone();
        let user_id = meta.user_id.clone();

        debug!(connection_id = %connection_id, user_id = %user_id, "Registering connection");

        self.by_user
            .entry(user_id.clone())
            .or_default()
            .insert(connection_id.clone());
        self.by_ip
            .entry(meta.ip.clone())
            .or_default()
            .insert(connection_id.clone());
        self.connections
            .insert(connection_id.clone(), ConnectionEntry { meta, sender });

        self.metrics
            .ws_active_connections
            .set(self.connections.len() as u64);
        let _ = self.events.send(RegistryEvent::Registered {
            connection_id,
            user_id,
        });
    }

    /// Validated state change. Returns the previous state.
    pub fn transition(
        &self,
        connection_id: &str,
        next: ConnectionState,
    ) -> Result<ConnectionState, RegistryError> {
        let mut entry = self
            .connections
            .get_mut(connection_id)
            .ok_or(RegistryError::UnknownConnection)?;

        let previous = entry.meta.state;
        if previous == next {
            return Ok(previous);
        }
        if !previous.can_transition(next) {
            return Err(RegistryError::InvalidTransition {
                from: previous,
                to: next,
            });
        }

        entry.meta.state = next;
        entry.meta.last_seen = Utc::now();
        entry.meta.unresponsive_since = if next == ConnectionState::Unresponsive {
            Some(Utc::now())
        } else {
            None
        };
        drop(entry);

        let _ = self.events.send(RegistryEvent::StateChanged {
            connection_id: connection_id.to_string(),
            state: next,
        });
        Ok(previous)
    }

    pub fn state(&self, connection_id: &str) -> Option<ConnectionState> {
        self.connections
            .get(connection_id)
            .map(|entry| entry.meta.state)
    }

    pub fn unresponsive_since(&self, connection_id: &str) -> Option<DateTime<Utc>> {
        self.connections
            .get(connection_id)
            .and_then(|entry| entry.meta.unresponsive_since)
    }

    /// Update last-seen to now.
    pub fn heartbeat(&self, connection_id: &str) {
        if let Some(mut entry) = self.connections.get_mut(connection_id) {
            entry.meta.last_seen = Utc::now();
        }
    }

    /// Update the typing flag, returning the previous value.
    pub fn set_typing(&self, connection_id: &str, is_typing: bool) -> Option<bool> {
        let mut entry = self.connections.get_mut(connection_id)?;
        let previous = entry.meta.is_typing;
        entry.meta.is_typing = is_typing;
        entry.meta.last_seen = Utc::now();
        Some(previous)
    }

    pub fn set_last_message(&self, connection_id: &str, message_id: impl Into<String>) {
        if let Some(mut entry) = self.connections.get_mut(connection_id) {
            entry.meta.last_message_id = Some(message_id.into());
            entry.meta.last_seen = Utc::now();
        }
    }

    pub fn count_by_user(&self, user_id: &str) -> usize {
        self.by_user.get(user_id).map_or(0, |set| set.len())
    }

    pub fn count_by_ip(&self, ip: &str) -> usize {
        self.by_ip.get(ip).map_or(0, |set| set.len())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn snapshots(&self) -> Vec<ConnectionSnapshot> {
        let mut snapshots: Vec<ConnectionSnapshot> = self
            .connections
            .iter()
            .map(|entry| ConnectionSnapshot::from(&entry.value().meta))
            .collect();
        snapshots.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        snapshots
    }

    /// Offer an envelope to one connection's outgoing queue.
    ///
    /// Returns false when the connection is gone or its queue is saturated;
    /// saturation moves the connection to UNRESPONSIVE.
    pub fn send_to(&self, connection_id: &str, envelope: Envelope) -> bool {
        let sender = match self.connections.get(connection_id) {
            Some(entry) => entry.sender.clone(),
            None => return false,
        };

        match sender.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.ws_broadcast_dropped.inc();
                warn!(connection_id = %connection_id, "Outgoing queue saturated");
                let _ = self.transition(connection_id, ConnectionState::Unresponsive);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Deliver an envelope to every member of a conversation except an
    /// optional sender. Returns the number of queues the envelope reached.
    pub fn broadcast(
        &self,
        conversation_id: &str,
        envelope: &Envelope,
        except: Option<&str>,
    ) -> usize {
        // Snapshot recipients first so no map shard lock is held while
        // offering to queues.
        let recipients: Vec<String> = self
            .connections
            .iter()
            .filter(|entry| {
                entry.value().meta.conversation_id == conversation_id
                    && Some(entry.key().as_str()) != except
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut delivered = 0;
        for connection_id in recipients {
            if self.send_to(&connection_id, envelope.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Remove a connection and its index entries, returning its metadata.
    pub fn unregister(&self, connection_id: &str) -> Option<ConnectionMeta> {
        let (_, entry) = self.connections.remove(connection_id)?;
        let meta = entry.meta;

        if let Some(mut set) = self.by_user.get_mut(&meta.user_id) {
            set.remove(connection_id);
        }
        self.by_user
            .remove_if(&meta.user_id, |_, set| set.is_empty());

        if let Some(mut set) = self.by_ip.get_mut(&meta.ip) {
            set.remove(connection_id);
        }
        self.by_ip.remove_if(&meta.ip, |_, set| set.is_empty());

        self.metrics
            .ws_active_connections
            .set(self.connections.len() as u64);
        let _ = self.events.send(RegistryEvent::Unregistered {
            connection_id: connection_id.to_string(),
            user_id: meta.user_id.clone(),
        });

        debug!(connection_id = %connection_id, "Unregistered connection");
        Some(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::Envelope;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(Metrics::new()))
    }

    fn meta(id: &str, user: &str, ip: &str) -> ConnectionMeta {
        ConnectionMeta::new(id, user, false, ip, "k-1")
    }

    #[test]
    fn test_transition_table() {
        use ConnectionState::*;

        assert!(Initial.can_transition(Connecting));
        assert!(Connecting.can_transition(Authenticating));
        assert!(Authenticating.can_transition(Authenticated));
        assert!(Authenticating.can_transition(Closing));
        assert!(Authenticated.can_transition(Ready));
        assert!(Authenticated.can_transition(Closing));
        assert!(Ready.can_transition(Streaming));
        assert!(Streaming.can_transition(Ready));
        assert!(Ready.can_transition(Unresponsive));
        assert!(Streaming.can_transition(Unresponsive));
        assert!(Unresponsive.can_transition(Closing));
        assert!(Closing.can_transition(Closed));

        assert!(!Initial.can_transition(Ready));
        assert!(!Ready.can_transition(Authenticated));
        assert!(!Closed.can_transition(Closing));
        assert!(!Closing.can_transition(Ready));
    }

    #[tokio::test]
    async fn test_register_counts_and_unregister() {
        let registry = registry();
        let (tx, _rx) = mpsc::channel(8);
        registry.register(meta("c-1", "u1", "10.0.0.1"), tx.clone());
        registry.register(meta("c-2", "u1", "10.0.0.2"), tx);

        assert_eq!(registry.count_by_user("u1"), 2);
        assert_eq!(registry.count_by_ip("10.0.0.1"), 1);
        assert_eq!(registry.len(), 2);

        let removed = registry.unregister("c-1").unwrap();
        assert_eq!(removed.user_id, "u1");
        assert_eq!(registry.count_by_user("u1"), 1);
        assert_eq!(registry.count_by_ip("10.0.0.1"), 0);
        assert!(registry.unregister("c-1").is_none());
    }

    #[tokio::test]
    async fn test_transition_validation() {
        let registry = registry();
        let (tx, _rx) = mpsc::channel(8);
        registry.register(meta("c-1", "u1", "10.0.0.1"), tx);

        assert_eq!(
            registry
                .transition("c-1", ConnectionState::Authenticating)
                .unwrap(),
            ConnectionState::Connecting
        );
        assert_eq!(
            registry.transition("c-1", ConnectionState::Ready),
            Err(RegistryError::InvalidTransition {
                from: ConnectionState::Authenticating,
                to: ConnectionState::Ready,
            })
        );
        assert_eq!(
            registry.transition("missing", ConnectionState::Closing),
            Err(RegistryError::UnknownConnection)
        );
    }

    #[tokio::test]
    async fn test_set_typing_returns_previous() {
        let registry = registry();
        let (tx, _rx) = mpsc::channel(8);
        registry.register(meta("c-1", "u1", "10.0.0.1"), tx);

        assert_eq!(registry.set_typing("c-1", true), Some(false));
        assert_eq!(registry.set_typing("c-1", true), Some(true));
        assert_eq!(registry.set_typing("c-1", false), Some(true));
        assert_eq!(registry.set_typing("missing", true), None);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender_and_other_conversations() {
        let registry = registry();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        let (tx3, mut rx3) = mpsc::channel(8);

        registry.register(meta("c-1", "u1", "ip1"), tx1);
        registry.register(meta("c-2", "u2", "ip2"), tx2);
        let mut other = meta("c-3", "u3", "ip3");
        other.conversation_id = "k-other".to_string();
        registry.register(other, tx3);

        let envelope = Envelope::Ping { nonce: 1 };
        let delivered = registry.broadcast("k-1", &envelope, Some("c-1"));

        assert_eq!(delivered, 1);
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap(), envelope);
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_saturated_queue_marks_unresponsive() {
        let metrics = Arc::new(Metrics::new());
        let registry = ConnectionRegistry::new(metrics.clone());
        let (tx, _rx) = mpsc::channel(1);
        registry.register(meta("c-1", "u1", "ip1"), tx);
        registry
            .transition("c-1", ConnectionState::Authenticating)
            .unwrap();
        registry
            .transition("c-1", ConnectionState::Authenticated)
            .unwrap();
        registry.transition("c-1", ConnectionState::Ready).unwrap();

        assert!(registry.send_to("c-1", Envelope::Ping { nonce: 1 }));
        // Queue of one is now full; the next offer saturates.
        assert!(!registry.send_to("c-1", Envelope::Ping { nonce: 2 }));

        assert_eq!(registry.state("c-1"), Some(ConnectionState::Unresponsive));
        assert!(registry.unresponsive_since("c-1").is_some());
        assert_eq!(metrics.ws_broadcast_dropped.get(), 1);
    }

    #[tokio::test]
    async fn test_lifecycle_events_published() {
        let registry = registry();
        let mut events = registry.subscribe();
        let (tx, _rx) = mpsc::channel(8);

        registry.register(meta("c-1", "u1", "ip1"), tx);
        registry.unregister("c-1").unwrap();

        assert!(matches!(
            events.try_recv().unwrap(),
            RegistryEvent::Registered { .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            RegistryEvent::Unregistered { .. }
        ));
    }
}
