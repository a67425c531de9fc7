//! Connection registry for the coordinator side

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::Envelope;

use super::types::NodeInfo;

/// A live peer connection tracked by the coordinator
#[derive(Debug)]
pub struct PeerSession {
    pub connected_at: DateTime<Utc>,
    /// Identity learned from the peer's announcement; set once, immutable
    pub info: Option<NodeInfo>,
    /// Outbound queue drained by the connection's send pump
    sender: mpsc::Sender<Envelope>,
}

/// Outcome of an identity announcement
#[derive(Debug, PartialEq, Eq)]
pub enum AttachOutcome {
    /// Identity attached to a previously anonymous session
    Attached,
    /// Identity attached after displacing a stale session with the same node id
    Reconnected(Uuid),
    /// The session already announced an identity; duplicate ignored
    AlreadyIdentified,
    /// No session with that id exists
    UnknownSession,
}

/// Registry of connected peers, keyed by per-registry session id
///
/// The session id is assigned by the coordinator when the transport opens
/// and is distinct from the peer's node id: a peer that reconnects gets a
/// fresh session id while keeping its node id.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    sessions: HashMap<Uuid, PeerSession>,
}

impl NodeRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Register a new anonymous session the moment the transport opens, so
    /// inbound messages cannot race the identity announcement
    pub fn register(&mut self, session_id: Uuid, sender: mpsc::Sender<Envelope>) {
        self.sessions.insert(
            session_id,
            PeerSession {
                connected_at: Utc::now(),
                info: None,
                sender,
            },
        );
    }

    /// Attach an announced identity to a session
    ///
    /// Identity is write-once: a second announcement on the same session is
    /// ignored. An announcement reusing a node id held by another live
    /// session displaces that session (reconnect), keeping the invariant
    /// that a node id maps to at most one active session.
    pub fn attach_info(
        &mut self,
        session_id: Uuid,
        node_id: Uuid,
        platform: String,
        hostname: String,
    ) -> AttachOutcome {
        if !self.sessions.contains_key(&session_id) {
            return AttachOutcome::UnknownSession;
        }
        if self
            .sessions
            .get(&session_id)
            .is_some_and(|s| s.info.is_some())
        {
            return AttachOutcome::AlreadyIdentified;
        }

        let stale = self
            .sessions
            .iter()
            .find(|(id, session)| {
                **id != session_id
                    && session
                        .info
                        .as_ref()
                        .is_some_and(|info| info.node_id == node_id)
            })
            .map(|(id, _)| *id);
        if let Some(stale_id) = stale {
            self.sessions.remove(&stale_id);
        }

        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.info = Some(NodeInfo {
                node_id,
                platform,
                hostname,
                connected_at: session.connected_at,
                is_server: false,
            });
        }

        stale.map_or(AttachOutcome::Attached, AttachOutcome::Reconnected)
    }

    /// Remove a session, returning it so the caller can report the
    /// disconnect with whatever identity was known
    pub fn remove(&mut self, session_id: Uuid) -> Option<PeerSession> {
        self.sessions.remove(&session_id)
    }

    /// Identity attached to a session, if announced
    #[must_use]
    pub fn info(&self, session_id: Uuid) -> Option<&NodeInfo> {
        self.sessions.get(&session_id)?.info.as_ref()
    }

    /// Send to every open session, best-effort; returns how many sends were
    /// queued
    #[must_use]
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        let mut queued = 0;
        for (session_id, session) in &self.sessions {
            if session.sender.try_send(envelope.clone()).is_ok() {
                queued += 1;
            } else {
                tracing::trace!(%session_id, "broadcast skipped closed or congested session");
            }
        }
        queued
    }

    /// Send to the first session whose identity matches `node_id`
    ///
    /// One attempt, no queuing for later delivery; returns whether a send
    /// was queued.
    #[must_use]
    pub fn send_to_node(&self, node_id: Uuid, envelope: &Envelope) -> bool {
        self.sessions
            .values()
            .find(|s| s.info.as_ref().is_some_and(|i| i.node_id == node_id))
            .is_some_and(|s| s.sender.try_send(envelope.clone()).is_ok())
    }

    /// Send to one session by its session id
    #[must_use]
    pub fn send_to_session(&self, session_id: Uuid, envelope: &Envelope) -> bool {
        self.sessions
            .get(&session_id)
            .is_some_and(|s| s.sender.try_send(envelope.clone()).is_ok())
    }

    /// Roster of peers that have announced an identity
    ///
    /// Anonymous sessions are tracked but excluded here.
    #[must_use]
    pub fn connected_nodes(&self) -> Vec<NodeInfo> {
        self.sessions
            .values()
            .filter_map(|s| s.info.clone())
            .collect()
    }

    /// Number of live sessions, identified or not
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are connected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop every session
    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (mpsc::Sender<Envelope>, mpsc::Receiver<Envelope>) {
        mpsc::channel(8)
    }

    #[test]
    fn register_then_attach() {
        let mut registry = NodeRegistry::new();
        let session_id = Uuid::new_v4();
        let node_id = Uuid::new_v4();
        let (tx, _rx) = channel();

        registry.register(session_id, tx);
        assert!(registry.connected_nodes().is_empty());

        let outcome = registry.attach_info(
            session_id,
            node_id,
            "linux".to_string(),
            "builder-1".to_string(),
        );
        assert_eq!(outcome, AttachOutcome::Attached);

        let roster = registry.connected_nodes();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].node_id, node_id);
    }

    #[test]
    fn identity_is_write_once() {
        let mut registry = NodeRegistry::new();
        let session_id = Uuid::new_v4();
        let node_id = Uuid::new_v4();
        let (tx, _rx) = channel();
        registry.register(session_id, tx);

        registry.attach_info(session_id, node_id, "linux".into(), "a".into());
        let outcome = registry.attach_info(session_id, Uuid::new_v4(), "linux".into(), "b".into());
        assert_eq!(outcome, AttachOutcome::AlreadyIdentified);
        assert_eq!(registry.info(session_id).unwrap().node_id, node_id);
    }

    #[test]
    fn duplicate_node_id_displaces_stale_session() {
        let mut registry = NodeRegistry::new();
        let node_id = Uuid::new_v4();
        let old_session = Uuid::new_v4();
        let new_session = Uuid::new_v4();
        let (tx_a, _rx_a) = channel();
        let (tx_b, _rx_b) = channel();

        registry.register(old_session, tx_a);
        registry.attach_info(old_session, node_id, "linux".into(), "a".into());

        registry.register(new_session, tx_b);
        let outcome = registry.attach_info(new_session, node_id, "linux".into(), "a".into());
        assert_eq!(outcome, AttachOutcome::Reconnected(old_session));

        // at most one active session per node id
        let roster = registry.connected_nodes();
        assert_eq!(roster.len(), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.info(old_session).is_none());
    }

    #[test]
    fn attach_to_unknown_session() {
        let mut registry = NodeRegistry::new();
        let outcome =
            registry.attach_info(Uuid::new_v4(), Uuid::new_v4(), "linux".into(), "a".into());
        assert_eq!(outcome, AttachOutcome::UnknownSession);
    }

    #[test]
    fn remove_returns_known_identity() {
        let mut registry = NodeRegistry::new();
        let session_id = Uuid::new_v4();
        let node_id = Uuid::new_v4();
        let (tx, _rx) = channel();
        registry.register(session_id, tx);
        registry.attach_info(session_id, node_id, "linux".into(), "a".into());

        let removed = registry.remove(session_id).unwrap();
        assert_eq!(removed.info.unwrap().node_id, node_id);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_open_session() {
        let mut registry = NodeRegistry::new();
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        registry.register(Uuid::new_v4(), tx_a);
        registry.register(Uuid::new_v4(), tx_b);

        let envelope = Envelope::UploadEnd {
            data: crate::protocol::UploadEndData {
                upload_id: "u1".to_string(),
            },
        };
        assert_eq!(registry.broadcast(&envelope), 2);
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
    }

    #[test]
    fn broadcast_skips_closed_sessions() {
        let mut registry = NodeRegistry::new();
        let (tx, rx) = channel();
        drop(rx);
        registry.register(Uuid::new_v4(), tx);

        let envelope = Envelope::UploadEnd {
            data: crate::protocol::UploadEndData {
                upload_id: "u1".to_string(),
            },
        };
        assert_eq!(registry.broadcast(&envelope), 0);
    }

    #[test]
    fn send_to_unknown_node_is_a_no_op() {
        let registry = NodeRegistry::new();
        let envelope = Envelope::UploadEnd {
            data: crate::protocol::UploadEndData {
                upload_id: "u1".to_string(),
            },
        };
        assert!(!registry.send_to_node(Uuid::new_v4(), &envelope));
    }
}
