//! Coordinator/worker messaging layer
//!
//! One [`NetworkManager`] owns both roles, like the node process it runs
//! in: as coordinator it accepts WebSocket connections and tracks them in
//! the registry; as worker it holds a single outbound connection to a
//! coordinator. Inbound envelopes are dispatched by type; task-bearing
//! events flow to the orchestrator over an mpsc channel.

mod client;
mod server;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::events::{EventBus, FleetEvent};
use crate::nodes::{NodeInfo, NodeRegistry, ServerStatus, local_hostname, node_platform};
use crate::protocol::{AckStatus, Envelope, PackTaskData, TaskSnapshot, UploadAckData};
use crate::transfer::{self, UploadSessions};
use crate::{Error, Result};

/// Bound on waiting for the coordinator's `completed` upload ack
const UPLOAD_ACK_TIMEOUT: Duration = Duration::from_secs(60);

/// Outbound queue depth per connection
const SEND_QUEUE: usize = 32;

/// Task-bearing events surfaced to the orchestrator
#[derive(Debug)]
pub enum NetEvent {
    /// A build task arrived over the wire (worker side)
    PackTask(PackTaskData),
    /// A peer reported a task status snapshot
    TaskStatus(TaskSnapshot),
}

/// Handle to a running coordinator listener
struct ServerHandle {
    port: u16,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// Handle to a live worker connection
struct ClientHandle {
    outbound: mpsc::Sender<Envelope>,
    read_task: JoinHandle<()>,
}

/// Pending upload acknowledgements keyed by upload id
///
/// The worker registers a waiter before streaming a file and the read loop
/// resolves it when the coordinator's `completed` ack arrives.
#[derive(Default)]
struct AckWaiters {
    pending: Mutex<HashMap<String, oneshot::Sender<UploadAckData>>>,
}

impl AckWaiters {
    async fn register(&self, upload_id: &str) -> oneshot::Receiver<UploadAckData> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(upload_id.to_string(), tx);
        rx
    }

    async fn resolve(&self, ack: UploadAckData) {
        match ack.status {
            AckStatus::Started => {
                tracing::debug!(upload_id = %ack.upload_id, path = ?ack.path, "upload accepted");
            }
            AckStatus::Completed => {
                if let Some(tx) = self.pending.lock().await.remove(&ack.upload_id) {
                    let _ = tx.send(ack);
                }
            }
        }
    }

    async fn forget(&self, upload_id: &str) {
        self.pending.lock().await.remove(upload_id);
    }
}

/// The messaging layer for one fleet node
pub struct NetworkManager {
    node_id: Uuid,
    platform: String,
    hostname: String,
    registry: RwLock<NodeRegistry>,
    uploads: UploadSessions,
    events: EventBus,
    net_tx: mpsc::UnboundedSender<NetEvent>,
    status: RwLock<ServerStatus>,
    is_server: AtomicBool,
    server: Mutex<Option<ServerHandle>>,
    client: Mutex<Option<ClientHandle>>,
    acks: AckWaiters,
}

impl NetworkManager {
    /// Create a manager with a fresh process-lifetime identity
    ///
    /// Returns the manager plus the receiver the orchestrator consumes
    /// [`NetEvent`]s from.
    #[must_use]
    pub fn new(
        save_root: impl AsRef<Path>,
        events: EventBus,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<NetEvent>) {
        let (net_tx, net_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            node_id: Uuid::new_v4(),
            platform: node_platform().to_string(),
            hostname: local_hostname(),
            registry: RwLock::new(NodeRegistry::new()),
            uploads: UploadSessions::new(save_root.as_ref()),
            events,
            net_tx,
            status: RwLock::new(ServerStatus::Stopped),
            is_server: AtomicBool::new(false),
            server: Mutex::new(None),
            client: Mutex::new(None),
            acks: AckWaiters::default(),
        });
        (manager, net_rx)
    }

    /// Start accepting worker connections
    ///
    /// Binds immediately and returns the bound port (useful with port 0).
    /// Status transitions `starting -> running`, or `starting -> error` on a
    /// bind failure, each broadcast before this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if a server is already running or the listener
    /// cannot bind.
    pub async fn start_server(self: &Arc<Self>, port: u16) -> Result<u16> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return Err(Error::Network("server already running".to_string()));
        }

        self.set_status(ServerStatus::Starting).await;
        let handle = match server::start(Arc::clone(self), port).await {
            Ok(handle) => handle,
            Err(e) => {
                self.set_status(ServerStatus::Error).await;
                tracing::error!(error = %e, port, "failed to start server");
                return Err(e);
            }
        };

        let bound = handle.port;
        *server = Some(handle);
        drop(server);

        self.is_server.store(true, Ordering::SeqCst);
        self.set_status(ServerStatus::Running).await;
        tracing::info!(port = bound, "coordinator listening");
        Ok(bound)
    }

    /// Stop the coordinator listener and drop every session
    ///
    /// # Errors
    ///
    /// Returns an error if the server is not running.
    pub async fn stop_server(&self) -> Result<()> {
        let Some(handle) = self.server.lock().await.take() else {
            return Err(Error::Network("server not running".to_string()));
        };

        // stop accepting, then tell live connection handlers to wind down
        handle.accept_task.abort();
        let _ = handle.shutdown.send(true);

        self.registry.write().await.clear();
        self.is_server.store(false, Ordering::SeqCst);
        self.set_status(ServerStatus::Stopped).await;
        tracing::info!("coordinator stopped");
        Ok(())
    }

    /// Connect to a coordinator as a worker
    ///
    /// Announces this node's identity as the first frame on the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if already connected or the connection fails; a
    /// failure also broadcasts the `error` status transition.
    pub async fn connect_to_server(self: &Arc<Self>, host: &str, port: u16) -> Result<()> {
        let mut client = self.client.lock().await;
        if client.is_some() {
            return Err(Error::Network("already connected".to_string()));
        }

        let handle = match client::connect(Arc::clone(self), host, port).await {
            Ok(handle) => handle,
            Err(e) => {
                self.set_status(ServerStatus::Error).await;
                tracing::error!(error = %e, host, port, "failed to connect to coordinator");
                return Err(e);
            }
        };

        *client = Some(handle);
        drop(client);

        self.set_status(ServerStatus::Connected).await;
        tracing::info!(host, port, "connected to coordinator");
        Ok(())
    }

    /// Close the worker connection
    ///
    /// # Errors
    ///
    /// Returns an error if no coordinator connection is open.
    pub async fn disconnect(&self) -> Result<()> {
        let Some(handle) = self.client.lock().await.take() else {
            return Err(Error::Network("not connected to a coordinator".to_string()));
        };
        handle.read_task.abort();
        drop(handle.outbound);
        // self-disconnect notification: our own link, not a peer's
        self.events.publish(FleetEvent::NodeDisconnected {
            node: Some(self.node_info()),
        });
        self.set_status(ServerStatus::Stopped).await;
        tracing::info!("disconnected from coordinator");
        Ok(())
    }

    /// Send to every connected session, best-effort; returns how many sends
    /// were queued
    pub async fn broadcast_to_all(&self, envelope: &Envelope) -> usize {
        self.registry.read().await.broadcast(envelope)
    }

    /// Send to the first session announcing `node_id`; silently does nothing
    /// if none matches
    pub async fn send_to_node(&self, node_id: Uuid, envelope: &Envelope) -> bool {
        self.registry.read().await.send_to_node(node_id, envelope)
    }

    /// Queue an envelope on the worker's coordinator connection
    ///
    /// # Errors
    ///
    /// Returns an error if no coordinator connection is open.
    pub async fn send_to_server(&self, envelope: Envelope) -> Result<()> {
        let outbound = {
            let client = self.client.lock().await;
            let Some(handle) = client.as_ref() else {
                return Err(Error::Network("not connected to a coordinator".to_string()));
            };
            handle.outbound.clone()
        };
        outbound
            .send(envelope)
            .await
            .map_err(|_| Error::Network("coordinator connection closed".to_string()))
    }

    /// Stream a local file to the coordinator and wait for the `completed`
    /// ack
    ///
    /// # Errors
    ///
    /// Returns an error if not connected, the stream fails mid-transfer, or
    /// the ack does not arrive within the wait bound.
    pub async fn upload_file_to_server(
        &self,
        source: &Path,
        upload_id: &str,
        file_name: &str,
        sub_dir: Option<String>,
    ) -> Result<UploadAckData> {
        let outbound = {
            let client = self.client.lock().await;
            let Some(handle) = client.as_ref() else {
                return Err(Error::Network(
                    "not connected to a coordinator, cannot upload".to_string(),
                ));
            };
            handle.outbound.clone()
        };

        let ack_rx = self.acks.register(upload_id).await;
        if let Err(e) =
            transfer::upload_file(&outbound, upload_id, file_name, sub_dir, source).await
        {
            self.acks.forget(upload_id).await;
            return Err(e);
        }

        match tokio::time::timeout(UPLOAD_ACK_TIMEOUT, ack_rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(Error::Transfer(
                "connection closed before upload ack".to_string(),
            )),
            Err(_) => {
                self.acks.forget(upload_id).await;
                Err(Error::Transfer(format!(
                    "no upload ack within {}s",
                    UPLOAD_ACK_TIMEOUT.as_secs()
                )))
            }
        }
    }

    /// Whether this node is currently the coordinator
    #[must_use]
    pub fn is_server_mode(&self) -> bool {
        self.is_server.load(Ordering::SeqCst)
    }

    /// This node's process-lifetime id
    #[must_use]
    pub const fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// This node's identity as announced to peers
    #[must_use]
    pub fn node_info(&self) -> NodeInfo {
        NodeInfo {
            node_id: self.node_id,
            platform: self.platform.clone(),
            hostname: self.hostname.clone(),
            connected_at: chrono::Utc::now(),
            is_server: self.is_server_mode(),
        }
    }

    /// Current status
    pub async fn status(&self) -> ServerStatus {
        *self.status.read().await
    }

    /// Port the coordinator is listening on, if running
    pub async fn server_port(&self) -> Option<u16> {
        self.server.lock().await.as_ref().map(|h| h.port)
    }

    /// Roster of peers that have announced an identity
    pub async fn connected_nodes(&self) -> Vec<NodeInfo> {
        self.registry.read().await.connected_nodes()
    }

    /// Upload save root (receiver side)
    #[must_use]
    pub fn save_root(&self) -> &Path {
        self.uploads.save_root()
    }

    /// Transition status, broadcasting every actual change to observers
    async fn set_status(&self, next: ServerStatus) {
        let mut status = self.status.write().await;
        if *status == next {
            return;
        }
        *status = next;
        drop(status);
        self.events
            .publish(FleetEvent::ServerStatusChanged { status: next });
    }

    /// Count of open upload sessions (receiver side)
    pub async fn open_upload_sessions(&self) -> usize {
        self.uploads.open_sessions().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_manager_is_stopped_and_clientless() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _rx) = NetworkManager::new(dir.path(), EventBus::new());

        assert_eq!(manager.status().await, ServerStatus::Stopped);
        assert!(!manager.is_server_mode());
        assert!(manager.server_port().await.is_none());
        assert!(manager.connected_nodes().await.is_empty());
    }

    #[tokio::test]
    async fn stop_without_start_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _rx) = NetworkManager::new(dir.path(), EventBus::new());
        assert!(manager.stop_server().await.is_err());
        assert!(manager.disconnect().await.is_err());
    }

    #[tokio::test]
    async fn send_to_server_without_connection_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _rx) = NetworkManager::new(dir.path(), EventBus::new());
        let envelope = Envelope::UploadEnd {
            data: crate::protocol::UploadEndData {
                upload_id: "u1".to_string(),
            },
        };
        assert!(manager.send_to_server(envelope).await.is_err());
    }

    #[tokio::test]
    async fn status_transition_broadcasts_once_per_change() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let (manager, _net_rx) = NetworkManager::new(dir.path(), bus);

        manager.set_status(ServerStatus::Starting).await;
        manager.set_status(ServerStatus::Starting).await;
        manager.set_status(ServerStatus::Error).await;

        let first = rx.recv().await.unwrap();
        assert!(matches!(
            first,
            FleetEvent::ServerStatusChanged {
                status: ServerStatus::Starting
            }
        ));
        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second,
            FleetEvent::ServerStatusChanged {
                status: ServerStatus::Error
            }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ack_waiters_resolve_on_completed_only() {
        let waiters = AckWaiters::default();
        let mut rx = waiters.register("u1").await;

        waiters
            .resolve(UploadAckData {
                upload_id: "u1".to_string(),
                status: AckStatus::Started,
                path: None,
            })
            .await;
        assert!(rx.try_recv().is_err());

        waiters
            .resolve(UploadAckData {
                upload_id: "u1".to_string(),
                status: AckStatus::Completed,
                path: None,
            })
            .await;
        let ack = rx.await.unwrap();
        assert_eq!(ack.status, AckStatus::Completed);
    }
}
