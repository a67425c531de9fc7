//! Coordinator side: WebSocket listener and per-connection handling

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::events::FleetEvent;
use crate::nodes::AttachOutcome;
use crate::protocol::{AckStatus, DecodeError, Envelope, UploadAckData};
use crate::{Error, Result};

use super::{NetEvent, NetworkManager, SEND_QUEUE, ServerHandle};

/// Router state for the listener
#[derive(Clone)]
struct WsState {
    manager: Arc<NetworkManager>,
    shutdown: watch::Receiver<bool>,
}

/// Bind the listener and start accepting connections
pub(super) async fn start(manager: Arc<NetworkManager>, port: u16) -> Result<ServerHandle> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| Error::Network(format!("failed to listen on port {port}: {e}")))?;
    let bound = listener
        .local_addr()
        .map_err(|e| Error::Network(format!("listener has no local address: {e}")))?
        .port();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = WsState {
        manager,
        shutdown: shutdown_rx,
    };
    let app = Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let accept_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "server accept loop failed");
        }
    });

    Ok(ServerHandle {
        port: bound,
        shutdown: shutdown_tx,
        accept_task,
    })
}

async fn ws_upgrade(State(state): State<WsState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle one peer connection for its lifetime
async fn handle_socket(socket: WebSocket, state: WsState) {
    let WsState {
        manager,
        mut shutdown,
    } = state;
    let session_id = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();

    // register before any message can arrive so inbound traffic cannot race
    // the identity announcement
    let (tx, mut rx) = mpsc::channel::<Envelope>(SEND_QUEUE);
    manager.registry.write().await.register(session_id, tx);
    tracing::debug!(%session_id, "peer connected");

    let send_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let Ok(text) = envelope.encode() else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    dispatch(&manager, session_id, &text).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(%session_id, error = %e, "peer connection error");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    send_task.abort();

    // the session and its upload sessions die with the connection
    let removed = manager.registry.write().await.remove(session_id);
    manager.uploads.remove_for_connection(session_id).await;
    if let Some(session) = removed {
        tracing::info!(%session_id, node = ?session.info.as_ref().map(|i| i.node_id), "peer disconnected");
        manager
            .events
            .publish(FleetEvent::NodeDisconnected { node: session.info });
    }
}

/// Coordinator-side dispatch table
async fn dispatch(manager: &Arc<NetworkManager>, session_id: Uuid, text: &str) {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(DecodeError::UnknownType(tag)) => {
            tracing::debug!(%session_id, %tag, "ignoring unknown message type");
            return;
        }
        Err(DecodeError::Malformed(error)) => {
            tracing::warn!(%session_id, %error, "dropping malformed message");
            return;
        }
    };

    match envelope {
        Envelope::NodeInfo {
            node_id,
            platform,
            hostname,
        } => {
            let (outcome, info) = {
                let mut registry = manager.registry.write().await;
                let outcome = registry.attach_info(session_id, node_id, platform, hostname);
                (outcome, registry.info(session_id).cloned())
            };
            match outcome {
                AttachOutcome::Attached | AttachOutcome::Reconnected(_) => {
                    if let AttachOutcome::Reconnected(stale_id) = outcome {
                        tracing::info!(%node_id, %stale_id, "node reconnected, displacing stale session");
                        manager.uploads.remove_for_connection(stale_id).await;
                    }
                    if let Some(info) = info {
                        tracing::info!(%node_id, platform = %info.platform, hostname = %info.hostname, "node connected");
                        manager.events.publish(FleetEvent::NodeConnected { node: info });
                    }
                }
                AttachOutcome::AlreadyIdentified => {
                    tracing::warn!(%session_id, %node_id, "duplicate identity announcement ignored");
                }
                AttachOutcome::UnknownSession => {}
            }
        }
        // workers never originate tasks; relaying would amplify in any
        // topology beyond a single star
        Envelope::PackTask { data } => {
            tracing::warn!(%session_id, task_id = %data.task_id, "ignoring peer-originated pack-task");
        }
        Envelope::TaskStatus { data } => {
            let _ = manager.net_tx.send(NetEvent::TaskStatus(data));
        }
        Envelope::UploadStart { data } => {
            match manager.uploads.start(session_id, &data).await {
                Ok(path) => {
                    ack(manager, session_id, UploadAckData {
                        upload_id: data.upload_id,
                        status: AckStatus::Started,
                        path: Some(path),
                    })
                    .await;
                }
                Err(e) => {
                    tracing::warn!(%session_id, upload_id = %data.upload_id, error = %e, "failed to open upload session");
                }
            }
        }
        Envelope::UploadChunk { data } => {
            if let Err(e) = manager
                .uploads
                .chunk(session_id, &data.upload_id, &data.chunk_base64)
                .await
            {
                tracing::warn!(%session_id, upload_id = %data.upload_id, error = %e, "upload chunk failed");
            }
        }
        Envelope::UploadEnd { data } => {
            match manager.uploads.end(session_id, &data.upload_id).await {
                Ok(_) => {
                    ack(manager, session_id, UploadAckData {
                        upload_id: data.upload_id,
                        status: AckStatus::Completed,
                        path: None,
                    })
                    .await;
                }
                Err(e) => {
                    tracing::warn!(%session_id, upload_id = %data.upload_id, error = %e, "failed to close upload session");
                }
            }
        }
        Envelope::UploadAck { data } => {
            tracing::debug!(%session_id, upload_id = %data.upload_id, "unexpected upload-ack from peer");
        }
    }
}

/// Acknowledge on the originating connection
async fn ack(manager: &Arc<NetworkManager>, session_id: Uuid, data: UploadAckData) {
    let envelope = Envelope::UploadAck { data };
    if !manager
        .registry
        .read()
        .await
        .send_to_session(session_id, &envelope)
    {
        tracing::debug!(%session_id, "upload ack not delivered");
    }
}
