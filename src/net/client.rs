//! Worker side: the single outbound connection to a coordinator

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::events::FleetEvent;
use crate::nodes::ServerStatus;
use crate::protocol::{DecodeError, Envelope};
use crate::{Error, Result};

use super::{ClientHandle, NetEvent, NetworkManager, SEND_QUEUE};

/// Open the coordinator connection and announce this node's identity
pub(super) async fn connect(
    manager: Arc<NetworkManager>,
    host: &str,
    port: u16,
) -> Result<ClientHandle> {
    let url = format!("ws://{host}:{port}/ws");
    let (ws_stream, _response) = connect_async(url.as_str())
        .await
        .map_err(|e| Error::Network(format!("failed to connect to {url}: {e}")))?;
    let (mut sink, mut stream) = ws_stream.split();

    let (outbound, mut outbound_rx) = mpsc::channel::<Envelope>(SEND_QUEUE);

    // identity must be the first frame on the wire
    let info = manager.node_info();
    outbound
        .send(Envelope::NodeInfo {
            node_id: info.node_id,
            platform: info.platform,
            hostname: info.hostname,
        })
        .await
        .map_err(|_| Error::Network("connection closed before announcement".to_string()))?;

    tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            let Ok(text) = envelope.encode() else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let read_manager = Arc::clone(&manager);
    let read_task = tokio::spawn(async move {
        while let Some(inbound) = stream.next().await {
            match inbound {
                Ok(Message::Text(text)) => dispatch(&read_manager, &text).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "coordinator connection error");
                    break;
                }
            }
        }

        // self-disconnect notification: this node's own link went away
        tracing::info!("coordinator connection closed");
        read_manager.client.lock().await.take();
        read_manager.events.publish(FleetEvent::NodeDisconnected {
            node: Some(read_manager.node_info()),
        });
        read_manager.set_status(ServerStatus::Stopped).await;
    });

    Ok(ClientHandle {
        outbound,
        read_task,
    })
}

/// Worker-side dispatch table
async fn dispatch(manager: &Arc<NetworkManager>, text: &str) {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(DecodeError::UnknownType(tag)) => {
            tracing::debug!(%tag, "ignoring unknown message type");
            return;
        }
        Err(DecodeError::Malformed(error)) => {
            tracing::warn!(%error, "dropping malformed message");
            return;
        }
    };

    match envelope {
        Envelope::PackTask { data } => {
            let _ = manager.net_tx.send(NetEvent::PackTask(data));
        }
        Envelope::TaskStatus { data } => {
            let _ = manager.net_tx.send(NetEvent::TaskStatus(data));
        }
        Envelope::UploadAck { data } => {
            manager.acks.resolve(data).await;
        }
        other => {
            tracing::debug!(?other, "unexpected message from coordinator");
        }
    }
}
