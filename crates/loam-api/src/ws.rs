//! Sync socket: protocol commands in, acknowledgements and revision pushes out.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use loam_core::sync::protocol::{ClientMessage, ServerMessage};
use loam_core::SyncHub;
use tokio::sync::broadcast;

pub async fn handle_socket(hub: SyncHub, tenant: String, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut revisions = hub.subscribe(&tenant).await;
    tracing::info!(tenant, "Replica connected");

    loop {
        let reply = tokio::select! {
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => handle_frame(&hub, &tenant, text.as_str()).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => None,
                    Some(Err(error)) => {
                        tracing::warn!(tenant, "WebSocket receive failed: {error}");
                        break;
                    }
                }
            }
            revision = revisions.recv() => {
                match revision {
                    Ok(server_revision) => Some(ServerMessage::ChangesAvailable { server_revision }),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(tenant, skipped, "Revision pushes lagged");
                        None
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        let Some(reply) = reply else {
            continue;
        };
        let text = match serde_json::to_string(&reply) {
            Ok(text) => text,
            Err(error) => {
                tracing::error!(tenant, "Failed to encode frame: {error}");
                continue;
            }
        };
        if sender.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
    tracing::info!(tenant, "Replica disconnected");
}

async fn handle_frame(hub: &SyncHub, tenant: &str, text: &str) -> Option<ServerMessage> {
    let ClientMessage::Command { id, command } = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(error) => {
            // Without a correlation id there is nothing to answer.
            tracing::warn!(tenant, "Ignoring malformed client frame: {error}");
            return None;
        }
    };

    let name = command.name();
    let reply = match hub.handle(tenant, command).await {
        Ok(response) => ServerMessage::Ack { id, response },
        Err(error) => {
            tracing::warn!(tenant, command = name, "Command failed: {error}");
            ServerMessage::Error {
                id,
                message: error.to_string(),
            }
        }
    };
    Some(reply)
}
