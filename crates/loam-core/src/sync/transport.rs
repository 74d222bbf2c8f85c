//! Transports carrying protocol frames between a replica and the server.

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Error, Result};
use crate::server::SyncHub;

use super::protocol::{ClientMessage, ServerMessage};

const CHANNEL_CAPACITY: usize = 64;

/// One live link to the server.
///
/// Dropping the sender half closes the link; the receiver yields `None`
/// once the server side is gone.
pub struct Connection {
    pub outgoing: mpsc::Sender<ClientMessage>,
    pub incoming: mpsc::Receiver<ServerMessage>,
}

impl Connection {
    /// Two connected channel pairs: the client's `Connection` and the
    /// server-side ends that feed it.
    pub fn pair() -> (Self, mpsc::Receiver<ClientMessage>, mpsc::Sender<ServerMessage>) {
        let (outgoing, server_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (server_tx, incoming) = mpsc::channel(CHANNEL_CAPACITY);
        (Self { outgoing, incoming }, server_rx, server_tx)
    }
}

/// Opens connections to the server. Called again after every teardown.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<Connection>> + Send;
}

/// WebSocket client transport (JSON text frames).
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// `url` is the tenant's sync endpoint, e.g.
    /// `ws://localhost:8080/v1/tenants/acme/sync`
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Sync endpoint for `tenant` under an HTTP(S) or WS(S) base URL
    pub fn for_tenant(base_url: &str, tenant: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        Self::new(format!("{base}/v1/tenants/{tenant}/sync"))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    async fn connect(&self) -> Result<Connection> {
        let (socket, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|error| Error::Transport(format!("connect {}: {error}", self.url)))?;
        tracing::info!(url = %self.url, "Connected to sync server");

        let (mut sink, mut stream) = socket.split();
        let (connection, mut outgoing, incoming) = Connection::pair();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = outgoing.recv() => {
                        let Some(message) = message else {
                            let _ = sink.close().await;
                            break;
                        };
                        let text = match serde_json::to_string(&message) {
                            Ok(text) => text,
                            Err(error) => {
                                tracing::error!("Failed to encode frame: {error}");
                                continue;
                            }
                        };
                        if let Err(error) = sink.send(Message::Text(text.into())).await {
                            tracing::warn!("WebSocket send failed: {error}");
                            break;
                        }
                    }
                    frame = stream.next() => {
                        match frame {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<ServerMessage>(&text) {
                                    Ok(message) => {
                                        if incoming.send(message).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(error) => {
                                        tracing::warn!("Ignoring malformed server frame: {error}");
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(error)) => {
                                tracing::warn!("WebSocket receive failed: {error}");
                                break;
                            }
                        }
                    }
                }
            }
            tracing::debug!("WebSocket pump stopped");
        });

        Ok(connection)
    }
}

/// In-process transport straight into a [`SyncHub`].
#[derive(Clone)]
pub struct MemoryConnector {
    hub: SyncHub,
    tenant: String,
}

impl MemoryConnector {
    pub fn new(hub: SyncHub, tenant: impl Into<String>) -> Self {
        Self {
            hub,
            tenant: tenant.into(),
        }
    }
}

impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Connection> {
        let (connection, mut commands, replies) = Connection::pair();
        let hub = self.hub.clone();
        let tenant = self.tenant.clone();
        let mut revisions = hub.subscribe(&tenant).await;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = commands.recv() => {
                        let Some(ClientMessage::Command { id, command }) = message else {
                            break;
                        };
                        let reply = match hub.handle(&tenant, command).await {
                            Ok(response) => ServerMessage::Ack { id, response },
                            Err(error) => ServerMessage::Error { id, message: error.to_string() },
                        };
                        if replies.send(reply).await.is_err() {
                            break;
                        }
                    }
                    revision = revisions.recv() => {
                        match revision {
                            Ok(server_revision) => {
                                let push = ServerMessage::ChangesAvailable { server_revision };
                                if replies.send(push).await.is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => {}
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });

        Ok(connection)
    }
}
