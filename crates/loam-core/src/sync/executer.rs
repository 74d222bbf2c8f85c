//! Request/acknowledgement layer over a [`Connection`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::protocol::{ClientMessage, Command, CommandResponse, CorrelationId, ServerMessage};
use super::transport::Connection;
use super::trigger::SyncTrigger;

/// Timeout and backoff for one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How long to wait for each acknowledgement
    pub timeout: Duration,
    /// Resends after the first attempt
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before resend number `attempt` (1-based): base, 2x base, 4x base, ... capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

type Pending = Arc<Mutex<HashMap<CorrelationId, oneshot::Sender<Result<CommandResponse>>>>>;

/// Sends commands and matches acknowledgements by correlation id.
///
/// Server pushes (`changesAvailable`) are turned into sync requests on the
/// given trigger. Once the connection drops, every waiting and future command
/// fails with [`Error::Transport`]; the owner is expected to reconnect.
pub struct CommandExecuter {
    outgoing: mpsc::Sender<ClientMessage>,
    pending: Pending,
    policy: RetryPolicy,
    dispatcher: JoinHandle<()>,
}

impl CommandExecuter {
    pub fn start(connection: Connection, policy: RetryPolicy, pushes: SyncTrigger) -> Self {
        let Connection { outgoing, incoming } = connection;
        let pending: Pending = Arc::default();
        let dispatcher = tokio::spawn(dispatch(incoming, pending.clone(), pushes));
        Self {
            outgoing,
            pending,
            policy,
            dispatcher,
        }
    }

    /// Whether the connection is still up
    pub fn is_connected(&self) -> bool {
        !self.dispatcher.is_finished() && !self.outgoing.is_closed()
    }

    /// Send `command` and wait for its acknowledgement.
    ///
    /// A timed-out attempt is abandoned, not cancelled: the same correlation
    /// id is resent after a backoff, so a late acknowledgement still counts.
    /// Returns [`Error::Timeout`] once all retries are spent.
    pub async fn execute(&self, command: Command) -> Result<CommandResponse> {
        let id = Uuid::new_v4();
        let attempts = self.policy.max_retries + 1;

        for attempt in 1..=attempts {
            let (sender, receiver) = oneshot::channel();
            self.pending.lock().await.insert(id, sender);

            let frame = ClientMessage::Command {
                id,
                command: command.clone(),
            };
            if self.outgoing.send(frame).await.is_err() {
                self.pending.lock().await.remove(&id);
                return Err(Error::Transport("connection closed".to_string()));
            }

            match tokio::time::timeout(self.policy.timeout, receiver).await {
                Ok(Ok(result)) => return result,
                Ok(Err(_)) => {
                    return Err(Error::Transport(
                        "connection closed while awaiting acknowledgement".to_string(),
                    ));
                }
                Err(_) => {
                    self.pending.lock().await.remove(&id);
                    tracing::warn!(
                        command = command.name(),
                        %id,
                        attempt,
                        "Command not acknowledged in time"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.backoff(attempt)).await;
                    }
                }
            }
        }

        Err(Error::Timeout { attempts })
    }
}

impl Drop for CommandExecuter {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch(mut incoming: mpsc::Receiver<ServerMessage>, pending: Pending, pushes: SyncTrigger) {
    while let Some(message) = incoming.recv().await {
        match message {
            ServerMessage::Ack { id, response } => complete(&pending, id, Ok(response)).await,
            ServerMessage::Error { id, message } => {
                complete(&pending, id, Err(Error::Protocol(message))).await;
            }
            ServerMessage::ChangesAvailable { server_revision } => {
                tracing::debug!(revision = server_revision, "Server announced new changes");
                pushes.request();
            }
        }
    }

    tracing::debug!("Connection closed, failing pending commands");
    // Dropping the senders wakes every waiter with a closed-channel error.
    pending.lock().await.clear();
}

async fn complete(pending: &Pending, id: CorrelationId, result: Result<CommandResponse>) {
    match pending.lock().await.remove(&id) {
        Some(waiter) => {
            let _ = waiter.send(result);
        }
        None => tracing::debug!(%id, "Dropping acknowledgement for abandoned command"),
    }
}
