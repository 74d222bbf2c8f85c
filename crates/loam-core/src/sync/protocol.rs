//! Command protocol frames exchanged between replicas and the server.
//!
//! Every frame is one JSON text message. Clients send [`ClientMessage`]s,
//! each carrying a correlation id; the server answers each with an
//! [`ServerMessage::Ack`] or [`ServerMessage::Error`] referencing that id, and
//! additionally pushes [`ServerMessage::ChangesAvailable`] whenever a tenant's
//! revision advances.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ChangeRecord, ChangesPull, ReplicaId};

/// Correlates a command with its acknowledgement.
pub type CorrelationId = Uuid;

/// Requests a replica can make.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    /// Submit a batch of outbox changes
    #[serde(rename_all = "camelCase")]
    ApplyNewChanges {
        replica_id: ReplicaId,
        changes: Vec<ChangeRecord>,
        /// Last server revision the replica has pulled
        base_revision: Option<u64>,
    },
    /// Fetch every change after a revision
    #[serde(rename_all = "camelCase")]
    GetChanges {
        last_received_remote_revision: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replica_id: Option<ReplicaId>,
    },
}

impl Command {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ApplyNewChanges { .. } => "applyNewChanges",
            Self::GetChanges { .. } => "getChanges",
        }
    }
}

/// Outcome of an `ApplyNewChanges` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApplyNewChangesResponse {
    /// Batch committed; `new_revision` is the tenant's revision after it
    Success {
        #[serde(rename = "newRevision")]
        new_revision: u64,
    },
    /// The server has changes the replica has not pulled yet
    StaleChanges,
    /// Another batch for the tenant is being ingested
    Locked,
    /// Nothing was applied; resend in batches of at most `max_batch`
    BatchTooLarge {
        #[serde(rename = "maxBatch")]
        max_batch: usize,
    },
}

/// Acknowledgement payload, shaped by the command it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandResponse {
    Applied(ApplyNewChangesResponse),
    Pull(ChangesPull),
}

/// Replica-to-server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Command { id: CorrelationId, command: Command },
}

/// Server-to-replica frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Ack {
        id: CorrelationId,
        response: CommandResponse,
    },
    Error {
        id: CorrelationId,
        message: String,
    },
    /// The tenant's change log advanced
    #[serde(rename_all = "camelCase")]
    ChangesAvailable { server_revision: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::document;
    use serde_json::json;

    #[test]
    fn test_apply_response_wire_form() {
        let success = ApplyNewChangesResponse::Success { new_revision: 1 };
        assert_eq!(
            serde_json::to_value(success).unwrap(),
            json!({"status": "success", "newRevision": 1})
        );
        assert_eq!(
            serde_json::to_value(ApplyNewChangesResponse::StaleChanges).unwrap(),
            json!({"status": "stale_changes"})
        );
        let locked: ApplyNewChangesResponse =
            serde_json::from_value(json!({"status": "locked"})).unwrap();
        assert_eq!(locked, ApplyNewChangesResponse::Locked);
        assert_eq!(
            serde_json::to_value(ApplyNewChangesResponse::BatchTooLarge { max_batch: 2 }).unwrap(),
            json!({"status": "batch_too_large", "maxBatch": 2})
        );
    }

    #[test]
    fn test_command_frame_wire_form() {
        let frame = ClientMessage::Command {
            id: Uuid::nil(),
            command: Command::GetChanges {
                last_received_remote_revision: None,
                replica_id: None,
            },
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "type": "command",
                "id": "00000000-0000-0000-0000-000000000000",
                "command": {"type": "getChanges", "lastReceivedRemoteRevision": null}
            })
        );
    }

    #[test]
    fn test_ack_payload_is_recognized_by_shape() {
        let pull = ChangesPull {
            pull_id: "p1".to_string(),
            server_revision: 1,
            changes: vec![ChangeRecord::create(
                "notes",
                "n1",
                document(json!({"title": "A"})),
            )],
        };
        let ack = ServerMessage::Ack {
            id: Uuid::nil(),
            response: CommandResponse::Pull(pull.clone()),
        };
        let text = serde_json::to_string(&ack).unwrap();
        let parsed: ServerMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, ack);

        let ack: ServerMessage = serde_json::from_value(json!({
            "type": "ack",
            "id": Uuid::nil(),
            "response": {"status": "stale_changes"}
        }))
        .unwrap();
        assert!(matches!(
            ack,
            ServerMessage::Ack {
                response: CommandResponse::Applied(ApplyNewChangesResponse::StaleChanges),
                ..
            }
        ));
    }
}
