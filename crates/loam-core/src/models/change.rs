//! Change record model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::util::unix_millis_now;

/// A JSON document (or a partial one, for update payloads).
pub type Document = Map<String, Value>;

/// Identity of a single change, using UUID v7 (time-sortable)
///
/// This is not the entity id: one entity accumulates many changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeId(Uuid);

impl ChangeId {
    /// Create a new unique change ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ChangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChangeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Stable random identity of one replica.
///
/// Used to recognise a replica's own changes when the server echoes them back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaId(Uuid);

impl ReplicaId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ReplicaId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ReplicaId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The mutation carried by a change record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChangeOp {
    /// Full entity document
    Create { obj: Document },
    /// Changed fields only: their values before and after the edit
    Update { from: Document, to: Document },
    /// Tombstone the entity
    Delete,
}

impl ChangeOp {
    /// Short name used in logs and error messages
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete => "delete",
        }
    }
}

/// One captured mutation of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Change identity
    pub id: ChangeId,
    /// Table the entity lives in
    pub table: String,
    /// Entity id
    pub key: String,
    /// Capture time on the originating replica (Unix ms)
    pub timestamp: i64,
    /// Execution context that captured the change, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_window: Option<String>,
    /// Set while replaying changes received from the server
    #[serde(default)]
    pub originates_from_remote: bool,
    /// Server-assigned, strictly increasing per tenant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    /// Pull the change was delivered in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_id: Option<String>,
    /// Replica that submitted the change (stamped by the server)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_replica: Option<ReplicaId>,
    #[serde(flatten)]
    pub op: ChangeOp,
}

impl ChangeRecord {
    fn with_op(table: impl Into<String>, key: impl Into<String>, op: ChangeOp) -> Self {
        Self {
            id: ChangeId::new(),
            table: table.into(),
            key: key.into(),
            timestamp: unix_millis_now(),
            origin_window: None,
            originates_from_remote: false,
            revision: None,
            pull_id: None,
            source_replica: None,
            op,
        }
    }

    /// A new `Create` change
    #[must_use]
    pub fn create(table: impl Into<String>, key: impl Into<String>, obj: Document) -> Self {
        Self::with_op(table, key, ChangeOp::Create { obj })
    }

    /// A new `Update` change
    #[must_use]
    pub fn update(
        table: impl Into<String>,
        key: impl Into<String>,
        from: Document,
        to: Document,
    ) -> Self {
        Self::with_op(table, key, ChangeOp::Update { from, to })
    }

    /// A new `Delete` change
    #[must_use]
    pub fn delete(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self::with_op(table, key, ChangeOp::Delete)
    }

    /// Tag the change with the capturing execution context
    #[must_use]
    pub fn with_origin_window(mut self, window: Option<String>) -> Self {
        self.origin_window = window;
        self
    }

    /// `(table, key)` pair identifying the entity
    pub fn entity(&self) -> (&str, &str) {
        (&self.table, &self.key)
    }

    pub const fn is_delete(&self) -> bool {
        matches!(self.op, ChangeOp::Delete)
    }
}

/// Build a [`Document`] from a JSON object literal.
///
/// Non-object values yield an empty document.
pub fn document(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}
