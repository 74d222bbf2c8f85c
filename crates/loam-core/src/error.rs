//! Error types for loam-core

use thiserror::Error;

use crate::models::ChangeId;

/// Result type alias using loam-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in loam-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A change sequence broke a change-log invariant
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    /// Connection to the server failed or was closed
    #[error("Transport error: {0}")]
    Transport(String),

    /// A command was not acknowledged in time, after all retries
    #[error("Command timed out after {attempts} attempt(s)")]
    Timeout { attempts: u32 },

    /// The peer answered with something the protocol does not allow
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Change-log invariant violations.
///
/// These are fatal for the affected entity only: callers log them and quarantine
/// the entity rather than writing a half-built snapshot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("duplicate create for {table}/{key} (change {change_id})")]
    DuplicateCreate {
        table: String,
        key: String,
        change_id: ChangeId,
    },

    #[error("{kind} for {table}/{key} without a prior create (change {change_id})")]
    MissingCreate {
        table: String,
        key: String,
        kind: &'static str,
        change_id: ChangeId,
    },

    #[error("conflicting create for {table}/{key} on both sides of a pull")]
    CreateCollision { table: String, key: String },

    #[error("change {change_id} targets {table}/{key}, expected {expected_table}/{expected_key}")]
    ForeignChange {
        table: String,
        key: String,
        expected_table: String,
        expected_key: String,
        change_id: ChangeId,
    },
}

impl InvariantViolation {
    /// `(table, key)` of the entity the violation is about.
    pub fn entity(&self) -> (&str, &str) {
        match self {
            Self::DuplicateCreate { table, key, .. }
            | Self::MissingCreate { table, key, .. }
            | Self::CreateCollision { table, key }
            | Self::ForeignChange {
                expected_table: table,
                expected_key: key,
                ..
            } => (table, key),
        }
    }
}

impl Error {
    /// Whether the failure came from the connection rather than from local state.
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout { .. })
    }
}
