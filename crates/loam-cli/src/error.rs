use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] loam_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Expected a JSON object, got: {0}")]
    NotAnObject(String),
    #[error("{0} cannot be empty")]
    EmptyIdentifier(&'static str),
    #[error("Record not found: {0}")]
    RecordNotFound(String),
    #[error("Expected TABLE/ID, got: {0}")]
    BadEntityRef(String),
    #[error("Another process holds the sync lease; try again or stop the running daemon")]
    LeaseBusy,
    #[error("Sync is not configured. Set LOAM_SERVER_URL or pass --server-url to enable `loam sync`.")]
    SyncNotConfigured,
}

impl From<loam_core::ConfigError> for CliError {
    fn from(error: loam_core::ConfigError) -> Self {
        Self::Config(error.to_string())
    }
}
