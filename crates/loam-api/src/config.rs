use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use loam_core::server::DEFAULT_MAX_BATCH;
use loam_core::util::{normalize_text_option, parse_in_range};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub db_path: PathBuf,
    /// Largest `applyNewChanges` batch accepted
    pub max_batch: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "LOAM_API_BIND_ADDR", "127.0.0.1:8080");
        let db_path = PathBuf::from(value_or_default(
            &lookup,
            "LOAM_API_DB_PATH",
            "loam-server.db",
        ));
        let max_batch = parse_in_range(
            "LOAM_API_MAX_BATCH",
            lookup("LOAM_API_MAX_BATCH"),
            DEFAULT_MAX_BATCH,
            1..=10_000,
        )
        .map_err(ConfigError::Invalid)?;

        Ok(Self {
            bind_addr,
            db_path,
            max_batch,
        })
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    normalize_text_option(lookup(name)).unwrap_or_else(|| default.to_string())
}
