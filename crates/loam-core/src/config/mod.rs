//! Replica configuration.
//!
//! Built either with the `with_*` methods from [`ReplicaConfig::default`] or
//! from `LOAM_*` environment variables via [`ReplicaConfig::from_env`].

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::sync::{RetryPolicy, WsConnector};
use crate::util::{is_server_url, normalize_text_option, parse_in_range};

const DEFAULT_TENANT: &str = "default";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for crate::Error {
    fn from(error: ConfigError) -> Self {
        Self::Config(error.to_string())
    }
}

/// Settings for one replica's change capture and synchronizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaConfig {
    /// Server base URL (`http(s)://` or `ws(s)://`); `None` runs offline only
    pub server_url: Option<String>,
    pub tenant: String,
    /// Idle window before captured writes trigger a sync step
    pub debounce: Duration,
    /// Capacity of the debounce queue
    pub debounce_queue: usize,
    pub command_timeout: Duration,
    pub command_max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub leader_lease: Duration,
    /// Fallback sync cadence when no trigger arrives
    pub poll_interval: Duration,
    /// How often a context checks the shared database for sibling commits
    pub relay_interval: Duration,
    /// Changes per `applyNewChanges` batch
    pub max_batch: usize,
    /// Stale/locked resubmissions per step before giving up until the next one
    pub max_send_attempts: u32,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            tenant: DEFAULT_TENANT.to_string(),
            debounce: Duration::from_millis(300),
            debounce_queue: 256,
            command_timeout: Duration::from_secs(10),
            command_max_retries: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
            leader_lease: Duration::from_secs(5),
            poll_interval: Duration::from_secs(30),
            relay_interval: Duration::from_millis(100),
            max_batch: 500,
            max_send_attempts: 5,
        }
    }
}

impl ReplicaConfig {
    #[must_use]
    pub fn with_server(mut self, url: impl Into<String>, tenant: impl Into<String>) -> Self {
        self.server_url = Some(url.into());
        self.tenant = tenant.into();
        self
    }

    #[must_use]
    pub const fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    #[must_use]
    pub const fn with_command_timeout(mut self, timeout: Duration, max_retries: u32) -> Self {
        self.command_timeout = timeout;
        self.command_max_retries = max_retries;
        self
    }

    #[must_use]
    pub const fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    #[must_use]
    pub const fn with_leader_lease(mut self, lease: Duration) -> Self {
        self.leader_lease = lease;
        self
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_relay_interval(mut self, interval: Duration) -> Self {
        self.relay_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: self.command_timeout,
            max_retries: self.command_max_retries,
            backoff_base: self.backoff_base,
            backoff_max: self.backoff_max,
        }
    }

    /// WebSocket connector for the configured server, if any
    pub fn ws_connector(&self) -> Option<WsConnector> {
        self.server_url
            .as_deref()
            .map(|url| WsConnector::for_tenant(url, &self.tenant))
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let server_url = normalize_text_option(lookup("LOAM_SERVER_URL"))
            .map(|url| url.trim_end_matches('/').to_string());
        if let Some(url) = server_url.as_deref() {
            if !is_server_url(url) {
                return Err(ConfigError::Invalid(
                    "LOAM_SERVER_URL must start with http://, https://, ws:// or wss://"
                        .to_string(),
                ));
            }
        }

        let tenant = normalize_text_option(lookup("LOAM_TENANT"))
            .unwrap_or_else(|| DEFAULT_TENANT.to_string());

        let debounce_ms = parse_in_range("LOAM_DEBOUNCE_MS", lookup("LOAM_DEBOUNCE_MS"), 300u64, 10..=10_000)
            .map_err(ConfigError::Invalid)?;
        let timeout_secs = parse_in_range(
            "LOAM_COMMAND_TIMEOUT_SECS",
            lookup("LOAM_COMMAND_TIMEOUT_SECS"),
            10u64,
            1..=300,
        )
        .map_err(ConfigError::Invalid)?;
        let max_retries = parse_in_range(
            "LOAM_COMMAND_MAX_RETRIES",
            lookup("LOAM_COMMAND_MAX_RETRIES"),
            3u32,
            0..=10,
        )
        .map_err(ConfigError::Invalid)?;
        let lease_secs = parse_in_range(
            "LOAM_LEADER_LEASE_SECS",
            lookup("LOAM_LEADER_LEASE_SECS"),
            5u64,
            1..=300,
        )
        .map_err(ConfigError::Invalid)?;

        Ok(Self {
            server_url,
            tenant,
            debounce: Duration::from_millis(debounce_ms),
            command_timeout: Duration::from_secs(timeout_secs),
            command_max_retries: max_retries,
            leader_lease: Duration::from_secs(lease_secs),
            ..defaults
        })
    }
}
