use crate::{
    error::{BridgeError, BridgeResult},
    retry::RetryPolicy,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-server connection configuration.
///
/// Immutable while a session is live; changed only through the instance's
/// edit operation, which tears down and rebuilds the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Remote endpoint URL.
    pub url: String,
    #[serde(default)]
    pub username: String,
    /// Write-only: accepted from config/edit, never echoed back.
    #[serde(default, skip_serializing)]
    pub password: String,
    #[serde(default = "ConnectionConfig::default_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "ConnectionConfig::default_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Change-poll cadence in seconds; clamped to a 1-second minimum.
    #[serde(default = "ConnectionConfig::default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "ConnectionConfig::default_enabled")]
    pub enabled: bool,
    /// Connection-pool hint persisted for the remote transport.
    #[serde(default = "ConnectionConfig::default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl ConnectionConfig {
    fn default_timeout_secs() -> u64 {
        60
    }

    fn default_poll_interval_secs() -> u64 {
        5
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_max_connections() -> u32 {
        5
    }

    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: String::new(),
            password: String::new(),
            connect_timeout_secs: Self::default_timeout_secs(),
            read_timeout_secs: Self::default_timeout_secs(),
            poll_interval_secs: Self::default_poll_interval_secs(),
            enabled: true,
            max_connections: Self::default_max_connections(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if self.url.trim().is_empty() {
            return Err(BridgeError::Configuration("url must not be empty".into()));
        }
        if self.max_connections < 1 {
            return Err(BridgeError::Configuration(format!(
                "maxConnections must be >= 1: {}",
                self.max_connections
            )));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}
