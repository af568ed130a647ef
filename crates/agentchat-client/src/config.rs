//! Client configuration.
//!
//! Values come from defaults, then an optional TOML file, then the
//! `AGENTCHAT_API_URL` / `AGENTCHAT_WS_URL` environment variables.

use std::path::Path;
use std::time::Duration;

use agentchat_core::{ReconnectPolicy, UploadLimits};
use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_API_URL: &str = "http://localhost:8000/api";
pub const DEFAULT_WS_URL: &str = "ws://localhost:8000/ws";

pub const API_URL_ENV: &str = "AGENTCHAT_API_URL";
pub const WS_URL_ENV: &str = "AGENTCHAT_WS_URL";

/// Everything the clients and the connection manager need to know.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// HTTP origin for login, upload and model endpoints.
    pub api_url: String,
    /// Duplex channel URL.
    pub ws_url: String,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    /// Keep retrying in the background when the first open fails.
    pub retry_initial_connect: bool,
    /// Ping interval while connected; `0` disables heartbeats.
    pub heartbeat_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub upload: UploadLimits,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            reconnect_attempts: ReconnectPolicy::DEFAULT_MAX_ATTEMPTS,
            reconnect_delay_ms: ReconnectPolicy::DEFAULT_BASE_DELAY.as_millis() as u64,
            retry_initial_connect: false,
            heartbeat_interval_ms: 30_000,
            connect_timeout_ms: 10_000,
            upload: UploadLimits::default(),
        }
    }
}

impl ClientConfig {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Load from a TOML file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&text)?.with_env_overrides())
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup; blank values are ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = get(API_URL_ENV) {
            self.api_url = url;
        }
        if let Some(url) = get(WS_URL_ENV) {
            self.ws_url = url;
        }
        self
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            self.reconnect_attempts,
            Duration::from_millis(self.reconnect_delay_ms),
        )
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Join an endpoint path onto the API origin.
    pub fn api_endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}
