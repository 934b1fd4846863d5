use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::plugin::DEFAULT_PLUGIN_NAME;
use crate::rpc::DEFAULT_MAX_PENDING;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),
    #[error("config parse error: {0}")]
    ParseError(String),
    #[error("config validation error: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSeConfig {
    /// Logical id of this master node
    pub node_id: String,
    pub plugin_name: String,

    // RPC settings
    pub rpc_timeout_ms: u64,
    pub max_pending_calls: usize,

    // Presence monitoring
    pub monitor_poll_interval_ms: u64,
}

impl Default for RemoteSeConfig {
    fn default() -> Self {
        Self {
            node_id: "master".to_string(),
            plugin_name: DEFAULT_PLUGIN_NAME.to_string(),
            rpc_timeout_ms: 10_000,
            max_pending_calls: DEFAULT_MAX_PENDING,
            monitor_poll_interval_ms: 500,
        }
    }
}

impl RemoteSeConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileNotFound(format!("{}: {}", path.display(), e)))?;

        let config: RemoteSeConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        info!(path = %path.display(), node = %config.node_id, "configuration loaded");
        Ok(config)
    }

    /// Defaults overlaid with `RSE_*` environment variables
    pub fn load_from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(node_id) = std::env::var("RSE_NODE_ID") {
            self.node_id = node_id;
        }
        if let Ok(name) = std::env::var("RSE_PLUGIN_NAME") {
            self.plugin_name = name;
        }
        if let Some(ms) = env_u64("RSE_RPC_TIMEOUT_MS") {
            self.rpc_timeout_ms = ms;
        }
        if let Some(ms) = env_u64("RSE_MONITOR_POLL_MS") {
            self.monitor_poll_interval_ms = ms;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "node_id must not be empty".to_string(),
            ));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "rpc_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.max_pending_calls == 0 {
            return Err(ConfigError::ValidationError(
                "max_pending_calls must be at least 1".to_string(),
            ));
        }
        if self.monitor_poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "monitor_poll_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn monitor_poll_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_poll_interval_ms)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<u64>() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(key, value = %raw, "ignoring invalid numeric setting: {}", e);
            None
        }
    }
}
