use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

use crate::watcher::WatchConfig;

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub watcher: WatchConfig,
}

/// Per-runtime switches
#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Log lifecycle chatter such as "Module X updated!"
    pub logging: bool,
    /// Silence fallback warnings (errors are always logged)
    pub suppress_warnings: bool,
    /// Never subscribe imported units with the watcher
    pub watch_disabled: bool,
    /// Upper bound for a single generate or execute step
    pub transition_timeout_ms: Option<u64>,
}

impl RuntimeConfig {
    pub fn with_logging(mut self, logging: bool) -> Self {
        self.logging = logging;
        self
    }

    pub fn with_suppress_warnings(mut self, suppress: bool) -> Self {
        self.suppress_warnings = suppress;
        self
    }

    pub fn with_watch_disabled(mut self, disabled: bool) -> Self {
        self.watch_disabled = disabled;
        self
    }

    pub fn with_transition_timeout(mut self, timeout: Duration) -> Self {
        self.transition_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn transition_timeout(&self) -> Option<Duration> {
        self.transition_timeout_ms.map(Duration::from_millis)
    }
}

impl Config {
    pub async fn load(path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(path);
        info!("📄 Reading config from: {}", expanded_path);

        let content = fs::read_to_string(expanded_path.as_ref())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", expanded_path, e))?;

        let config = Self::from_toml_str(&content)?;
        debug!(
            "📋 Config loaded: logging={}, watch_disabled={}, debounce={}ms",
            config.runtime.logging, config.runtime.watch_disabled, config.watcher.debounce_ms
        );

        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))
    }

    /// `<config dir>/hotmod/hotmod.toml`, when the platform has a config dir
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("hotmod").join("hotmod.toml"))
    }
}
