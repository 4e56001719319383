use crate::console_paths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Console settings, loaded from `~/.forge-console/config.yaml`.
///
/// Every field has a default so a missing or partial file still yields a
/// working configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsoleConfig {
    /// Base URL of the forge backend.
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Seconds between reconciliation polls. Clamped to 2..=5 when used.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Consecutive 404 polls before the session is considered gone.
    #[serde(default = "default_poll_vanish_threshold")]
    pub poll_vanish_threshold: u32,
    /// Seconds to wait before re-opening a dropped event stream.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    /// Show debug-level journal lines in the console output.
    #[serde(default)]
    pub show_debug: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            poll_interval_secs: default_poll_interval_secs(),
            poll_vanish_threshold: default_poll_vanish_threshold(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            show_debug: false,
        }
    }
}

fn default_server_url() -> String {
    "http://localhost:8787".to_string()
}

fn default_poll_interval_secs() -> u64 {
    4
}

fn default_poll_vanish_threshold() -> u32 {
    3
}

fn default_reconnect_delay_secs() -> u64 {
    2
}

/// Poll cadence bounds. Faster hammers the backend; slower leaves the view
/// stale for too long after a stream drop.
const POLL_INTERVAL_RANGE: std::ops::RangeInclusive<u64> = 2..=5;

impl ConsoleConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file as YAML: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the default config file, falling back to defaults when it does
    /// not exist.
    pub fn load_or_default() -> Result<Self> {
        let path = console_paths::default_config_path()?;
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            anyhow::bail!("server_url must not be empty");
        }
        if self.poll_vanish_threshold == 0 {
            anyhow::bail!("poll_vanish_threshold must be at least 1");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        let secs = self
            .poll_interval_secs
            .clamp(*POLL_INTERVAL_RANGE.start(), *POLL_INTERVAL_RANGE.end());
        Duration::from_secs(secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}
