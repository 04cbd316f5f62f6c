//! Connector configuration.
//!
//! One TOML file carries both the Traccar server settings and the sync core
//! sections. Every value has a default; `TRACCAR_*` and `FLEET_SYNC_*`
//! environment variables override the file.

use anyhow::{bail, Context, Result};
use fleet_sync::SyncConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Traccar server connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraccarConfig {
    /// Server root, e.g. `https://demo.traccar.org`
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub email: String,

    #[serde(default)]
    pub password: String,

    /// SQLite file holding cached snapshots
    #[serde(default = "default_snapshot_db")]
    pub snapshot_db: String,

    /// Timeout for login and REST requests (seconds)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8082".to_string()
}

fn default_snapshot_db() -> String {
    "fleet-sync.db".to_string()
}

fn default_request_timeout_secs() -> u64 {
    15
}

impl Default for TraccarConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            email: String::new(),
            password: String::new(),
            snapshot_db: default_snapshot_db(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl TraccarConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            bail!("traccar.base_url must start with http:// or https://");
        }
        if self.email.is_empty() {
            bail!("traccar.email is required (set TRACCAR_EMAIL)");
        }
        Ok(())
    }
}

/// Full connector configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub traccar: TraccarConfig,

    #[serde(flatten)]
    pub sync: SyncConfig,
}

impl AppConfig {
    /// Read `path` if it exists, otherwise start from defaults, then apply
    /// environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path))?;
            toml::from_str::<AppConfig>(&contents)
                .with_context(|| format!("Invalid config {}", path))?
        } else {
            info!(path = %path, "Config file not found, using defaults");
            AppConfig::default()
        };

        config.apply_env();
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("TRACCAR_URL") {
            self.traccar.base_url = value.trim_end_matches('/').to_string();
        }
        if let Some(value) = lookup("TRACCAR_EMAIL") {
            self.traccar.email = value;
        }
        if let Some(value) = lookup("TRACCAR_PASSWORD") {
            self.traccar.password = value;
        }
        if let Some(value) = lookup("TRACCAR_SNAPSHOT_DB") {
            self.traccar.snapshot_db = value;
        }
        self.sync.apply_overrides(&lookup);
    }
}
