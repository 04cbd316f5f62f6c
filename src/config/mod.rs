pub mod runtime;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use crate::backoff::BackoffConfig;
pub use crate::cache::CacheConfig;
pub use crate::delta::DeltaConfig;
pub use crate::poller::PollerConfig;
pub use crate::session::SessionConfig;

/// Complete sync core configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub delta: DeltaConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Sync engine wiring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Poll results are dropped for this long after the stream (re)connects (milliseconds)
    #[serde(default = "default_suppression_window_ms")]
    pub suppression_window_ms: u64,

    /// Capacity of the diff broadcast channel
    #[serde(default = "default_diff_channel_capacity")]
    pub diff_channel_capacity: usize,

    /// Capacity of the poll batch channel
    #[serde(default = "default_poll_batch_buffer")]
    pub poll_batch_buffer: usize,

    /// REST path listing devices, fetched once at startup
    #[serde(default = "default_devices_path")]
    pub devices_path: String,
}

fn default_suppression_window_ms() -> u64 {
    3_000
}

fn default_diff_channel_capacity() -> usize {
    64
}

fn default_poll_batch_buffer() -> usize {
    16
}

fn default_devices_path() -> String {
    "/api/devices".to_string()
}

impl EngineConfig {
    pub fn suppression_window(&self) -> Duration {
        Duration::from_millis(self.suppression_window_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            suppression_window_ms: default_suppression_window_ms(),
            diff_channel_capacity: default_diff_channel_capacity(),
            poll_batch_buffer: default_poll_batch_buffer(),
            devices_path: default_devices_path(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<SyncConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path))?;
    let config: SyncConfig =
        toml::from_str(&contents).with_context(|| format!("Invalid config {}", path))?;
    Ok(config)
}
