use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the snapshot cache
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries older than this are treated as absent (seconds)
    #[serde(default = "default_staleness_window_secs")]
    pub staleness_window_secs: u64,

    /// Interval between background sweeps (seconds)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Maximum number of entries kept in memory
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Key prefix in the persistence store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_staleness_window_secs() -> u64 {
    30 * 60
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_max_entries() -> usize {
    5_000
}

fn default_key_prefix() -> String {
    "snapshot:".to_string()
}

impl CacheConfig {
    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.staleness_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            staleness_window_secs: default_staleness_window_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_entries: default_max_entries(),
            key_prefix: default_key_prefix(),
        }
    }
}
