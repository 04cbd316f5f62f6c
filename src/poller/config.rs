use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the fallback poller
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Interval after a poll that returned new data (seconds)
    #[serde(default = "default_base_interval_secs")]
    pub base_interval_secs: u64,

    /// Upper bound for the adaptive interval (seconds)
    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: u64,

    /// Jitter applied to each sleep (0.1 = ±10%)
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Upper bound for a single REST call (seconds)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// REST path returning the latest positions
    #[serde(default = "default_positions_path")]
    pub positions_path: String,
}

fn default_base_interval_secs() -> u64 {
    10
}

fn default_max_interval_secs() -> u64 {
    120
}

fn default_jitter() -> f64 {
    0.1
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_positions_path() -> String {
    "/api/positions".to_string()
}

impl PollerConfig {
    pub fn base_interval(&self) -> Duration {
        Duration::from_secs(self.base_interval_secs.max(1))
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_secs).max(self.base_interval())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            base_interval_secs: default_base_interval_secs(),
            max_interval_secs: default_max_interval_secs(),
            jitter: default_jitter(),
            request_timeout_secs: default_request_timeout_secs(),
            positions_path: default_positions_path(),
        }
    }
}
