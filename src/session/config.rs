use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the stream session manager
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Upper bound for a single transport connect call (seconds)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// How often an open link is checked for silence (seconds)
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Silence after which an open link is considered dead (seconds)
    #[serde(default = "default_silence_threshold_secs")]
    pub silence_threshold_secs: u64,

    /// Keep-alive ping interval (seconds); disabled when unset
    #[serde(default)]
    pub ping_interval_secs: Option<u64>,

    /// Time allowed for a pong after a ping (seconds)
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,

    /// Payloads at least this large are decoded off the worker task
    #[serde(default = "default_offload_threshold_bytes")]
    pub offload_threshold_bytes: usize,

    /// Capacity of the decoded message channel
    #[serde(default = "default_message_buffer")]
    pub message_buffer: usize,
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_health_check_interval_secs() -> u64 {
    10
}

fn default_silence_threshold_secs() -> u64 {
    25
}

fn default_pong_timeout_secs() -> u64 {
    10
}

fn default_offload_threshold_bytes() -> usize {
    64 * 1024
}

fn default_message_buffer() -> usize {
    256
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn silence_threshold(&self) -> Duration {
        Duration::from_secs(self.silence_threshold_secs)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs.max(1))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            silence_threshold_secs: default_silence_threshold_secs(),
            ping_interval_secs: None,
            pong_timeout_secs: default_pong_timeout_secs(),
            offload_threshold_bytes: default_offload_threshold_bytes(),
            message_buffer: default_message_buffer(),
        }
    }
}
