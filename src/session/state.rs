use crate::error::Failure;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Connection lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Retrying,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Retrying => write!(f, "retrying"),
        }
    }
}

/// Observable state of the stream session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,

    /// Consecutive failed attempts; reset on a confirmed connection
    pub retry_count: u32,

    pub last_error: Option<Failure>,

    /// Last time a connection was confirmed by a valid message
    pub last_connected_at: Option<DateTime<Utc>>,

    /// Last time a valid message arrived
    pub last_event_at: Option<DateTime<Utc>>,

    /// Retry budget exhausted; waiting out the cooldown
    pub circuit_open: bool,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// Disconnected because of a fatal error; needs user action
    pub fn is_fatal(&self) -> bool {
        self.status == ConnectionStatus::Disconnected
            && self
                .last_error
                .as_ref()
                .map(|e| e.kind == crate::error::ErrorKind::Fatal)
                .unwrap_or(false)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            retry_count: 0,
            last_error: None,
            last_connected_at: None,
            last_event_at: None,
            circuit_open: false,
        }
    }
}
