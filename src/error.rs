use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// How a failure is treated by the sync core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeouts, resets, 502/503/504. Retried per the backoff policy.
    Transient,
    /// Unparseable or unexpected frame. Dropped per message.
    MalformedPayload,
    /// Retry budget exhausted, circuit breaker open.
    PersistentFailure,
    /// Invalid endpoint or rejected credentials. Never retried automatically.
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::MalformedPayload => write!(f, "malformed_payload"),
            ErrorKind::PersistentFailure => write!(f, "persistent_failure"),
            ErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// Errors raised by transport and REST implementations
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    Timeout,
    Closed(Option<String>),
    Io(String),
    Http { status: u16, message: String },
    Unauthorized(String),
    InvalidEndpoint(String),
}

impl TransportError {
    /// Build an error from an HTTP status code
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => TransportError::Unauthorized(message),
            _ => TransportError::Http { status, message },
        }
    }

    /// Classify for retry decisions
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Timeout | TransportError::Closed(_) | TransportError::Io(_) => {
                ErrorKind::Transient
            }
            TransportError::Http { status, .. } => match status {
                408 | 429 | 500..=599 => ErrorKind::Transient,
                _ => ErrorKind::Fatal,
            },
            TransportError::Unauthorized(_) | TransportError::InvalidEndpoint(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "operation timed out"),
            TransportError::Closed(Some(reason)) => write!(f, "connection closed: {}", reason),
            TransportError::Closed(None) => write!(f, "connection closed"),
            TransportError::Io(msg) => write!(f, "transport error: {}", msg),
            TransportError::Http { status, message } => {
                write!(f, "HTTP {}: {}", status, message)
            }
            TransportError::Unauthorized(msg) => write!(f, "unauthorized: {}", msg),
            TransportError::InvalidEndpoint(msg) => write!(f, "invalid endpoint: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

/// A frame that could not be turned into a stream message
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    InvalidJson(String),
    NotAnObject,
    InvalidField { field: &'static str, reason: String },
    Binary,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::InvalidJson(e) => write!(f, "invalid JSON: {}", e),
            DecodeError::NotAnObject => write!(f, "payload must be a JSON object"),
            DecodeError::InvalidField { field, reason } => {
                write!(f, "invalid '{}' field: {}", field, reason)
            }
            DecodeError::Binary => write!(f, "binary frames are not supported"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Last failure recorded on a connection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

impl From<&TransportError> for Failure {
    fn from(err: &TransportError) -> Self {
        Failure::new(err.kind(), err.to_string())
    }
}
