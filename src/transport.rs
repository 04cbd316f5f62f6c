//! Boundaries to the outside world.
//!
//! The sync core only talks to the server through these traits, so any
//! socket or HTTP implementation can be plugged in at startup.

use crate::error::TransportError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio::sync::mpsc;

/// A frame on a bidirectional message stream
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// An open stream connection.
///
/// Dropping both halves closes the connection. Sending [`Frame::Close`]
/// asks the peer to close gracefully.
pub struct Connection {
    pub inbound: BoxStream<'static, Result<Frame, TransportError>>,
    pub outbound: mpsc::Sender<Frame>,
}

impl Connection {
    pub fn new(
        inbound: BoxStream<'static, Result<Frame, TransportError>>,
        outbound: mpsc::Sender<Frame>,
    ) -> Self {
        Self { inbound, outbound }
    }
}

/// Strategy for opening the push stream
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new connection. Each call yields an independent connection.
    async fn connect(&self) -> Result<Connection, TransportError>;

    /// Short name for logs (e.g. "websocket")
    fn name(&self) -> &str;
}

/// Pull-based access to the server REST API
#[async_trait]
pub trait RestClient: Send + Sync {
    /// `GET path?params` returning the decoded JSON body.
    ///
    /// Callers bound the call with their own timeout; dropping the future
    /// cancels the request.
    async fn get(&self, path: &str, params: &[(String, String)]) -> Result<Value, TransportError>;
}
