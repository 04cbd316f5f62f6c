use crate::api::TraccarClient;
use async_trait::async_trait;
use fleet_sync::{Connection, Frame, Transport, TransportError};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, warn};

/// Outbound frames queued ahead of the socket writer
const OUTBOUND_BUFFER: usize = 32;

/// Push stream over the Traccar `/api/socket` WebSocket.
///
/// Every connect opens a fresh cookie session first, so an expired session
/// is renewed on reconnect.
pub struct WebSocketTransport {
    client: Arc<TraccarClient>,
}

impl WebSocketTransport {
    pub fn new(client: Arc<TraccarClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<Connection, TransportError> {
        let cookie = self.client.login().await?;
        let url = self.client.socket_url()?;
        open_socket(&url, Some(&cookie)).await
    }

    fn name(&self) -> &str {
        "websocket"
    }
}

/// Open a WebSocket and split it into inbound frames and an outbound sender.
///
/// The writer task ends when the outbound sender is dropped or a close
/// frame has been written.
pub(crate) async fn open_socket(
    url: &str,
    cookie: Option<&str>,
) -> Result<Connection, TransportError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
    if let Some(cookie) = cookie {
        let value = HeaderValue::from_str(cookie)
            .map_err(|e| TransportError::Unauthorized(format!("invalid session cookie: {}", e)))?;
        request.headers_mut().insert(COOKIE, value);
    }

    let (stream, _response) = connect_async(request).await.map_err(map_ws_error)?;
    debug!(url = %url, "WebSocket open");

    let (mut sink, source) = stream.split();
    let (outbound, mut outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_BUFFER);

    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let closing = frame == Frame::Close;
            if let Err(e) = sink.send(to_message(frame)).await {
                debug!(error = %e, "WebSocket write failed");
                return;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let inbound = source
        .filter_map(|message| async move {
            match message {
                Ok(message) => from_message(message).map(Ok),
                Err(e) => Some(Err(map_ws_error(e))),
            }
        })
        .boxed();

    Ok(Connection::new(inbound, outbound))
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data.into()),
        Frame::Ping(data) => Message::Ping(data.into()),
        Frame::Pong(data) => Message::Pong(data.into()),
        Frame::Close => Message::Close(None),
    }
}

fn from_message(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text.to_string())),
        Message::Binary(data) => Some(Frame::Binary(data.to_vec())),
        Message::Ping(data) => Some(Frame::Ping(data.to_vec())),
        Message::Pong(data) => Some(Frame::Pong(data.to_vec())),
        Message::Close(_) => Some(Frame::Close),
        // Raw frames only surface when writing, never on read
        Message::Frame(_) => None,
    }
}

fn map_ws_error(e: tungstenite::Error) -> TransportError {
    match e {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            warn!(status = status, "WebSocket handshake rejected");
            TransportError::from_status(status, "websocket handshake rejected")
        }
        tungstenite::Error::Url(e) => TransportError::InvalidEndpoint(e.to_string()),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Closed(None)
        }
        other => TransportError::Io(other.to_string()),
    }
}
