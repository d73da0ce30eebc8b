//! Byte-frame transports underneath the network adapter.
//!
//! The adapter only needs `send(frame)`, `recv()` (yielding `None` once the
//! remote side is gone) and `close()`. Two implementations:
//!
//! - [`WebSocketTransport`]: long-lived socket, binary frames, pings answered
//!   in place.
//! - [`ChannelTransport`]: an in-process pair, used for edge-hosted
//!   connections that hand frames over a queue, and for tests.

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("unexpected text frame")]
    UnexpectedText,
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(e.to_string())
    }
}

/// One bidirectional connection carrying binary frames.
pub trait Transport: Send + 'static {
    fn send(&mut self, frame: Vec<u8>) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next frame. `None` once the connection has closed. Must be cancel-safe.
    fn recv(&mut self) -> impl Future<Output = Option<Result<Vec<u8>, TransportError>>> + Send;

    /// Close our side. Idempotent.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

// ─── WebSocket ────────────────────────────────────────────────────────

/// A WebSocket stream carrying one binary frame per message.
pub struct WebSocketTransport<S> {
    ws: WebSocketStream<S>,
    closed: bool,
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self { ws, closed: false }
    }
}

/// Client-side WebSocket transport.
pub type ClientWebSocket = WebSocketTransport<MaybeTlsStream<TcpStream>>;

/// Dial `url` (`ws://` or `wss://`).
pub async fn dial_websocket(url: &str) -> Result<ClientWebSocket, TransportError> {
    let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
    log::debug!("WebSocket connected to {url}");
    Ok(WebSocketTransport::new(ws))
}

impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.ws.send(WsMessage::Binary(frame.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        if self.closed {
            return None;
        }
        loop {
            match self.ws.next().await {
                Some(Ok(WsMessage::Binary(data))) => return Some(Ok(data.into())),
                Some(Ok(WsMessage::Ping(data))) => {
                    if let Err(e) = self.ws.send(WsMessage::Pong(data)).await {
                        return Some(Err(e.into()));
                    }
                }
                Some(Ok(WsMessage::Text(_))) => return Some(Err(TransportError::UnexpectedText)),
                Some(Ok(WsMessage::Close(_))) | None => {
                    self.closed = true;
                    return None;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.ws.close(None).await {
            log::trace!("WebSocket close: {e}");
        }
    }
}

// ─── In-process channel ───────────────────────────────────────────────

/// One end of an in-process connection.
pub struct ChannelTransport {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ChannelTransport {
    /// Two connected ends.
    pub fn pair() -> (ChannelTransport, ChannelTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            ChannelTransport {
                tx: Some(a_tx),
                rx: b_rx,
            },
            ChannelTransport {
                tx: Some(b_tx),
                rx: a_rx,
            },
        )
    }
}

impl Transport for ChannelTransport {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx.send(frame).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}
