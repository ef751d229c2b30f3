//! WebSocket carrier for the lobby and host endpoints.
//!
//! [`WebSocketTransport`] carries JSON text frames over one WebSocket
//! connection; [`WebSocketConnector`] opens a fresh one per (re)connect
//! attempt. Both `ws://` and `wss://` URLs are supported.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), trivia_session::TriviaError> {
//! use trivia_session::{Transport, WebSocketTransport};
//!
//! let mut transport = WebSocketTransport::connect("ws://localhost:5000/sihost").await?;
//! transport.send(r#"{"type":"ping"}"#.to_string()).await?;
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::error::TriviaError;
use crate::transport::{Connector, Transport};

/// Default timeout for opening a WebSocket connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Stream type produced by `connect_async`, plain or TLS.
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`Transport`] backed by a WebSocket connection.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) is cancel-safe: dropping its future before it
/// completes does not lose a frame.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Perform the WebSocket handshake against `url`.
    ///
    /// # Errors
    ///
    /// Returns [`TriviaError::AuthenticationRequired`] when the server answers
    /// the upgrade request with HTTP 401, and [`TriviaError::Io`] for any other
    /// failure (the I/O [`ErrorKind`](std::io::ErrorKind) is preserved when
    /// available).
    pub async fn connect(url: &str) -> Result<Self, TriviaError> {
        tracing::debug!(%url, "opening websocket");

        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(map_handshake_error)?;

        tracing::info!(%url, "websocket open");

        Ok(Self::from_stream(stream))
    }

    /// Create a [`WebSocketTransport`] from an already-established stream.
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }

    /// [`connect`](Self::connect), bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`TriviaError::Timeout`] if the deadline elapses, or any error
    /// that [`connect`](Self::connect) may return.
    pub async fn connect_with_timeout(url: &str, timeout: Duration) -> Result<Self, TriviaError> {
        tokio::time::timeout(timeout, Self::connect(url))
            .await
            .map_err(|_| TriviaError::Timeout)?
    }
}

fn map_handshake_error(e: tokio_tungstenite::tungstenite::Error) -> TriviaError {
    use tokio_tungstenite::tungstenite::Error;

    match e {
        Error::Http(response) if response.status().as_u16() == 401 => {
            TriviaError::AuthenticationRequired
        }
        Error::Io(io) => TriviaError::Io(io),
        other => TriviaError::Io(std::io::Error::other(other)),
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: String) -> Result<(), TriviaError> {
        if self.closed {
            return Err(TriviaError::TransportClosed);
        }
        self.stream
            .send(Message::Text(message.into()))
            .await
            .map_err(|e| TriviaError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TriviaError>> {
        while let Some(next) = self.stream.next().await {
            match next {
                Err(e) => return Some(Err(TriviaError::TransportReceive(e.to_string()))),
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "peer closed websocket");
                    return None;
                }
                Ok(Message::Binary(bytes)) => {
                    tracing::warn!(len = bytes.len(), "ignoring binary frame on a JSON channel");
                }
                // tungstenite queues the pong reply itself.
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            }
        }
        None
    }

    async fn close(&mut self) -> Result<(), TriviaError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        self.stream
            .close(None)
            .await
            .map_err(|e| TriviaError::TransportSend(e.to_string()))
    }
}

/// [`Connector`] that opens a [`WebSocketTransport`] per attempt.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Create a connector with the default 15 second connect timeout.
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set the timeout applied to each connection attempt.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, uri: &str) -> Result<Box<dyn Transport>, TriviaError> {
        let transport = WebSocketTransport::connect_with_timeout(uri, self.connect_timeout).await?;
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn serve_one<F, Fut>(handler: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });

        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn connect_fails_with_unreachable_host() {
        let err = WebSocketTransport::connect("ws://127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, TriviaError::Io(_)));
    }

    #[tokio::test]
    async fn unauthorized_upgrade_maps_to_authentication_required() {
        use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
        use tokio_tungstenite::tungstenite::http;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let reject = |_req: &Request, _resp: Response| -> Result<Response, ErrorResponse> {
                Err(http::Response::builder()
                    .status(http::StatusCode::UNAUTHORIZED)
                    .body(None)
                    .unwrap())
            };
            let _ = tokio_tungstenite::accept_hdr_async(tcp, reject).await;
        });

        let err = WebSocketTransport::connect(&format!("ws://{addr}/sionline"))
            .await
            .unwrap_err();
        assert!(matches!(err, TriviaError::AuthenticationRequired));
    }

    #[tokio::test]
    async fn connector_opens_working_transport() {
        let url = serve_one(|mut ws| async move {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                ws.send(Message::Text(text)).await.unwrap();
            }
            ws.close(None).await.unwrap();
        })
        .await;

        let connector = WebSocketConnector::new().with_connect_timeout(Duration::from_secs(2));
        let mut transport = connector.connect(&url).await.unwrap();
        transport.send(r#"{"type":"ping"}"#.to_string()).await.unwrap();

        let echoed = transport.recv().await.unwrap().unwrap();
        assert_eq!(echoed, r#"{"type":"ping"}"#);
    }

    #[tokio::test]
    async fn recv_skips_binary_frames_and_stops_on_close() {
        let url = serve_one(|mut ws| async move {
            ws.send(Message::Binary(vec![0xDE, 0xAD].into())).await.unwrap();
            ws.send(Message::Text("after_binary".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().unwrap(), "after_binary");
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_after_close_returns_transport_closed() {
        let url = serve_one(|mut ws| async move {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let err = transport.send("late".to_string()).await.unwrap_err();
        assert!(matches!(err, TriviaError::TransportClosed));
    }
}
