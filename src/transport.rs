//! How the client reaches the lobby and game host endpoints.
//!
//! A [`Transport`] moves whole JSON documents in both directions over one live
//! connection. Framing belongs to the implementation: WebSocket text frames in
//! production, in-process channels in tests.
//!
//! A [`ConnectionHandle`](crate::connection::ConnectionHandle) outlives any
//! single transport. When the link drops it asks its [`Connector`] for a new
//! one, so a connector is a factory keyed by URI rather than a socket.
//!
//! # Plugging in another carrier
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use tokio::sync::mpsc;
//! use trivia_session::error::TriviaError;
//! use trivia_session::transport::Transport;
//!
//! struct ChannelTransport {
//!     outgoing: mpsc::UnboundedSender<String>,
//!     incoming: mpsc::UnboundedReceiver<String>,
//! }
//!
//! #[async_trait]
//! impl Transport for ChannelTransport {
//!     async fn send(&mut self, message: String) -> Result<(), TriviaError> {
//!         self.outgoing
//!             .send(message)
//!             .map_err(|e| TriviaError::TransportSend(e.to_string()))
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, TriviaError>> {
//!         self.incoming.recv().await.map(Ok)
//!     }
//!
//!     async fn close(&mut self) -> Result<(), TriviaError> {
//!         self.incoming.close();
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::TriviaError;

/// One live, bidirectional connection carrying JSON frames.
///
/// `recv` runs inside the connection loop's `tokio::select!`, so it has to be
/// cancel-safe: a dropped `recv` future may not swallow a frame. Wrapping an
/// `mpsc::Receiver` satisfies this for free.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Write one frame.
    ///
    /// # Errors
    ///
    /// Returns [`TriviaError::TransportSend`] when the frame cannot be written.
    async fn send(&mut self, message: String) -> Result<(), TriviaError>;

    /// Wait for the next frame.
    ///
    /// `None` means the peer closed the connection cleanly; `Some(Err(_))`
    /// means the link is lost and the handle should reconnect.
    async fn recv(&mut self) -> Option<Result<String, TriviaError>>;

    /// Shut the connection down.
    ///
    /// # Errors
    ///
    /// Returns the close handshake failure, if any. Resources are released
    /// either way.
    async fn close(&mut self) -> Result<(), TriviaError>;
}

/// Opens transports to a server endpoint.
///
/// Called once for the initial connect and once per reconnect attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new transport to `uri`.
    ///
    /// # Errors
    ///
    /// Returns [`TriviaError::AuthenticationRequired`] when the endpoint
    /// refuses the session token, or any transport error otherwise.
    async fn connect(&self, uri: &str) -> Result<Box<dyn Transport>, TriviaError>;
}

#[async_trait]
impl Transport for Box<dyn Transport> {
    async fn send(&mut self, message: String) -> Result<(), TriviaError> {
        (**self).send(message).await
    }

    async fn recv(&mut self) -> Option<Result<String, TriviaError>> {
        (**self).recv().await
    }

    async fn close(&mut self) -> Result<(), TriviaError> {
        (**self).close().await
    }
}
