//! Error types for the trivia session client.

use thiserror::Error;

use crate::error_codes::{GameCreationResultCode, JoinGameErrorType, LoginErrorKind};

/// Errors that can occur when talking to the lobby or a game host.
#[derive(Debug, Error)]
pub enum TriviaError {
    /// Failed to send a frame through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a frame from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed while a call was pending.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a wire frame or payload.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Attempted an operation that requires an active connection.
    #[error("not connected to server")]
    NotConnected,

    /// The server rejected the connection because the session token is
    /// missing or expired. The caller must log on again.
    #[error("authentication required")]
    AuthenticationRequired,

    /// The log-on endpoint refused the user.
    #[error("log-on failed: {kind}")]
    Login {
        /// Typed refusal reason.
        kind: LoginErrorKind,
        /// Raw status text or transport error, if any.
        detail: Option<String>,
    },

    /// The server license has not been accepted and auto-accept is disabled.
    #[error("server license not accepted")]
    LicenseNotAccepted,

    /// The server completed an invocation with an error.
    #[error("remote call {target} failed: {message}")]
    Rpc {
        /// Invoked hub method.
        target: String,
        /// Error text returned by the server.
        message: String,
    },

    /// A join request was refused by the server.
    #[error("join rejected: {reason}")]
    JoinRejected {
        /// Typed reason.
        reason: JoinGameErrorType,
        /// Optional server message.
        message: Option<String>,
    },

    /// A game could not be created.
    #[error("game creation failed: {code}")]
    GameCreation {
        /// Typed result code.
        code: GameCreationResultCode,
        /// Optional server message.
        message: Option<String>,
    },

    /// The game did not start before the configured deadline.
    #[error("game did not start within {0:?}")]
    GameStartTimeout(std::time::Duration),

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// A caller-supplied value was rejected before reaching the server.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A connection to a server endpoint could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// An HTTP request (log-on, reasoning service) failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TriviaError {
    /// Returns `true` for failures that the reconnect policy may recover from.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransportSend(_)
                | Self::TransportReceive(_)
                | Self::TransportClosed
                | Self::Connect(_)
                | Self::Timeout
                | Self::Io(_)
        )
    }
}

/// A specialized [`Result`] type for trivia session operations.
pub type Result<T> = std::result::Result<T, TriviaError>;
