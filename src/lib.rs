//! # Trivia Session
//!
//! Auto-reconnecting session layer and unattended decision engine for a
//! real-time multiplayer trivia client.
//!
//! The crate keeps one RPC connection to the lobby and one to the host of the
//! joined game. Both reconnect on their own and replay the last join, so the
//! server never sees a second identity. On top of the game connection a
//! [`DecisionEngine`] reacts to published [`GameSnapshot`]s with game actions.
//!
//! ## Features
//!
//! - **Transport-agnostic**: implement [`Transport`] and [`Connector`] for any backend
//! - **Reconnect with rejoin**: [`ConnectionHandle`] restores the stored join after every reconnect
//! - **WebSocket built-in**: default `transport-websocket` feature provides `WebSocketConnector`
//! - **Unattended play**: [`AutonomousAgent`] bootstraps into a game and plays it
//!
//! ## Quick Start
//!
//! ```no_run
//! # #[cfg(feature = "transport-websocket")]
//! # async fn demo() -> trivia_session::Result<()> {
//! use std::sync::Arc;
//! use trivia_session::{
//!     BootstrapConfig, GamePlan, JoinExisting, SessionBootstrapper, SessionManager,
//!     TracingListener, WebSocketConnector,
//! };
//! use trivia_session::snapshot::GameSnapshot;
//!
//! let session = Arc::new(SessionManager::new(Arc::new(WebSocketConnector::new())));
//! let config = BootstrapConfig::new(
//!     "https://trivia.example",
//!     "alice",
//!     GamePlan::Join(JoinExisting::new(42)),
//! );
//! let (_tx, snapshots) = tokio::sync::watch::channel(GameSnapshot::default());
//! let outcome = SessionBootstrapper::new(config, session)
//!     .run(Arc::new(TracingListener::new("host")), snapshots)
//!     .await?;
//! outcome.host.say("hello").await?;
//! # Ok(())
//! # }
//! ```

pub mod actions;
pub mod agent;
pub mod bootstrap;
pub mod connection;
pub mod engine;
pub mod error;
pub mod error_codes;
pub mod host;
pub mod listeners;
pub mod lobby;
pub mod protocol;
pub mod reasoner;
pub mod session;
pub mod snapshot;
pub mod strategy;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use actions::{Action, ActionSink, GameActions, MessageSink, StakeDecision};
pub use agent::AutonomousAgent;
pub use bootstrap::{
    Authenticator, BootstrapConfig, BootstrapOutcome, GamePlan, HttpAuthenticator, JoinExisting,
    LicenseStore, MemoryLicenseStore, NewGameOptions, SessionBootstrapper,
};
pub use connection::{
    ConnectionConfig, ConnectionEvent, ConnectionHandle, ConnectionState, EndpointKind, Membership,
    ReconnectPolicy,
};
pub use engine::DecisionEngine;
pub use error::{Result, TriviaError};
pub use error_codes::{GameCreationResultCode, JoinGameErrorType, LoginErrorKind};
pub use host::HostClient;
pub use listeners::{ConnectionListener, ListenerRegistry, TracingListener};
pub use lobby::LobbyClient;
pub use protocol::{ClientFrame, JoinDescriptor, Role, ServerFrame, Sex};
pub use reasoner::{AnswerGenerator, AnswerReasoner, ChatCompletionGenerator, ReasonerConfig};
pub use session::{ConnectOutcome, JoinOutcome, SessionManager};
pub use snapshot::{GameSnapshot, SnapshotPublisher, StateProjector};
pub use transport::{Connector, Transport};
#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};
