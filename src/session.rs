//! Owner of the lobby and game host connections.
//!
//! [`SessionManager`] keeps at most one connection per [`EndpointKind`].
//! Connecting again while a handle exists returns the existing handle, so a
//! reconnect can never produce a second concurrent connection. Joining a game
//! stores the [`JoinDescriptor`] on the handle; the connection replays it after
//! every reconnect. Leaving clears it first, then detaches the listener and
//! closes the handle, which also cancels any pending reconnect.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionConfig, ConnectionHandle, ConnectionState, EndpointKind, Membership};
use crate::error::{Result, TriviaError};
use crate::error_codes::JoinGameErrorType;
use crate::listeners::{ConnectionListener, ListenerRegistry};
use crate::protocol::{GameCreationResult, JoinDescriptor, JoinGameResponse};
use crate::transport::Connector;

/// Result of [`SessionManager::connect_lobby`].
#[derive(Debug, Clone)]
pub enum ConnectOutcome {
    /// The lobby connection is up.
    Connected(ConnectionHandle),
    /// The session token was refused; log on again before retrying.
    AuthenticationRequired,
    /// Any other failure, suitable for showing to the user.
    Failed(String),
}

/// Result of [`SessionManager::join`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    Rejected {
        reason: JoinGameErrorType,
        message: Option<String>,
    },
}

impl JoinOutcome {
    pub fn is_joined(&self) -> bool {
        matches!(self, Self::Joined)
    }

    /// Convert a rejection into [`TriviaError::JoinRejected`].
    ///
    /// # Errors
    ///
    /// Returns the rejection as an error.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Joined => Ok(()),
            Self::Rejected { reason, message } => Err(TriviaError::JoinRejected { reason, message }),
        }
    }
}

/// Owns zero-or-one lobby handle and zero-or-one host handle.
pub struct SessionManager {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    registry: ListenerRegistry,
    lobby: Mutex<Option<ConnectionHandle>>,
    host: Mutex<Option<ConnectionHandle>>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_config(connector, ConnectionConfig::new())
    }

    pub fn with_config(connector: Arc<dyn Connector>, config: ConnectionConfig) -> Self {
        Self {
            connector,
            config,
            registry: ListenerRegistry::new(),
            lobby: Mutex::new(None),
            host: Mutex::new(None),
        }
    }

    /// Connect to the lobby, or return the existing lobby connection while it
    /// is still alive.
    ///
    /// # Errors
    ///
    /// Returns [`TriviaError::InvalidInput`] for an empty URI. Connection
    /// failures are reported through [`ConnectOutcome`].
    pub async fn connect_lobby(
        &self,
        uri: &str,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<ConnectOutcome> {
        if uri.trim().is_empty() {
            return Err(TriviaError::InvalidInput("lobby URI is empty".into()));
        }

        let mut slot = self.lobby.lock().await;
        if let Some(existing) = self.live(&mut slot) {
            debug!(connection = %existing.id(), "lobby already connected");
            return Ok(ConnectOutcome::Connected(existing));
        }

        match ConnectionHandle::connect(
            EndpointKind::Lobby,
            uri,
            Arc::clone(&self.connector),
            self.config.clone(),
        )
        .await
        {
            Ok(handle) => {
                self.registry.attach(&handle, listener);
                *slot = Some(handle.clone());
                Ok(ConnectOutcome::Connected(handle))
            }
            Err(TriviaError::AuthenticationRequired) => {
                info!(uri, "lobby requires authentication");
                Ok(ConnectOutcome::AuthenticationRequired)
            }
            Err(e) => {
                warn!(uri, error = %e, "lobby connection failed");
                Ok(ConnectOutcome::Failed(e.to_string()))
            }
        }
    }

    /// Connect to a game host, or return the existing host connection while
    /// it is still alive.
    ///
    /// # Errors
    ///
    /// Returns the connect error.
    pub async fn connect_to_host(
        &self,
        uri: &str,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<ConnectionHandle> {
        if uri.trim().is_empty() {
            return Err(TriviaError::InvalidInput("host URI is empty".into()));
        }

        let mut slot = self.host.lock().await;
        if let Some(existing) = self.live(&mut slot) {
            debug!(connection = %existing.id(), "host already connected");
            return Ok(existing);
        }

        let handle = ConnectionHandle::connect(
            EndpointKind::Host,
            uri,
            Arc::clone(&self.connector),
            self.config.clone(),
        )
        .await?;
        self.registry.attach(&handle, listener);
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// The handle in `slot` unless it has closed for good. A closed handle is
    /// dropped from the slot and the registry.
    fn live(&self, slot: &mut Option<ConnectionHandle>) -> Option<ConnectionHandle> {
        let handle = slot.as_ref()?;
        if handle.state() != ConnectionState::Disconnected {
            return Some(handle.clone());
        }
        info!(connection = %handle.id(), kind = ?handle.kind(), "discarding closed connection");
        self.registry.forget(handle.id());
        *slot = None;
        None
    }

    /// Join a game through `handle` and remember the descriptor for
    /// reconnects.
    ///
    /// A host handle sends `JoinGame`; a lobby handle sends `JoinGameNew`.
    ///
    /// # Errors
    ///
    /// Returns transport or RPC errors. A refusal is a
    /// [`JoinOutcome::Rejected`], not an error.
    pub async fn join(&self, handle: &ConnectionHandle, descriptor: JoinDescriptor) -> Result<JoinOutcome> {
        let outcome = match handle.kind() {
            EndpointKind::Host => {
                let response: JoinGameResponse = handle
                    .invoke("JoinGame", vec![serde_json::to_value(descriptor.to_request())?])
                    .await?;
                if response.is_success {
                    JoinOutcome::Joined
                } else {
                    JoinOutcome::Rejected {
                        reason: response.error_type.unwrap_or_default(),
                        message: response.message,
                    }
                }
            }
            EndpointKind::Lobby => {
                let result: GameCreationResult = handle
                    .invoke(
                        "JoinGameNew",
                        vec![
                            Value::from(descriptor.game_id),
                            serde_json::to_value(descriptor.role)?,
                            Value::from(descriptor.sex.is_male()),
                            Value::from(descriptor.password.clone().unwrap_or_default()),
                        ],
                    )
                    .await?;
                match result.error_message {
                    Some(message) if !message.is_empty() => JoinOutcome::Rejected {
                        reason: JoinGameErrorType::CommonJoinError,
                        message: Some(message),
                    },
                    _ if !result.code.is_ok() => JoinOutcome::Rejected {
                        reason: JoinGameErrorType::CommonJoinError,
                        message: Some(result.code.description().to_string()),
                    },
                    _ => JoinOutcome::Joined,
                }
            }
        };

        match &outcome {
            JoinOutcome::Joined => {
                info!(
                    connection = %handle.id(),
                    game_id = descriptor.game_id,
                    role = ?descriptor.role,
                    "joined game"
                );
                handle.set_membership(Membership::Game(descriptor));
            }
            JoinOutcome::Rejected { reason, message } => {
                warn!(
                    connection = %handle.id(),
                    game_id = descriptor.game_id,
                    %reason,
                    message = message.as_deref().unwrap_or(""),
                    "join rejected"
                );
            }
        }
        Ok(outcome)
    }

    /// Leave: clear the membership, detach the listener and close the handle.
    /// The manager's slot is emptied when it holds this handle.
    pub async fn leave(&self, handle: &ConnectionHandle) {
        handle.clear_membership();
        self.registry.detach(handle.id());
        handle.close().await;

        let slot = match handle.kind() {
            EndpointKind::Lobby => &self.lobby,
            EndpointKind::Host => &self.host,
        };
        let mut slot = slot.lock().await;
        if slot.as_ref().is_some_and(|h| h.id() == handle.id()) {
            *slot = None;
        }
        debug!(connection = %handle.id(), "left connection");
    }

    /// Send `LogOut` to the lobby, then leave every connection.
    pub async fn log_out(&self) {
        if let Some(lobby) = self.lobby().await {
            if lobby.is_connected() {
                if let Err(e) = lobby.invoke_raw("LogOut", vec![]).await {
                    warn!(error = %e, "LogOut failed");
                }
            }
        }
        if let Some(host) = self.host().await {
            self.leave(&host).await;
        }
        if let Some(lobby) = self.lobby().await {
            self.leave(&lobby).await;
        }
        info!("logged out");
    }

    /// The current lobby handle.
    pub async fn lobby(&self) -> Option<ConnectionHandle> {
        self.lobby.lock().await.clone()
    }

    /// The current host handle.
    pub async fn host(&self) -> Option<ConnectionHandle> {
        self.host.lock().await.clone()
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }
}
