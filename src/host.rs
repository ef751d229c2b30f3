//! Typed calls against a game host.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::actions::MessageSink;
use crate::connection::{ConnectionHandle, Membership};
use crate::error::{Result, TriviaError};
use crate::protocol::{
    ChatMessage, GameInfo, JoinDescriptor, JoinGameResponse, EVERYONE_RECEIVER, SYSTEM_RECEIVER,
};

/// Host hub methods on top of a host [`ConnectionHandle`].
#[derive(Debug, Clone)]
pub struct HostClient {
    handle: ConnectionHandle,
}

impl HostClient {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Look a game up on this host.
    ///
    /// # Errors
    ///
    /// Returns the invocation error.
    pub async fn try_get_game_info(&self, game_id: i32) -> Result<Option<GameInfo>> {
        self.handle
            .invoke("TryGetGameInfo", vec![Value::from(game_id)])
            .await
    }

    /// Send `JoinGame`. On success the descriptor is remembered and replayed
    /// after reconnects.
    ///
    /// # Errors
    ///
    /// Returns the invocation error. A refusal is reported in the response.
    pub async fn join_game(&self, descriptor: &JoinDescriptor) -> Result<JoinGameResponse> {
        let response: JoinGameResponse = self
            .handle
            .invoke("JoinGame", vec![serde_json::to_value(descriptor.to_request())?])
            .await?;
        if response.is_success {
            info!(game_id = descriptor.game_id, "joined game on host");
            self.handle.set_membership(Membership::Game(descriptor.clone()));
        }
        Ok(response)
    }

    /// Replay the stored join on demand.
    ///
    /// # Errors
    ///
    /// Returns [`TriviaError::JoinRejected`] when the host refuses.
    pub async fn rejoin(&self) -> Result<()> {
        let Some(descriptor) = self.handle.join_descriptor() else {
            debug!("nothing to rejoin");
            return Ok(());
        };
        let response = self.join_game(&descriptor).await?;
        if response.is_success {
            Ok(())
        } else {
            Err(TriviaError::JoinRejected {
                reason: response.error_type.unwrap_or_default(),
                message: response.message,
            })
        }
    }

    /// # Errors
    ///
    /// Returns the invocation error.
    pub async fn send_message(&self, message: ChatMessage) -> Result<()> {
        self.handle
            .invoke_raw("SendMessage", vec![serde_json::to_value(message)?])
            .await?;
        Ok(())
    }

    /// Public game chat.
    ///
    /// # Errors
    ///
    /// Returns the invocation error.
    pub async fn say(&self, text: &str) -> Result<()> {
        self.send_message(ChatMessage {
            text: text.to_string(),
            is_system: false,
            sender: self.sender(),
            receiver: EVERYONE_RECEIVER.to_string(),
        })
        .await
    }

    /// Forget the join so it is not replayed. The handle stays open; close it
    /// through [`SessionManager::leave`](crate::session::SessionManager::leave).
    pub fn leave_game(&self) {
        self.handle.clear_membership();
    }

    fn sender(&self) -> Option<String> {
        self.handle.join_descriptor().map(|d| d.user_name)
    }
}

#[async_trait]
impl MessageSink for HostClient {
    async fn send_system_message(&self, text: &str) -> Result<()> {
        self.send_message(ChatMessage {
            text: text.to_string(),
            is_system: true,
            sender: self.sender(),
            receiver: SYSTEM_RECEIVER.to_string(),
        })
        .await
    }
}
