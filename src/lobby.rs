//! Typed calls against the lobby (matchmaking) server.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::actions::MessageSink;
use crate::connection::{ConnectionHandle, Membership};
use crate::error::Result;
use crate::protocol::{
    ChatMessage, GameCreationResult, GameInfo, GameSettings, HostInfo, JoinDescriptor, PackageKey,
    Slice, EVERYONE_RECEIVER, SYSTEM_RECEIVER,
};

/// Upper bound on `GetGamesSlice` pages fetched by [`LobbyClient::get_all_games`].
pub const MAX_GAME_PAGES: usize = 100;

/// Lobby hub methods on top of a lobby [`ConnectionHandle`].
#[derive(Debug, Clone)]
pub struct LobbyClient {
    handle: ConnectionHandle,
}

impl LobbyClient {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Names of the server's computer accounts.
    ///
    /// # Errors
    ///
    /// Returns the invocation error.
    pub async fn get_computer_accounts(&self, culture: &str) -> Result<Vec<String>> {
        self.handle
            .invoke("GetComputerAccountsNew", vec![Value::from(culture)])
            .await
    }

    /// # Errors
    ///
    /// Returns the invocation error.
    pub async fn get_host_info(&self, culture: &str) -> Result<HostInfo> {
        self.handle
            .invoke("GetGamesHostInfoNew", vec![Value::from(culture)])
            .await
    }

    /// Enter the lobby and remember the culture for reconnects.
    ///
    /// # Errors
    ///
    /// Returns the invocation error.
    pub async fn join_lobby(&self, culture: &str) -> Result<()> {
        self.handle
            .invoke_raw("JoinLobby2", vec![Value::from(culture)])
            .await?;
        self.handle.set_membership(Membership::Lobby {
            culture: culture.to_string(),
        });
        Ok(())
    }

    /// One page of running games starting at `from_id`.
    ///
    /// # Errors
    ///
    /// Returns the invocation error.
    pub async fn get_games_slice(&self, from_id: i32) -> Result<Slice<GameInfo>> {
        self.handle
            .invoke("GetGamesSlice", vec![Value::from(from_id)])
            .await
    }

    /// Every running game, following pages until the last slice.
    ///
    /// Stops after [`MAX_GAME_PAGES`] pages even if the server keeps
    /// reporting more.
    ///
    /// # Errors
    ///
    /// Returns the first invocation error.
    pub async fn get_all_games(&self) -> Result<Vec<GameInfo>> {
        let mut games = Vec::new();
        let mut from_id = 0;

        for page in 0..MAX_GAME_PAGES {
            let slice = self.get_games_slice(from_id).await?;
            let last_id = slice.data.last().map(|g| g.game_id);
            games.extend(slice.data);

            match last_id {
                Some(id) if !slice.is_last_slice => from_id = id.saturating_add(1),
                _ => {
                    debug!(pages = page + 1, games = games.len(), "games listing complete");
                    return Ok(games);
                }
            }
        }

        warn!(pages = MAX_GAME_PAGES, "games listing truncated");
        Ok(games)
    }

    /// # Errors
    ///
    /// Returns the invocation error.
    pub async fn get_users(&self) -> Result<Vec<String>> {
        self.handle.invoke("GetUsers", vec![]).await
    }

    /// # Errors
    ///
    /// Returns the invocation error.
    pub async fn get_news(&self) -> Result<Option<String>> {
        self.handle.invoke("GetNews", vec![]).await
    }

    /// The login the server knows this session by.
    ///
    /// # Errors
    ///
    /// Returns the invocation error.
    pub async fn get_login(&self) -> Result<String> {
        self.handle.invoke("GetLogin", vec![]).await
    }

    /// Post to the lobby chat.
    ///
    /// # Errors
    ///
    /// Returns the invocation error.
    pub async fn say_in_lobby(&self, text: &str) -> Result<()> {
        self.handle.invoke_raw("Say", vec![Value::from(text)]).await?;
        Ok(())
    }

    /// Create a game and join it as its owner.
    ///
    /// # Errors
    ///
    /// Returns the invocation error. Creation failures are reported in the
    /// returned [`GameCreationResult`].
    pub async fn create_and_join_game(
        &self,
        settings: &GameSettings,
        package: &PackageKey,
        is_male: bool,
    ) -> Result<GameCreationResult> {
        self.handle
            .invoke(
                "CreateAndJoinGameNew",
                vec![
                    serde_json::to_value(settings)?,
                    serde_json::to_value(package)?,
                    Value::Array(vec![]),
                    Value::from(is_male),
                ],
            )
            .await
    }

    /// Create a game the server fills automatically.
    ///
    /// # Errors
    ///
    /// Returns the invocation error.
    pub async fn create_automatic_game(&self, login: &str, is_male: bool) -> Result<GameCreationResult> {
        self.handle
            .invoke(
                "CreateAutomaticGameNew",
                vec![Value::from(login), Value::from(is_male)],
            )
            .await
    }

    /// Join an existing game through the lobby. On success the descriptor is
    /// remembered for reconnects.
    ///
    /// # Errors
    ///
    /// Returns the invocation error.
    pub async fn join_game(&self, descriptor: &JoinDescriptor) -> Result<GameCreationResult> {
        let result: GameCreationResult = self
            .handle
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

        if result.error_message.as_deref().is_none_or(str::is_empty) {
            self.handle.set_membership(Membership::Game(descriptor.clone()));
        }
        Ok(result)
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
            sender: None,
            receiver: EVERYONE_RECEIVER.to_string(),
        })
        .await
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

    /// Leave the current game and return to the lobby.
    ///
    /// # Errors
    ///
    /// Returns the invocation error.
    pub async fn leave_game(&self) -> Result<()> {
        self.handle.invoke_raw("LeaveGame", vec![]).await?;
        self.handle.clear_membership();
        Ok(())
    }

    /// # Errors
    ///
    /// Returns the invocation error.
    pub async fn log_out(&self) -> Result<()> {
        self.handle.invoke_raw("LogOut", vec![]).await?;
        self.handle.clear_membership();
        Ok(())
    }
}

#[async_trait]
impl MessageSink for LobbyClient {
    async fn send_system_message(&self, text: &str) -> Result<()> {
        self.send_message(ChatMessage {
            text: text.to_string(),
            is_system: true,
            sender: None,
            receiver: SYSTEM_RECEIVER.to_string(),
        })
        .await
    }
}
