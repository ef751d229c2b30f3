//! Wire types for the lobby and game host connections.
//!
//! Frames are JSON text messages tagged by `"type"`. Method arguments and
//! results are the server's contract types, which use PascalCase field names.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error_codes::{GameCreationResultCode, JoinGameErrorType};

// ── Frames ──────────────────────────────────────────────────────────

/// Frames sent from the client to a server endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Invoke a hub method. Without an `invocation_id` the server sends no
    /// completion (fire-and-forget).
    Invocation {
        #[serde(skip_serializing_if = "Option::is_none")]
        invocation_id: Option<String>,
        target: String,
        #[serde(default)]
        arguments: Vec<Value>,
    },
    /// Keep-alive.
    Ping,
}

/// Frames sent from a server endpoint to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Completion of a client invocation.
    Completion {
        invocation_id: String,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Server-pushed event (`Receive`, `GameChanged`, ...).
    Invocation {
        target: String,
        #[serde(default)]
        arguments: Vec<Value>,
    },
    /// Keep-alive.
    Ping,
    /// The server is closing the connection.
    Close {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

// ── Enums ───────────────────────────────────────────────────────────

/// Seat role inside a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Role {
    Viewer,
    #[default]
    Player,
    Showman,
}

/// Presentation flag sent with joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Sex {
    #[default]
    Male,
    Female,
}

impl Sex {
    /// The lobby API encodes the flag as `isMale`.
    pub fn is_male(self) -> bool {
        matches!(self, Self::Male)
    }
}

// ── Contracts ───────────────────────────────────────────────────────

/// Everything needed to (re)join a game.
///
/// Captured when a join succeeds and replayed verbatim after a reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinDescriptor {
    pub game_id: i32,
    pub user_name: String,
    pub role: Role,
    pub sex: Sex,
    pub password: Option<String>,
    pub pin: Option<i32>,
}

impl JoinDescriptor {
    /// Create a descriptor without password or PIN.
    pub fn new(game_id: i32, user_name: impl Into<String>, role: Role, sex: Sex) -> Self {
        Self {
            game_id,
            user_name: user_name.into(),
            role,
            sex,
            password: None,
            pin: None,
        }
    }

    /// Set the game password.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the game PIN.
    #[must_use]
    pub fn with_pin(mut self, pin: i32) -> Self {
        self.pin = Some(pin);
        self
    }

    /// The host `JoinGame` request for this descriptor.
    pub fn to_request(&self) -> JoinGameRequest {
        JoinGameRequest {
            game_id: self.game_id,
            user_name: self.user_name.clone(),
            role: self.role,
            sex: self.sex,
            password: self.password.clone(),
            pin: self.pin,
        }
    }
}

/// Host `JoinGame` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JoinGameRequest {
    pub game_id: i32,
    pub user_name: String,
    pub role: Role,
    pub sex: Sex,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub pin: Option<i32>,
}

/// Host `JoinGame` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JoinGameResponse {
    pub is_success: bool,
    #[serde(default)]
    pub error_type: Option<JoinGameErrorType>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Lobby result of creating or joining a game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GameCreationResult {
    #[serde(default)]
    pub code: GameCreationResultCode,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub game_id: i32,
    /// Host to connect to for the created game.
    #[serde(default)]
    pub host_uri: Option<String>,
    #[serde(default)]
    pub is_host: bool,
}

/// Paged list returned by `GetGamesSlice`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Slice<T> {
    pub data: Vec<T>,
    pub is_last_slice: bool,
}

/// Short description of a running game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GameInfo {
    #[serde(rename = "GameID")]
    pub game_id: i32,
    pub game_name: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub package_name: String,
    #[serde(default)]
    pub password_required: bool,
    #[serde(default)]
    pub started: bool,
    #[serde(default)]
    pub stage_name: String,
    #[serde(default)]
    pub host_uri: Option<String>,
}

/// Server-wide information returned by `GetGamesHostInfoNew`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostInfo {
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: i32,
    #[serde(default)]
    pub content_public_base_urls: Vec<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub max_package_size_mb: i32,
}

/// A seat in new game settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AccountSettings {
    pub name: String,
    pub is_human: bool,
    #[serde(default)]
    pub is_male: bool,
}

/// Name used for human seats that anyone may take.
pub const ANY_NAME: &str = " ";

/// Well-known rule flags (bitmask).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameRules(pub u8);

impl GameRules {
    pub const NONE: Self = Self(0);
    pub const FALSE_START: Self = Self(1);
    pub const ORAL: Self = Self(2);
    pub const IGNORE_WRONG: Self = Self(4);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Server-side application settings of a new game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerAppSettings {
    pub culture: String,
    pub false_start: bool,
    pub oral: bool,
    pub ignore_wrong: bool,
    pub managed: bool,
    pub game_mode: String,
}

impl ServerAppSettings {
    /// Settings derived from a rule bitmask.
    pub fn from_rules(rules: GameRules, culture: impl Into<String>) -> Self {
        Self {
            culture: culture.into(),
            false_start: rules.contains(GameRules::FALSE_START),
            oral: rules.contains(GameRules::ORAL),
            ignore_wrong: rules.contains(GameRules::IGNORE_WRONG),
            managed: false,
            game_mode: "Classic".to_string(),
        }
    }
}

/// New game settings for `CreateAndJoinGameNew`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GameSettings {
    pub human_player_name: String,
    pub network_game_name: String,
    pub network_game_password: String,
    pub is_private: bool,
    pub allow_viewers: bool,
    pub showman: AccountSettings,
    pub players: Vec<AccountSettings>,
    pub viewers: Vec<AccountSettings>,
    pub app_settings: ServerAppSettings,
}

/// Where the question package comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PackageKey {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    /// Direct download URI for library packages.
    #[serde(default)]
    pub uri: Option<String>,
}

impl PackageKey {
    /// A library package identified by URI.
    pub fn from_uri(uri: impl Into<String>) -> Self {
        Self {
            name: None,
            hash: None,
            id: None,
            uri: Some(uri.into()),
        }
    }

    /// A randomly generated package.
    pub fn random() -> Self {
        Self {
            name: None,
            hash: None,
            id: Some("random".to_string()),
            uri: None,
        }
    }
}

/// Payload of the `SendMessage` hub method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChatMessage {
    pub text: String,
    pub is_system: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    pub receiver: String,
}

/// Receiver of system (game command) messages.
pub const SYSTEM_RECEIVER: &str = "@";

/// Receiver of public chat messages.
pub const EVERYONE_RECEIVER: &str = "*";
