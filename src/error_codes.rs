//! Typed reason codes returned by the lobby, the game hosts and the log-on
//! endpoint.
//!
//! The server encodes these as PascalCase strings (e.g. `"GameNotFound"`),
//! which is what the serde derives below produce and accept.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a host refused a `JoinGame` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JoinGameErrorType {
    /// The requested role does not exist or is not available.
    InvalidRole,
    /// No game with the requested identifier is running on this host.
    GameNotFound,
    /// The host failed internally while processing the request.
    InternalServerError,
    /// The user is banned from this game.
    Forbidden,
    /// Any other join failure (wrong password, full game, wrong PIN...).
    #[default]
    CommonJoinError,
}

impl JoinGameErrorType {
    /// Returns a human-readable description of this join failure.
    pub fn description(&self) -> &'static str {
        match self {
            Self::InvalidRole => "The requested role is not available in this game.",
            Self::GameNotFound => {
                "The game could not be found. It may have finished or the identifier is wrong."
            }
            Self::InternalServerError => {
                "The game host failed while processing the request. Please try again later."
            }
            Self::Forbidden => "You are not allowed to join this game.",
            Self::CommonJoinError => "The game could not be joined.",
        }
    }
}

impl fmt::Display for JoinGameErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Result code of a game creation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum GameCreationResultCode {
    #[default]
    Ok,
    NoPackage,
    TooMuchGames,
    ServerUnderMaintainance,
    BadPackage,
    GameNameCollision,
    InternalServerError,
    ServerNotReady,
    YourClientIsObsolete,
    UnknownError,
    JoinError,
    WrongGameSettings,
    TooManyGamesByAddress,
}

impl GameCreationResultCode {
    /// Returns `true` when the game was created.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Returns a human-readable description of this result code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Ok => "The game was created.",
            Self::NoPackage => "The question package could not be found.",
            Self::TooMuchGames => "The server runs too many games. Please try again later.",
            Self::ServerUnderMaintainance => {
                "The server is under maintenance. New games cannot be created right now."
            }
            Self::BadPackage => "The question package is damaged or has an invalid format.",
            Self::GameNameCollision => "A game with the same name already exists.",
            Self::InternalServerError => "An internal server error occurred.",
            Self::ServerNotReady => "The server is not ready yet. Please try again in a moment.",
            Self::YourClientIsObsolete => {
                "This client version is no longer supported by the server. Please upgrade."
            }
            Self::UnknownError => "An unknown error occurred.",
            Self::JoinError => "The game was created but could not be joined.",
            Self::WrongGameSettings => "The game settings were rejected by the server.",
            Self::TooManyGamesByAddress => "Too many games were created from your address.",
        }
    }
}

impl fmt::Display for GameCreationResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Why the log-on endpoint refused a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginErrorKind {
    /// The server could not be reached at all.
    CannotReachServer,
    /// The requested name is not allowed (HTTP 403).
    ForbiddenName,
    /// The requested name is already used by a connected user (HTTP 409).
    DuplicateName,
    /// Too many log-on attempts (HTTP 429).
    RateLimited,
    /// Any other refusal.
    Other,
}

impl LoginErrorKind {
    /// Maps an HTTP status code of the log-on endpoint to a reason.
    pub fn from_status(status: u16) -> Self {
        match status {
            0 => Self::CannotReachServer,
            403 => Self::ForbiddenName,
            409 => Self::DuplicateName,
            429 => Self::RateLimited,
            _ => Self::Other,
        }
    }

    /// Returns a human-readable description of this refusal.
    pub fn description(&self) -> &'static str {
        match self {
            Self::CannotReachServer => "Cannot connect to the server.",
            Self::ForbiddenName => "This name is not allowed. Please choose another one.",
            Self::DuplicateName => "A user with this name is already connected.",
            Self::RateLimited => "Too many log-on attempts. Please wait and try again.",
            Self::Other => "The server refused the log-on request.",
        }
    }
}

impl fmt::Display for LoginErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn join_error_uses_server_spelling() {
        let json = serde_json::to_string(&JoinGameErrorType::GameNotFound).unwrap();
        assert_eq!(json, "\"GameNotFound\"");
        let parsed: JoinGameErrorType = serde_json::from_str("\"Forbidden\"").unwrap();
        assert_eq!(parsed, JoinGameErrorType::Forbidden);
    }

    #[test]
    fn creation_code_parses_obsolete_client() {
        let parsed: GameCreationResultCode =
            serde_json::from_str("\"YourClientIsObsolete\"").unwrap();
        assert_eq!(parsed, GameCreationResultCode::YourClientIsObsolete);
        assert!(!parsed.is_ok());
    }

    #[test]
    fn login_status_mapping() {
        assert_eq!(LoginErrorKind::from_status(0), LoginErrorKind::CannotReachServer);
        assert_eq!(LoginErrorKind::from_status(403), LoginErrorKind::ForbiddenName);
        assert_eq!(LoginErrorKind::from_status(409), LoginErrorKind::DuplicateName);
        assert_eq!(LoginErrorKind::from_status(429), LoginErrorKind::RateLimited);
        assert_eq!(LoginErrorKind::from_status(500), LoginErrorKind::Other);
    }
}
