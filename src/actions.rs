//! Outbound game actions.
//!
//! Game commands travel as system chat messages whose text is the command
//! name followed by its arguments, joined by newlines:
//!
//! ```
//! use trivia_session::actions::Action;
//!
//! let action = Action::SelectQuestion { theme_index: 2, question_index: 0 };
//! assert_eq!(action.to_message(), "CHOICE\n2\n0");
//! ```

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;

/// Where a stake decision lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StakeDecision {
    Pass,
    AllIn,
    Stake(i32),
}

/// A decision the engine (or a caller) sends to the game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Pick a question cell on the round table.
    SelectQuestion { theme_index: usize, question_index: usize },
    /// Remove a theme from the final round stack.
    SelectTheme { theme_index: usize },
    /// Pick one of the displayed answer options by label.
    SelectAnswerOption { label: String },
    /// Pick a player (who answers, who receives a question...).
    SelectPlayer { index: usize },
    Stake(StakeDecision),
    /// Submit a free-text answer.
    SendAnswer { text: String },
    /// Press the buzzer; `delta_ms` is the reaction time since it was enabled.
    PressButton { delta_ms: u64 },
}

impl Action {
    /// Newline-joined message text for this action.
    pub fn to_message(&self) -> String {
        match self {
            Self::SelectQuestion {
                theme_index,
                question_index,
            } => join(&["CHOICE", &theme_index.to_string(), &question_index.to_string()]),
            Self::SelectTheme { theme_index } => join(&["DELETE", &theme_index.to_string()]),
            Self::SelectAnswerOption { label } => join(&["ANSWER", label]),
            Self::SelectPlayer { index } => join(&["SELECT_PLAYER", &index.to_string()]),
            Self::Stake(StakeDecision::Pass) => join(&["SET_STAKE", "Pass"]),
            Self::Stake(StakeDecision::AllIn) => join(&["SET_STAKE", "AllIn"]),
            Self::Stake(StakeDecision::Stake(amount)) => {
                join(&["SET_STAKE", "Stake", &amount.to_string()])
            }
            Self::SendAnswer { text } => join(&["ANSWER", text]),
            Self::PressButton { delta_ms } => join(&["I", &delta_ms.to_string()]),
        }
    }
}

fn join(parts: &[&str]) -> String {
    parts.join("\n")
}

/// Sends system messages to a game.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Send `text` as a system message addressed to the game.
    ///
    /// # Errors
    ///
    /// Returns the transport or RPC error.
    async fn send_system_message(&self, text: &str) -> Result<()>;
}

/// Performs [`Action`]s on behalf of the engine.
#[async_trait]
pub trait ActionSink: Send + Sync {
    /// # Errors
    ///
    /// Returns the transport or RPC error.
    async fn perform(&self, action: Action) -> Result<()>;
}

/// Game commands on top of a [`MessageSink`].
#[derive(Debug, Clone)]
pub struct GameActions<S> {
    sink: S,
}

impl<S: MessageSink> GameActions<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Send an arbitrary command.
    ///
    /// # Errors
    ///
    /// Returns the sink's error.
    pub async fn msg(&self, parts: &[&str]) -> Result<()> {
        let text = join(parts);
        debug!(command = parts.first().copied().unwrap_or_default(), "sending game command");
        self.sink.send_system_message(&text).await
    }

    /// Ask the game for its full state.
    ///
    /// # Errors
    ///
    /// Returns the sink's error.
    pub async fn info(&self) -> Result<()> {
        self.msg(&["INFO"]).await
    }

    /// Ask which game moves are available.
    ///
    /// # Errors
    ///
    /// Returns the sink's error.
    pub async fn moveable(&self) -> Result<()> {
        self.msg(&["MOVEABLE"]).await
    }

    /// # Errors
    ///
    /// Returns the sink's error.
    pub async fn ready(&self, is_ready: bool) -> Result<()> {
        self.msg(&["READY", if is_ready { "+" } else { "-" }]).await
    }

    /// Start the game (owner only).
    ///
    /// # Errors
    ///
    /// Returns the sink's error.
    pub async fn start(&self) -> Result<()> {
        self.msg(&["START"]).await
    }

    /// Toggle a player seat between human and computer.
    ///
    /// # Errors
    ///
    /// Returns the sink's error.
    pub async fn change_player_type(&self, table_index: usize) -> Result<()> {
        self.msg(&["CONFIG", "CHANGETYPE", "player", &table_index.to_string()])
            .await
    }
}

#[async_trait]
impl<S: MessageSink> ActionSink for GameActions<S> {
    async fn perform(&self, action: Action) -> Result<()> {
        self.sink.send_system_message(&action.to_message()).await
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
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageSink for Recorder {
        async fn send_system_message(&self, text: &str) -> Result<()> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    #[test]
    fn stake_messages() {
        assert_eq!(Action::Stake(StakeDecision::Pass).to_message(), "SET_STAKE\nPass");
        assert_eq!(Action::Stake(StakeDecision::AllIn).to_message(), "SET_STAKE\nAllIn");
        assert_eq!(
            Action::Stake(StakeDecision::Stake(300)).to_message(),
            "SET_STAKE\nStake\n300"
        );
    }

    #[test]
    fn answer_and_button_messages() {
        assert_eq!(
            Action::SendAnswer { text: "Paris".into() }.to_message(),
            "ANSWER\nParis"
        );
        assert_eq!(Action::PressButton { delta_ms: 120 }.to_message(), "I\n120");
        assert_eq!(Action::SelectPlayer { index: 1 }.to_message(), "SELECT_PLAYER\n1");
        assert_eq!(Action::SelectTheme { theme_index: 3 }.to_message(), "DELETE\n3");
    }

    #[tokio::test]
    async fn game_actions_send_through_sink() {
        let actions = GameActions::new(Recorder::default());
        actions.change_player_type(2).await.unwrap();
        actions.ready(true).await.unwrap();
        actions
            .perform(Action::SelectAnswerOption { label: "B".into() })
            .await
            .unwrap();

        let sent = actions.sink().sent.lock().unwrap().clone();
        assert_eq!(sent, vec!["CONFIG\nCHANGETYPE\nplayer\n2", "READY\n+", "ANSWER\nB"]);
    }
}
