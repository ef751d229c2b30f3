//! Immutable view of the game the decision engine works from.
//!
//! Server messages are folded into a [`GameSnapshot`] by a [`StateProjector`]
//! supplied by the caller. [`SnapshotPublisher`] plugs a projector into a
//! connection as a [`ConnectionListener`] and publishes every new snapshot on
//! a `tokio::sync::watch` channel, so consumers always see the latest whole
//! value and never a half-applied one.
//!
//! `watch` keeps only the newest value. Consumers that must see every
//! transition, like the decision engine, take an ordered stream from
//! [`SnapshotPublisher::updates`] instead.

use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::trace;

use crate::listeners::ConnectionListener;

/// What the server currently expects this client to decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DecisionKind {
    #[default]
    None,
    ChooseQuestion,
    ChooseTheme,
    Answer,
    SelectPlayer,
    Stake,
    SelectChooser,
    OralAnswer,
}

/// What the game table is showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableMode {
    #[default]
    Logo,
    GameThemes,
    /// Grid of round themes and question prices.
    RoundTable,
    /// Stack of round themes.
    RoundThemes,
    /// Final round theme stack.
    Final,
    Text,
    Content,
    QuestionType,
    Object,
}

impl TableMode {
    /// The table shows the question price grid.
    pub fn is_question_grid(self) -> bool {
        matches!(self, Self::RoundTable)
    }

    /// The table shows a stack of themes to pick or remove from.
    pub fn is_theme_stack(self) -> bool {
        matches!(self, Self::RoundThemes | Self::Final)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayoutMode {
    #[default]
    Simple,
    AnswerOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ItemState {
    #[default]
    Normal,
    Active,
    Right,
    Wrong,
}

/// Something a selector may pick.
pub trait Selectable {
    fn is_selectable(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerOption {
    pub label: String,
    pub text: String,
    pub state: ItemState,
}

impl Selectable for AnswerOption {
    fn is_selectable(&self) -> bool {
        matches!(self.state, ItemState::Normal | ItemState::Active)
    }
}

/// A row of the round table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ThemeInfo {
    pub name: String,
    /// Question prices; a negative price marks an already played question.
    pub questions: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerCandidate {
    pub name: String,
    pub can_be_selected: bool,
}

impl Selectable for PlayerCandidate {
    fn is_selectable(&self) -> bool {
        self.can_be_selected
    }
}

/// Allowed stake modes (bitmask).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StakeModes(pub u8);

impl StakeModes {
    pub const NONE: Self = Self(0);
    pub const STAKE: Self = Self(1);
    pub const PASS: Self = Self(2);
    pub const ALL_IN: Self = Self(4);

    pub fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StakeBounds {
    pub minimum: i32,
    pub maximum: i32,
    pub step: i32,
    pub modes: StakeModes,
}

/// The question currently being played.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QuestionInfo {
    /// Increases with every new question.
    pub sequence: u64,
    pub text: String,
    pub theme_name: Option<String>,
    pub comment: Option<String>,
}

/// A consistent view of the game.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GameSnapshot {
    pub decision: DecisionKind,
    pub table_mode: TableMode,
    pub layout: LayoutMode,
    pub round_themes: Vec<ThemeInfo>,
    pub answer_options: Vec<AnswerOption>,
    pub stakes: StakeBounds,
    pub players: Vec<PlayerCandidate>,
    pub question: Option<QuestionInfo>,
    pub is_game_started: bool,
    /// The buzzer may be pressed.
    pub can_press_button: bool,
    /// Recent free-text log lines.
    pub replicas: Vec<String>,
}

impl GameSnapshot {
    pub fn question_sequence(&self) -> Option<u64> {
        self.question.as_ref().map(|q| q.sequence)
    }
}

/// Folds server messages into snapshots.
pub trait StateProjector: Send + 'static {
    /// Apply one pushed server invocation. Returns the new snapshot, or
    /// `None` when the message does not change it.
    fn apply(&mut self, target: &str, arguments: &[Value], current: &GameSnapshot) -> Option<GameSnapshot>;
}

/// Publishes the snapshots produced by a [`StateProjector`].
pub struct SnapshotPublisher<P> {
    projector: Mutex<P>,
    tx: watch::Sender<GameSnapshot>,
    ordered: Mutex<Vec<mpsc::UnboundedSender<GameSnapshot>>>,
}

impl<P: StateProjector> SnapshotPublisher<P> {
    /// Create a publisher and the receiver for its snapshots.
    pub fn new(projector: P) -> (Self, watch::Receiver<GameSnapshot>) {
        let (tx, rx) = watch::channel(GameSnapshot::default());
        (
            Self {
                projector: Mutex::new(projector),
                tx,
                ordered: Mutex::new(Vec::new()),
            },
            rx,
        )
    }

    /// Another receiver of the same snapshots.
    pub fn subscribe(&self) -> watch::Receiver<GameSnapshot> {
        self.tx.subscribe()
    }

    /// The latest snapshot.
    pub fn current(&self) -> GameSnapshot {
        self.tx.borrow().clone()
    }

    /// Every snapshot from now on, in publication order and without
    /// coalescing. The stream starts with the current snapshot and ends when
    /// the publisher is dropped.
    pub fn updates(&self) -> mpsc::UnboundedReceiver<GameSnapshot> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut ordered = self.ordered.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = tx.send(self.current());
        ordered.push(tx);
        rx
    }

    fn publish(&self, next: GameSnapshot) {
        let mut ordered = self.ordered.lock().unwrap_or_else(PoisonError::into_inner);
        ordered.retain(|tx| tx.send(next.clone()).is_ok());
        self.tx.send_replace(next);
    }
}

impl<P: StateProjector> ConnectionListener for SnapshotPublisher<P> {
    fn on_message(&self, target: &str, arguments: &[Value]) {
        let current = self.current();
        let next = self
            .projector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(target, arguments, &current);
        if let Some(next) = next {
            trace!(target, decision = ?next.decision, "snapshot updated");
            self.publish(next);
        }
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

    /// Flips `is_game_started` on `Receive("STAGE")`.
    struct StageProjector;

    impl StateProjector for StageProjector {
        fn apply(&mut self, target: &str, arguments: &[Value], current: &GameSnapshot) -> Option<GameSnapshot> {
            if target != "Receive" || arguments.first()?.as_str()? != "STAGE" {
                return None;
            }
            Some(GameSnapshot {
                is_game_started: true,
                ..current.clone()
            })
        }
    }

    #[test]
    fn stake_modes_bits() {
        let modes = StakeModes::STAKE.with(StakeModes::ALL_IN);
        assert!(modes.contains(StakeModes::STAKE));
        assert!(modes.contains(StakeModes::ALL_IN));
        assert!(!modes.contains(StakeModes::PASS));
        assert!(!modes.contains(StakeModes::NONE));
    }

    #[test]
    fn only_normal_and_active_options_are_selectable() {
        let option = |state| AnswerOption {
            label: "A".into(),
            text: "x".into(),
            state,
        };
        assert!(option(ItemState::Normal).is_selectable());
        assert!(option(ItemState::Active).is_selectable());
        assert!(!option(ItemState::Right).is_selectable());
        assert!(!option(ItemState::Wrong).is_selectable());
    }

    #[test]
    fn table_modes() {
        assert!(TableMode::RoundTable.is_question_grid());
        assert!(TableMode::Final.is_theme_stack());
        assert!(!TableMode::Text.is_theme_stack());
    }

    #[tokio::test]
    async fn publisher_publishes_projected_snapshots() {
        let (publisher, mut rx) = SnapshotPublisher::new(StageProjector);

        publisher.on_message("GameChanged", &[]);
        assert!(!rx.has_changed().unwrap());

        publisher.on_message("Receive", &[Value::from("STAGE")]);
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_game_started);
    }

    /// Sets the decision kind named by the first argument.
    struct DecisionProjector;

    impl StateProjector for DecisionProjector {
        fn apply(&mut self, _target: &str, arguments: &[Value], current: &GameSnapshot) -> Option<GameSnapshot> {
            let decision = match arguments.first()?.as_str()? {
                "stake" => DecisionKind::Stake,
                "none" => DecisionKind::None,
                _ => return None,
            };
            Some(GameSnapshot {
                decision,
                ..current.clone()
            })
        }
    }

    #[tokio::test]
    async fn ordered_updates_keep_every_transition() {
        let (publisher, mut latest) = SnapshotPublisher::new(DecisionProjector);
        let mut updates = publisher.updates();

        for step in ["stake", "none", "stake"] {
            publisher.on_message("Receive", &[Value::from(step)]);
        }

        let mut kinds = Vec::new();
        while let Ok(snapshot) = updates.try_recv() {
            kinds.push(snapshot.decision);
        }
        assert_eq!(
            kinds,
            vec![
                DecisionKind::None,
                DecisionKind::Stake,
                DecisionKind::None,
                DecisionKind::Stake
            ]
        );
        assert_eq!(latest.borrow_and_update().decision, DecisionKind::Stake);

        drop(publisher);
        assert!(updates.recv().await.is_none());
    }
}
