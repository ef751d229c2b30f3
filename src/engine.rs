//! Decision state machine.
//!
//! [`DecisionEngine`] watches published [`GameSnapshot`]s and fires exactly one
//! strategy per change of [`DecisionKind`]. Snapshots that repeat the previous
//! kind are ignored even when other fields changed, so a pending decision is
//! never answered twice.
//!
//! Answer generation runs in the background, one at a time. A question that
//! appears while another generation runs waits for it to finish. A result
//! lands in the prepared-answer slot only if its question is still current. A confident
//! prepared answer presses the buzzer as soon as pressing is allowed.
//!
//! All state lives in the engine task; generation results are delivered back
//! to it over a channel, so no locking is needed. Snapshots arrive on an
//! ordered channel, one at a time, so every change of decision kind is seen.

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::actions::{Action, ActionSink};
use crate::reasoner::{is_confident, match_option, AnswerPrompt, AnswerReasoner, NO_ANSWER};
use crate::snapshot::{DecisionKind, GameSnapshot, LayoutMode};
use crate::strategy::{select_index, select_question, select_stake, select_theme};

/// Answer prepared for the current question.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreparedAnswer {
    pub text: String,
    pub ready: bool,
}

impl PreparedAnswer {
    fn clear(&mut self) {
        self.text.clear();
        self.ready = false;
    }

    fn fill(&mut self, text: String) {
        self.text = text;
        self.ready = true;
    }

    /// Ready and not the abstain sentinel.
    pub fn is_confident(&self) -> bool {
        self.ready && is_confident(&self.text)
    }
}

/// Result of a background generation.
#[derive(Debug)]
struct Generated {
    sequence: u64,
    answer: String,
}

/// Reacts to snapshots with game actions.
pub struct DecisionEngine<S> {
    sink: S,
    reasoner: AnswerReasoner,
    rng: StdRng,
    last_kind: DecisionKind,
    current_question: Option<u64>,
    prepared: PreparedAnswer,
    in_flight: Option<u64>,
    /// Prompt for the current question, held back while an older
    /// generation is still running.
    deferred: Option<(u64, AnswerPrompt)>,
    awaiting_answer: bool,
    can_press: bool,
    button_enabled_at: Option<Instant>,
    pressed_for: Option<u64>,
    generated_tx: mpsc::UnboundedSender<Generated>,
    generated_rx: mpsc::UnboundedReceiver<Generated>,
}

impl<S: ActionSink> DecisionEngine<S> {
    pub fn new(sink: S, reasoner: AnswerReasoner) -> Self {
        Self::with_rng(sink, reasoner, StdRng::from_os_rng())
    }

    /// Engine with a reproducible RNG.
    pub fn with_seed(sink: S, reasoner: AnswerReasoner, seed: u64) -> Self {
        Self::with_rng(sink, reasoner, StdRng::seed_from_u64(seed))
    }

    fn with_rng(sink: S, reasoner: AnswerReasoner, rng: StdRng) -> Self {
        let (generated_tx, generated_rx) = mpsc::unbounded_channel();
        Self {
            sink,
            reasoner,
            rng,
            last_kind: DecisionKind::None,
            current_question: None,
            prepared: PreparedAnswer::default(),
            in_flight: None,
            deferred: None,
            awaiting_answer: false,
            can_press: false,
            button_enabled_at: None,
            pressed_for: None,
            generated_tx,
            generated_rx,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn prepared(&self) -> &PreparedAnswer {
        &self.prepared
    }

    pub fn last_kind(&self) -> DecisionKind {
        self.last_kind
    }

    /// Drive the engine until the snapshot stream ends.
    ///
    /// `snapshots` must deliver every published snapshot in order (see
    /// [`SnapshotPublisher::updates`](crate::snapshot::SnapshotPublisher::updates)).
    pub async fn run(mut self, mut snapshots: mpsc::UnboundedReceiver<GameSnapshot>) {
        info!("decision engine started");
        loop {
            tokio::select! {
                snapshot = snapshots.recv() => {
                    let Some(snapshot) = snapshot else {
                        break;
                    };
                    self.on_snapshot(&snapshot).await;
                }
                Some(generated) = self.generated_rx.recv() => {
                    self.on_generated(generated).await;
                }
            }
        }
        info!("decision engine stopped");
    }

    /// Process one snapshot.
    pub async fn on_snapshot(&mut self, snapshot: &GameSnapshot) {
        self.track_question(snapshot);
        self.track_button(snapshot).await;

        if snapshot.decision == self.last_kind {
            return;
        }
        debug!(from = ?self.last_kind, to = ?snapshot.decision, "decision changed");
        self.last_kind = snapshot.decision;
        self.dispatch(snapshot).await;
    }

    fn track_question(&mut self, snapshot: &GameSnapshot) {
        let Some(sequence) = snapshot.question_sequence() else {
            return;
        };
        if self.current_question == Some(sequence) {
            return;
        }

        self.current_question = Some(sequence);
        self.prepared.clear();
        self.awaiting_answer = false;
        self.pressed_for = None;
        self.deferred = None;

        let Some(prompt) = AnswerPrompt::from_snapshot(snapshot) else {
            return;
        };
        if let Some(busy) = self.in_flight {
            debug!(sequence, in_flight = busy, "generation in flight, new question deferred");
            self.deferred = Some((sequence, prompt));
            return;
        }
        self.launch_generation(sequence, prompt);
    }

    async fn track_button(&mut self, snapshot: &GameSnapshot) {
        let was_allowed = self.can_press;
        self.can_press = snapshot.can_press_button;
        if self.can_press && !was_allowed {
            self.button_enabled_at = Some(Instant::now());
            self.try_press().await;
        }
    }

    fn launch_generation(&mut self, sequence: u64, prompt: AnswerPrompt) {
        debug!(sequence, "starting answer generation");
        self.in_flight = Some(sequence);
        let reasoner = self.reasoner.clone();
        let tx = self.generated_tx.clone();
        tokio::spawn(async move {
            let answer = reasoner.generate(&prompt).await;
            let _ = tx.send(Generated { sequence, answer });
        });
    }

    async fn on_generated(&mut self, generated: Generated) {
        self.in_flight = None;
        if self.current_question != Some(generated.sequence) {
            debug!(sequence = generated.sequence, "discarding answer for a past question");
            self.resume_current().await;
            return;
        }

        self.prepared.fill(generated.answer);
        if self.awaiting_answer && self.last_kind == DecisionKind::Answer {
            self.awaiting_answer = false;
            self.send_prepared_answer().await;
            return;
        }
        self.try_press().await;
    }

    /// Start the held-back generation, or give up on an answer that
    /// nothing can produce any more.
    async fn resume_current(&mut self) {
        match self.deferred.take() {
            Some((sequence, prompt)) if self.current_question == Some(sequence) => {
                self.launch_generation(sequence, prompt);
            }
            _ if self.awaiting_answer && self.last_kind == DecisionKind::Answer => {
                self.awaiting_answer = false;
                self.perform(Action::SendAnswer {
                    text: NO_ANSWER.to_string(),
                })
                .await;
            }
            _ => {}
        }
    }

    async fn try_press(&mut self) {
        if !self.can_press || !self.prepared.is_confident() {
            return;
        }
        let Some(question) = self.current_question else {
            return;
        };
        if self.pressed_for == Some(question) {
            return;
        }

        self.pressed_for = Some(question);
        let delta_ms = self
            .button_enabled_at
            .map(|at| u64::try_from(at.elapsed().as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        self.perform(Action::PressButton { delta_ms }).await;
    }

    async fn dispatch(&mut self, snapshot: &GameSnapshot) {
        let action = match snapshot.decision {
            DecisionKind::None | DecisionKind::SelectChooser | DecisionKind::OralAnswer => None,
            DecisionKind::ChooseQuestion | DecisionKind::ChooseTheme => self.choose(snapshot),
            DecisionKind::Answer => return self.answer(snapshot).await,
            DecisionKind::SelectPlayer => {
                select_index(&snapshot.players, &mut self.rng).map(|index| Action::SelectPlayer { index })
            }
            DecisionKind::Stake => select_stake(&snapshot.stakes, &mut self.rng).map(Action::Stake),
        };

        match action {
            Some(action) => self.perform(action).await,
            None => debug!(kind = ?snapshot.decision, "no action for decision"),
        }
    }

    fn choose(&mut self, snapshot: &GameSnapshot) -> Option<Action> {
        let grid = if snapshot.table_mode.is_question_grid() {
            true
        } else if snapshot.table_mode.is_theme_stack() {
            false
        } else {
            snapshot.decision == DecisionKind::ChooseQuestion
        };

        if grid {
            select_question(&snapshot.round_themes, &mut self.rng).map(|(theme_index, question_index)| {
                Action::SelectQuestion {
                    theme_index,
                    question_index,
                }
            })
        } else {
            select_theme(&snapshot.round_themes, &mut self.rng).map(|theme_index| Action::SelectTheme { theme_index })
        }
    }

    async fn answer(&mut self, snapshot: &GameSnapshot) {
        if snapshot.layout == LayoutMode::AnswerOptions && !snapshot.answer_options.is_empty() {
            let prepared = self.prepared.ready.then_some(self.prepared.text.as_str());
            let Some(index) = match_option(prepared, &snapshot.answer_options, &mut self.rng) else {
                debug!("no selectable answer option");
                return;
            };
            if let Some(option) = snapshot.answer_options.get(index) {
                let label = option.label.clone();
                self.prepared.clear();
                self.perform(Action::SelectAnswerOption { label }).await;
            }
            return;
        }

        if self.prepared.ready {
            self.send_prepared_answer().await;
            return;
        }

        self.awaiting_answer = true;
        let current = snapshot.question_sequence().zip(AnswerPrompt::from_snapshot(snapshot));
        if let Some(busy) = self.in_flight {
            debug!(in_flight = busy, "answer requested, waiting for generation");
            if self.deferred.is_none() && snapshot.question_sequence().is_some_and(|s| s != busy) {
                self.deferred = current;
            }
            return;
        }
        match current {
            Some((sequence, prompt)) => self.launch_generation(sequence, prompt),
            None => {
                self.awaiting_answer = false;
                debug!("answer requested without a question");
            }
        }
    }

    async fn send_prepared_answer(&mut self) {
        let text = std::mem::take(&mut self.prepared.text);
        self.prepared.clear();
        self.perform(Action::SendAnswer { text }).await;
    }

    async fn perform(&self, action: Action) {
        debug!(?action, "performing action");
        if let Err(e) = self.sink.perform(action).await {
            warn!(error = %e, "action failed");
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
    use crate::actions::StakeDecision;
    use crate::error::Result;
    use crate::reasoner::{AnswerGenerator, NO_ANSWER};
    use crate::listeners::ConnectionListener;
    use crate::snapshot::{
        AnswerOption, ItemState, QuestionInfo, SnapshotPublisher, StakeBounds, StakeModes, StateProjector, TableMode,
        ThemeInfo,
    };
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct RecordingSink {
        actions: Arc<Mutex<Vec<Action>>>,
    }

    impl RecordingSink {
        fn taken(&self) -> Vec<Action> {
            std::mem::take(&mut *self.actions.lock().unwrap())
        }
    }

    #[async_trait]
    impl ActionSink for RecordingSink {
        async fn perform(&self, action: Action) -> Result<()> {
            self.actions.lock().unwrap().push(action);
            Ok(())
        }
    }

    struct FixedGenerator(&'static str);

    #[async_trait]
    impl AnswerGenerator for FixedGenerator {
        async fn generate(&self, _prompt: &AnswerPrompt) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn engine(answer: &'static str) -> (DecisionEngine<RecordingSink>, RecordingSink) {
        let sink = RecordingSink::default();
        let reasoner = AnswerReasoner::new(Arc::new(FixedGenerator(answer)));
        (DecisionEngine::with_seed(sink.clone(), reasoner, 9), sink)
    }

    fn question(sequence: u64, text: &str) -> Option<QuestionInfo> {
        Some(QuestionInfo {
            sequence,
            text: text.to_string(),
            theme_name: None,
            comment: None,
        })
    }

    async fn deliver_generation(engine: &mut DecisionEngine<RecordingSink>) {
        let generated = engine.generated_rx.recv().await.unwrap();
        engine.on_generated(generated).await;
    }

    #[tokio::test]
    async fn repeated_kind_fires_once() {
        let (mut engine, sink) = engine(NO_ANSWER);
        let snapshot = GameSnapshot {
            decision: DecisionKind::Stake,
            stakes: StakeBounds {
                minimum: 100,
                maximum: 500,
                step: 100,
                modes: StakeModes::STAKE.with(StakeModes::PASS),
            },
            ..GameSnapshot::default()
        };

        engine.on_snapshot(&snapshot).await;
        let mut changed = snapshot.clone();
        changed.replicas.push("someone said hi".into());
        engine.on_snapshot(&changed).await;

        assert_eq!(sink.taken(), vec![Action::Stake(StakeDecision::Pass)]);
    }

    #[tokio::test]
    async fn none_and_chooser_do_nothing() {
        let (mut engine, sink) = engine(NO_ANSWER);
        for decision in [DecisionKind::SelectChooser, DecisionKind::None, DecisionKind::OralAnswer] {
            engine
                .on_snapshot(&GameSnapshot {
                    decision,
                    ..GameSnapshot::default()
                })
                .await;
        }
        assert!(sink.taken().is_empty());
    }

    #[tokio::test]
    async fn grid_table_chooses_a_question_and_stack_removes_a_theme() {
        let (mut engine, sink) = engine(NO_ANSWER);
        let themes = vec![ThemeInfo {
            name: "Rivers".into(),
            questions: vec![-1, 200],
        }];
        engine
            .on_snapshot(&GameSnapshot {
                decision: DecisionKind::ChooseQuestion,
                table_mode: TableMode::RoundTable,
                round_themes: themes.clone(),
                ..GameSnapshot::default()
            })
            .await;
        engine.on_snapshot(&GameSnapshot::default()).await;
        engine
            .on_snapshot(&GameSnapshot {
                decision: DecisionKind::ChooseTheme,
                table_mode: TableMode::Final,
                round_themes: themes,
                ..GameSnapshot::default()
            })
            .await;

        assert_eq!(
            sink.taken(),
            vec![
                Action::SelectQuestion {
                    theme_index: 0,
                    question_index: 1
                },
                Action::SelectTheme { theme_index: 0 },
            ]
        );
    }

    #[tokio::test]
    async fn free_text_answer_waits_for_generation() {
        let (mut engine, sink) = engine("Volga");
        let snapshot = GameSnapshot {
            decision: DecisionKind::Answer,
            question: question(1, "Longest river in Europe?"),
            ..GameSnapshot::default()
        };
        engine.on_snapshot(&snapshot).await;
        assert!(sink.taken().is_empty());

        deliver_generation(&mut engine).await;
        assert_eq!(sink.taken(), vec![Action::SendAnswer { text: "Volga".into() }]);
        assert!(!engine.prepared().ready);
    }

    #[tokio::test]
    async fn stale_generation_is_discarded() {
        let (mut engine, sink) = engine("Volga");
        engine
            .on_snapshot(&GameSnapshot {
                question: question(1, "first"),
                ..GameSnapshot::default()
            })
            .await;
        engine
            .on_snapshot(&GameSnapshot {
                question: question(2, "second"),
                can_press_button: true,
                ..GameSnapshot::default()
            })
            .await;

        deliver_generation(&mut engine).await;
        assert!(!engine.prepared().ready);
        assert!(sink.taken().is_empty());
    }

    #[tokio::test]
    async fn confident_answer_presses_when_button_already_enabled() {
        let (mut engine, sink) = engine("Volga");
        engine
            .on_snapshot(&GameSnapshot {
                question: question(1, "Longest river in Europe?"),
                can_press_button: true,
                ..GameSnapshot::default()
            })
            .await;
        deliver_generation(&mut engine).await;

        let actions = sink.taken();
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], Action::PressButton { .. }));
        assert!(engine.prepared().is_confident());
    }

    #[tokio::test]
    async fn sentinel_never_presses_the_button() {
        let (mut engine, sink) = engine(NO_ANSWER);
        engine
            .on_snapshot(&GameSnapshot {
                question: question(1, "?"),
                ..GameSnapshot::default()
            })
            .await;
        deliver_generation(&mut engine).await;
        engine
            .on_snapshot(&GameSnapshot {
                question: question(1, "?"),
                can_press_button: true,
                ..GameSnapshot::default()
            })
            .await;
        assert!(sink.taken().is_empty());
    }

    #[tokio::test]
    async fn options_layout_matches_prepared_answer() {
        let (mut engine, sink) = engine("paris");
        let mut snapshot = GameSnapshot {
            question: question(3, "Capital of France?"),
            layout: LayoutMode::AnswerOptions,
            answer_options: vec![
                AnswerOption {
                    label: "A".into(),
                    text: "London".into(),
                    state: ItemState::Normal,
                },
                AnswerOption {
                    label: "B".into(),
                    text: "Paris".into(),
                    state: ItemState::Normal,
                },
            ],
            ..GameSnapshot::default()
        };
        engine.on_snapshot(&snapshot).await;
        deliver_generation(&mut engine).await;

        snapshot.decision = DecisionKind::Answer;
        engine.on_snapshot(&snapshot).await;
        assert_eq!(sink.taken(), vec![Action::SelectAnswerOption { label: "B".into() }]);
    }

    #[tokio::test]
    async fn newer_question_is_generated_after_a_stale_result() {
        let (mut engine, sink) = engine("Volga");
        engine
            .on_snapshot(&GameSnapshot {
                question: question(1, "first"),
                ..GameSnapshot::default()
            })
            .await;
        let second = GameSnapshot {
            question: question(2, "Longest river in Europe?"),
            ..GameSnapshot::default()
        };
        engine.on_snapshot(&second).await;
        engine
            .on_snapshot(&GameSnapshot {
                decision: DecisionKind::Answer,
                ..second
            })
            .await;
        assert!(sink.taken().is_empty());

        // Result for question 1 is dropped and question 2 gets its own run.
        deliver_generation(&mut engine).await;
        assert!(sink.taken().is_empty());
        deliver_generation(&mut engine).await;
        assert_eq!(sink.taken(), vec![Action::SendAnswer { text: "Volga".into() }]);
    }

    #[tokio::test]
    async fn answer_without_prompt_falls_back_after_a_stale_result() {
        let (mut engine, sink) = engine("Volga");
        engine
            .on_snapshot(&GameSnapshot {
                question: question(1, "first"),
                ..GameSnapshot::default()
            })
            .await;
        engine
            .on_snapshot(&GameSnapshot {
                decision: DecisionKind::Answer,
                question: question(2, ""),
                ..GameSnapshot::default()
            })
            .await;

        deliver_generation(&mut engine).await;
        assert_eq!(
            sink.taken(),
            vec![Action::SendAnswer {
                text: NO_ANSWER.into()
            }]
        );
        assert!(engine.generated_rx.try_recv().is_err());
    }

    /// Records actions after a delay, like a real round trip.
    #[derive(Clone, Default)]
    struct SlowSink(RecordingSink);

    #[async_trait]
    impl ActionSink for SlowSink {
        async fn perform(&self, action: Action) -> Result<()> {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            self.0.perform(action).await
        }
    }

    /// `Receive("stake" | "none")` sets the decision kind.
    struct StakeProjector;

    impl StateProjector for StakeProjector {
        fn apply(&mut self, _target: &str, arguments: &[Value], current: &GameSnapshot) -> Option<GameSnapshot> {
            let decision = match arguments.first()?.as_str()? {
                "stake" => DecisionKind::Stake,
                "none" => DecisionKind::None,
                _ => return None,
            };
            Some(GameSnapshot {
                decision,
                stakes: StakeBounds {
                    minimum: 100,
                    maximum: 500,
                    step: 100,
                    modes: StakeModes::PASS,
                },
                ..current.clone()
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transitions_during_a_slow_action_are_not_lost() {
        let sink = SlowSink::default();
        let recorded = sink.0.clone();
        let engine = DecisionEngine::with_seed(sink, AnswerReasoner::new(Arc::new(FixedGenerator(NO_ANSWER))), 1);
        let (publisher, _latest) = SnapshotPublisher::new(StakeProjector);
        let task = tokio::spawn(engine.run(publisher.updates()));

        publisher.on_message("Receive", &[Value::from("stake")]);
        tokio::task::yield_now().await;
        // Both arrive while the first stake is still being sent.
        publisher.on_message("Receive", &[Value::from("none")]);
        publisher.on_message("Receive", &[Value::from("stake")]);
        drop(publisher);
        task.await.unwrap();

        assert_eq!(
            recorded.taken(),
            vec![Action::Stake(StakeDecision::Pass), Action::Stake(StakeDecision::Pass)]
        );
    }
}
