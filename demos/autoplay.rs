//! # Autoplay
//!
//! Logs on to a trivia server, creates a game with computer opponents and
//! plays it unattended.
//!
//! ## Running
//!
//! ```sh
//! TRIVIA_SERVER=https://trivia.example TRIVIA_LOGIN=robot \
//!     RUST_LOG=trivia_session=debug cargo run --example autoplay
//! ```
//!
//! With `OPENAI_API_KEY` set, questions are answered through the reasoning
//! service; without it the agent abstains and only makes table decisions.
//!
//! The projector below understands just enough game messages to drive the
//! engine. A real client plugs in its full state model instead.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use trivia_session::protocol::{PackageKey, Role};
use trivia_session::reasoner::AbstainingGenerator;
use trivia_session::snapshot::{DecisionKind, GameSnapshot, QuestionInfo, StateProjector, TableMode, ThemeInfo};
use trivia_session::{
    AnswerGenerator, AnswerReasoner, AutonomousAgent, BootstrapConfig, ChatCompletionGenerator,
    GamePlan, NewGameOptions, ReasonerConfig, SessionBootstrapper, SessionManager, WebSocketConnector,
};

/// Folds `Receive` system messages into snapshots.
#[derive(Default)]
struct MinimalProjector {
    question_sequence: u64,
}

impl StateProjector for MinimalProjector {
    fn apply(&mut self, target: &str, arguments: &[Value], current: &GameSnapshot) -> Option<GameSnapshot> {
        if target != "Receive" {
            return None;
        }
        let text = arguments.first()?.get("Text")?.as_str()?;
        let mut parts = text.split('\n');
        let command = parts.next()?;
        let args: Vec<&str> = parts.collect();
        let mut next = current.clone();

        match command {
            "STAGE" => {
                next.is_game_started = args.first().is_some_and(|stage| *stage != "Before");
                next.decision = DecisionKind::None;
            }
            "ROUNDTHEMES" => {
                next.round_themes = args
                    .iter()
                    .skip(1)
                    .map(|name| ThemeInfo {
                        name: (*name).to_string(),
                        questions: vec![],
                    })
                    .collect();
                next.table_mode = TableMode::RoundThemes;
            }
            "TABLO2" => {
                next.round_themes = args
                    .iter()
                    .zip(next.round_themes.iter().map(|t| t.name.clone()).chain(std::iter::repeat(String::new())))
                    .map(|(prices, name)| ThemeInfo {
                        name,
                        questions: prices.split(':').map(|p| p.parse().unwrap_or(-1)).collect(),
                    })
                    .collect();
                next.table_mode = TableMode::RoundTable;
            }
            "QUESTION" => {
                self.question_sequence += 1;
                next.question = Some(QuestionInfo {
                    sequence: self.question_sequence,
                    text: args.first().copied().unwrap_or_default().to_string(),
                    theme_name: None,
                    comment: None,
                });
            }
            "TRY" => next.can_press_button = true,
            "ENDTRY" | "STOP" => next.can_press_button = false,
            "CHOOSE" => next.decision = DecisionKind::ChooseQuestion,
            "ANSWER" => next.decision = DecisionKind::Answer,
            "CANCEL" => next.decision = DecisionKind::None,
            _ => return None,
        }
        Some(next)
    }
}

fn reasoner() -> AnswerReasoner {
    let config = ReasonerConfig::from_env();
    let generator: Arc<dyn AnswerGenerator> = if config.api_key.is_some() {
        match ChatCompletionGenerator::new(config) {
            Ok(generator) => Arc::new(generator),
            Err(e) => {
                warn!(error = %e, "reasoning service unavailable, abstaining");
                Arc::new(AbstainingGenerator)
            }
        }
    } else {
        Arc::new(AbstainingGenerator)
    };
    AnswerReasoner::new(generator)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let server = std::env::var("TRIVIA_SERVER").unwrap_or_else(|_| "http://localhost:5000".to_string());
    let login = std::env::var("TRIVIA_LOGIN").unwrap_or_else(|_| "autoplay".to_string());

    let session = Arc::new(SessionManager::new(Arc::new(WebSocketConnector::new())));
    let plan = GamePlan::Create(NewGameOptions::new("autoplay", PackageKey::random()).with_seats(3, 1));
    let config = BootstrapConfig::new(server, login, plan).with_role(Role::Player);

    let agent = AutonomousAgent::new(SessionBootstrapper::new(config, session), reasoner());
    let outcome = agent.play(MinimalProjector::default()).await?;
    info!(game_id = outcome.game_id, "done");
    Ok(())
}
