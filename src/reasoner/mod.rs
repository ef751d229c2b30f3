//! Time-bounded answer generation and answer-option matching.
//!
//! [`AnswerReasoner::generate`] races an [`AnswerGenerator`] against a fixed
//! timeout. Whatever goes wrong (timeout, service error, missing credential,
//! empty output) the result is the [`NO_ANSWER`] sentinel, never an error.
//!
//! [`match_option`] maps a prepared answer onto the selectable options of a
//! multiple-choice question in three tiers:
//!
//! 1. trimmed, case-insensitive exact match;
//! 2. substring in either direction, first on the whole strings, then on the
//!    answer's word fragments of at least three characters;
//! 3. a uniformly random selectable option.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::Result;
use crate::snapshot::{AnswerOption, GameSnapshot, Selectable};

pub mod http;

pub use http::{ChatCompletionGenerator, ReasonerConfig};

/// "No confident answer."
pub const NO_ANSWER: &str = "-";

/// Default deadline of one generation.
pub const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Shortest answer fragment considered by the partial-match tier.
const MIN_FRAGMENT_CHARS: usize = 3;

/// Everything the generator is told about a question.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AnswerPrompt {
    pub question: String,
    pub theme_name: Option<String>,
    pub comment: Option<String>,
    pub options: Vec<String>,
}

impl AnswerPrompt {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_theme(mut self, theme_name: impl Into<String>) -> Self {
        self.theme_name = Some(theme_name.into());
        self
    }

    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    /// Prompt for the current question of `snapshot`, if any.
    pub fn from_snapshot(snapshot: &GameSnapshot) -> Option<Self> {
        let question = snapshot.question.as_ref()?;
        if question.text.trim().is_empty() {
            return None;
        }
        Some(Self {
            question: question.text.clone(),
            theme_name: question.theme_name.clone().filter(|t| !t.is_empty()),
            comment: question.comment.clone().filter(|c| !c.is_empty()),
            options: snapshot
                .answer_options
                .iter()
                .filter(|o| o.is_selectable())
                .map(|o| o.text.clone())
                .collect(),
        })
    }

    /// The text sent to the reasoning service.
    pub fn render(&self) -> String {
        let mut prompt = String::from("You are playing a trivia quiz. Answer the question briefly.\n");
        if let Some(theme) = &self.theme_name {
            prompt.push_str(&format!("Theme: {theme}\n"));
        }
        if let Some(comment) = &self.comment {
            prompt.push_str(&format!("Comment: {comment}\n"));
        }
        prompt.push_str(&format!("Question: {}\n", self.question));
        if !self.options.is_empty() {
            prompt.push_str("Options:\n");
            for option in &self.options {
                prompt.push_str(&format!("- {option}\n"));
            }
            prompt.push_str("Reply with the text of one option.\n");
        }
        prompt.push_str(&format!(
            "If you are not at least 90% confident, respond with exactly {NO_ANSWER}"
        ));
        prompt
    }
}

/// Produces an answer (or [`NO_ANSWER`]) for a prompt.
#[async_trait]
pub trait AnswerGenerator: Send + Sync + 'static {
    /// # Errors
    ///
    /// Any failure; callers degrade it to [`NO_ANSWER`].
    async fn generate(&self, prompt: &AnswerPrompt) -> Result<String>;
}

/// Generator that never answers. Used when no reasoning service is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbstainingGenerator;

#[async_trait]
impl AnswerGenerator for AbstainingGenerator {
    async fn generate(&self, _prompt: &AnswerPrompt) -> Result<String> {
        Ok(NO_ANSWER.to_string())
    }
}

/// Runs generations under a deadline.
#[derive(Clone)]
pub struct AnswerReasoner {
    generator: Arc<dyn AnswerGenerator>,
    timeout: Duration,
}

impl AnswerReasoner {
    pub fn new(generator: Arc<dyn AnswerGenerator>) -> Self {
        Self {
            generator,
            timeout: DEFAULT_GENERATION_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Answer `prompt`, or [`NO_ANSWER`]. The generator future is dropped
    /// when the deadline passes first.
    pub async fn generate(&self, prompt: &AnswerPrompt) -> String {
        match tokio::time::timeout(self.timeout, self.generator.generate(prompt)).await {
            Ok(Ok(answer)) => {
                let answer = answer.trim();
                if answer.is_empty() {
                    NO_ANSWER.to_string()
                } else {
                    debug!(answer, "answer generated");
                    answer.to_string()
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "answer generation failed");
                NO_ANSWER.to_string()
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "answer generation timed out");
                NO_ANSWER.to_string()
            }
        }
    }
}

impl std::fmt::Debug for AnswerReasoner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnswerReasoner")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// `true` for a real answer, `false` for blank or [`NO_ANSWER`].
pub fn is_confident(answer: &str) -> bool {
    let answer = answer.trim();
    !answer.is_empty() && answer != NO_ANSWER
}

/// Index of the option that best matches `answer`, falling back to a random
/// selectable option. `None` only when nothing is selectable.
pub fn match_option<R: Rng>(answer: Option<&str>, options: &[AnswerOption], rng: &mut R) -> Option<usize> {
    let candidates: Vec<(usize, String)> = options
        .iter()
        .enumerate()
        .filter(|(_, o)| o.is_selectable())
        .map(|(i, o)| (i, normalize(&o.text)))
        .collect();
    if candidates.is_empty() {
        return None;
    }

    if let Some(answer) = answer.filter(|a| is_confident(a)) {
        let needle = normalize(answer);
        if let Some(index) = match_text(&needle, &candidates) {
            return Some(index);
        }
        debug!(answer, "no option matched, picking at random");
    }

    let pick = rng.random_range(0..candidates.len());
    candidates.get(pick).map(|(i, _)| *i)
}

fn match_text(needle: &str, candidates: &[(usize, String)]) -> Option<usize> {
    let non_empty = || candidates.iter().filter(|(_, text)| !text.is_empty());

    if let Some((i, _)) = non_empty().find(|(_, text)| text == needle) {
        return Some(*i);
    }
    if let Some((i, _)) = non_empty().find(|(_, text)| text.contains(needle) || needle.contains(text.as_str())) {
        return Some(*i);
    }

    let fragments: Vec<&str> = needle
        .split(|c: char| !c.is_alphanumeric())
        .filter(|f| f.chars().count() >= MIN_FRAGMENT_CHARS)
        .collect();
    non_empty()
        .find(|(_, text)| fragments.iter().any(|f| text.contains(f)))
        .map(|(i, _)| *i)
}

fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
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
    use crate::error::TriviaError;
    use crate::snapshot::{ItemState, QuestionInfo};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn options(texts: &[&str]) -> Vec<AnswerOption> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| AnswerOption {
                label: ((b'A' + i as u8) as char).to_string(),
                text: (*t).to_string(),
                state: ItemState::Normal,
            })
            .collect()
    }

    struct SlowGenerator {
        delay: Duration,
        finished: Arc<AtomicBool>,
    }

    #[async_trait]
    impl AnswerGenerator for SlowGenerator {
        async fn generate(&self, _prompt: &AnswerPrompt) -> Result<String> {
            tokio::time::sleep(self.delay).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok("Paris".to_string())
        }
    }

    struct FailingGenerator;

    #[async_trait]
    impl AnswerGenerator for FailingGenerator {
        async fn generate(&self, _prompt: &AnswerPrompt) -> Result<String> {
            Err(TriviaError::InvalidInput("missing credential".into()))
        }
    }

    #[test]
    fn exact_match_ignores_case_and_whitespace() {
        let mut rng = StdRng::seed_from_u64(0);
        let opts = options(&["Paris", "London"]);
        assert_eq!(match_option(Some("  paris "), &opts, &mut rng), Some(0));
    }

    #[test]
    fn partial_match_uses_word_fragments() {
        let mut rng = StdRng::seed_from_u64(0);
        let opts = options(&["Paris", "London"]);
        assert_eq!(match_option(Some("I think it's Lond"), &opts, &mut rng), Some(1));
        assert_eq!(match_option(Some("London, UK"), &opts, &mut rng), Some(1));
    }

    #[test]
    fn sentinel_falls_back_to_a_selectable_option() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut opts = options(&["Paris", "London", "Rome"]);
        opts[1].state = ItemState::Wrong;
        for _ in 0..50 {
            let picked = match_option(Some(NO_ANSWER), &opts, &mut rng).unwrap();
            assert_ne!(picked, 1);
            let picked = match_option(None, &opts, &mut rng).unwrap();
            assert_ne!(picked, 1);
        }
    }

    #[test]
    fn nothing_selectable_yields_none() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut opts = options(&["Paris"]);
        opts[0].state = ItemState::Right;
        assert_eq!(match_option(Some("Paris"), &opts, &mut rng), None);
    }

    #[test]
    fn prompt_carries_the_confidence_escape() {
        let prompt = AnswerPrompt::new("Capital of France?")
            .with_theme("Geography")
            .with_options(vec!["Paris".into(), "Rome".into()]);
        let text = prompt.render();
        assert!(text.contains("Theme: Geography"));
        assert!(text.contains("- Rome"));
        assert!(text.ends_with("respond with exactly -"));
    }

    #[test]
    fn prompt_from_snapshot_requires_question_text() {
        let mut snapshot = GameSnapshot::default();
        assert!(AnswerPrompt::from_snapshot(&snapshot).is_none());
        snapshot.question = Some(QuestionInfo {
            sequence: 1,
            text: "2 + 2?".into(),
            theme_name: Some(String::new()),
            comment: None,
        });
        let prompt = AnswerPrompt::from_snapshot(&snapshot).unwrap();
        assert_eq!(prompt.question, "2 + 2?");
        assert_eq!(prompt.theme_name, None);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_generator_loses_the_race() {
        let finished = Arc::new(AtomicBool::new(false));
        let reasoner = AnswerReasoner::new(Arc::new(SlowGenerator {
            delay: Duration::from_millis(6000),
            finished: Arc::clone(&finished),
        }));

        assert_eq!(reasoner.generate(&AnswerPrompt::new("q")).await, NO_ANSWER);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn fast_generator_wins_the_race() {
        let finished = Arc::new(AtomicBool::new(false));
        let reasoner = AnswerReasoner::new(Arc::new(SlowGenerator {
            delay: Duration::from_millis(100),
            finished,
        }));
        assert_eq!(reasoner.generate(&AnswerPrompt::new("q")).await, "Paris");
    }

    #[tokio::test]
    async fn generator_errors_degrade_to_sentinel() {
        let reasoner = AnswerReasoner::new(Arc::new(FailingGenerator));
        assert_eq!(reasoner.generate(&AnswerPrompt::new("q")).await, NO_ANSWER);
        assert!(!is_confident(NO_ANSWER));
        assert!(is_confident("Paris"));
    }
}
