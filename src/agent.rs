//! Unattended play: bootstrap into a game, then let the decision engine
//! answer every prompt until the host connection goes away.

use std::sync::Arc;

use tracing::info;

use crate::bootstrap::{BootstrapOutcome, SessionBootstrapper};
use crate::engine::DecisionEngine;
use crate::error::Result;
use crate::listeners::ConnectionListener;
use crate::reasoner::AnswerReasoner;
use crate::snapshot::{SnapshotPublisher, StateProjector};

/// Plays a whole game without a human.
pub struct AutonomousAgent {
    bootstrapper: SessionBootstrapper,
    reasoner: AnswerReasoner,
    seed: Option<u64>,
}

impl AutonomousAgent {
    pub fn new(bootstrapper: SessionBootstrapper, reasoner: AnswerReasoner) -> Self {
        Self {
            bootstrapper,
            reasoner,
            seed: None,
        }
    }

    /// Make the engine's random choices reproducible.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Bootstrap with `projector` folding host events into snapshots, then
    /// run the engine until the snapshot stream ends. Leaves the session
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Returns the bootstrap error. Errors of individual actions are logged
    /// by the engine and do not stop play.
    pub async fn play<P: StateProjector>(self, projector: P) -> Result<BootstrapOutcome> {
        let (publisher, snapshots) = SnapshotPublisher::new(projector);
        let publisher = Arc::new(publisher);
        let outcome = self
            .bootstrapper
            .run(Arc::clone(&publisher) as Arc<dyn ConnectionListener>, snapshots)
            .await?;

        info!(game_id = outcome.game_id, "autonomous play started");
        let engine = match self.seed {
            Some(seed) => DecisionEngine::with_seed(outcome.actions.clone(), self.reasoner, seed),
            None => DecisionEngine::new(outcome.actions.clone(), self.reasoner),
        };
        let updates = publisher.updates();
        // The host's listener task now owns the publisher. When the host
        // connection ends the sender drops and the engine stops.
        drop(publisher);
        engine.run(updates).await;
        info!(game_id = outcome.game_id, "autonomous play finished");

        self.bootstrapper.session().log_out().await;
        Ok(outcome)
    }
}

impl std::fmt::Debug for AutonomousAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutonomousAgent")
            .field("bootstrapper", &self.bootstrapper)
            .field("reasoner", &self.reasoner)
            .field("seed", &self.seed)
            .finish()
    }
}
