use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::{
    services::messages::ServerMessage,
    state_machine::{
        coordinator::RoundState,
        phases::{Open, Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    storage::{LedgerStorage, RoundOutcome, RoundRecord},
};

/// The timed out state.
#[derive(Debug)]
pub struct TimedOut {
    round: RoundState,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<TimedOut, T>
where
    T: LedgerStorage,
{
    const NAME: PhaseName = PhaseName::TimedOut;

    /// Discards the round: the charges of its contributions are rolled back and the global
    /// state stays as it is.
    async fn process(&mut self) -> Result<(), PhaseError> {
        let round = &self.private.round;
        let round_id = self.shared.state.round_id;
        warn!(
            "round {} timed out with {} of {} required contributions",
            round_id,
            round.quorum_count(&self.shared.state.connections),
            self.shared.state.round.quorum
        );
        let rolled_back = self.shared.state.privacy.rollback_round();
        info!("rolled back a privacy spend of {}", rolled_back);

        let record = RoundRecord {
            round_id,
            status: RoundOutcome::TimedOut,
            participant_ids: round.participant_ids(),
            admitted_count: round.admitted.len(),
            convergence_score: None,
            accuracy_delta: None,
            privacy_spent: 0.,
            participations: Vec::new(),
            started_at: round.started_at,
            timestamp: Utc::now(),
        };
        self.shared
            .store
            .append_round(&record)
            .await
            .map_err(PhaseError::Ledger)?;

        self.shared
            .state
            .connections
            .broadcast(&ServerMessage::RoundTimedOut { round_id });
        Ok(())
    }

    async fn next(self) -> Option<StateMachine<T>> {
        Some(PhaseState::<Open, _>::new(self.shared).into())
    }
}

impl<T> PhaseState<TimedOut, T> {
    /// Creates a new timed out state.
    pub fn new(shared: Shared<T>, round: RoundState) -> Self {
        Self {
            private: TimedOut { round },
            shared,
        }
    }
}
