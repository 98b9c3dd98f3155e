use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::{
    services::messages::ServerMessage,
    state_machine::{
        coordinator::{RoundCommit, RoundState},
        phases::{Open, Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    storage::{LedgerStorage, RoundOutcome, RoundRecord, Snapshot},
};

/// The closed state.
#[derive(Debug)]
pub struct Closed {
    round: RoundState,
    commit: Option<RoundCommit>,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Closed, T>
where
    T: LedgerStorage,
{
    const NAME: PhaseName = PhaseName::Closed;

    /// Archives the round and commits its results.
    ///
    /// The snapshot is written before the round record. A round only counts as committed once
    /// its `CLOSED` record is in the ledger, so a failed write leaves the in-memory state of the
    /// previous round in place and sends the clients a `RESYNC` with that state.
    async fn process(&mut self) -> Result<(), PhaseError> {
        let commit = self
            .private
            .commit
            .take()
            .ok_or(PhaseError::Internal("closed round without aggregation result"))?;
        let record = match self.archive(&commit).await {
            Ok(record) => record,
            Err(err) => {
                self.resync_clients();
                return Err(err);
            }
        };

        let RoundCommit {
            outcome,
            reputation,
            convergence,
            signal,
        } = commit;
        let state = &mut self.shared.state;
        let spent = state.privacy.commit_round();
        state.reputation = reputation;
        state.convergence = convergence;
        state.convergence_signal = Some(signal);
        state.global_state = Arc::new(outcome.global_state);
        info!(
            "round {} closed: {} contributions, privacy spend {}",
            record.round_id,
            record.admitted_count,
            spent
        );
        Ok(())
    }

    fn broadcast(&mut self) {
        info!("broadcasting the committed global state");
        let state = &self.shared.state;
        let global_state = state.global_state.clone();
        let signal = state.convergence_signal;
        self.shared.events.broadcast_model(global_state);
        self.shared.events.broadcast_convergence(signal);
    }

    async fn next(self) -> Option<StateMachine<T>> {
        Some(PhaseState::<Open, _>::new(self.shared).into())
    }
}

impl<T> PhaseState<Closed, T>
where
    T: LedgerStorage,
{
    /// Appends the snapshot and then the `CLOSED` record of the round.
    async fn archive(&mut self, commit: &RoundCommit) -> Result<RoundRecord, PhaseError> {
        let round = &self.private.round;
        let round_id = self.shared.state.round_id;

        let snapshot = Snapshot {
            round_id,
            global_state: commit.outcome.global_state.clone(),
            reputations: commit.reputation.records(),
        };
        self.shared
            .store
            .append_snapshot(&snapshot)
            .await
            .map_err(PhaseError::Ledger)?;

        let record = RoundRecord {
            round_id,
            status: RoundOutcome::Closed,
            participant_ids: round.participant_ids(),
            admitted_count: round.admitted.len(),
            convergence_score: Some(commit.outcome.convergence_score),
            accuracy_delta: Some(commit.outcome.accuracy_delta),
            privacy_spent: round.privacy_spent(),
            participations: round.participations(&commit.outcome),
            started_at: round.started_at,
            timestamp: Utc::now(),
        };
        self.shared
            .store
            .append_round(&record)
            .await
            .map_err(PhaseError::Ledger)?;
        Ok(record)
    }

    /// Points the clients back to the committed global state. The update they got while
    /// broadcasting never took effect.
    fn resync_clients(&mut self) {
        let state = &mut self.shared.state;
        let message = ServerMessage::Resync {
            version: state.global_state.version,
            global_state: state.global_state.clone(),
        };
        let delivered = state.connections.broadcast(&message);
        warn!(
            "round {} was not committed, resynchronized {} clients",
            state.round_id, delivered
        );
    }
}

impl<T> PhaseState<Closed, T> {
    /// Creates a new closed state.
    pub fn new(shared: Shared<T>, round: RoundState, commit: RoundCommit) -> Self {
        Self {
            private: Closed {
                round,
                commit: Some(commit),
            },
            shared,
        }
    }
}
