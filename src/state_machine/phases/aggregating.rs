use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    aggregator::AggregationError,
    reputation::{AggregateOutcome, ContributionObservation},
    state_machine::{
        coordinator::{RoundCommit, RoundState},
        phases::{Broadcasting, Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    storage::LedgerStorage,
};

/// The aggregating state.
#[derive(Debug)]
pub struct Aggregating {
    round: RoundState,
    /// The aggregation result, once available.
    commit: Option<RoundCommit>,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Aggregating, T>
where
    T: LedgerStorage,
{
    const NAME: PhaseName = PhaseName::Aggregating;

    /// Aggregates the admitted contributions and derives the reputation and convergence updates.
    ///
    /// Nothing is committed here: the results take effect once the round is closed.
    async fn process(&mut self) -> Result<(), PhaseError> {
        let state = &self.shared.state;
        let round = &self.private.round;

        let outcome = state.aggregator.aggregate(
            state.round_id,
            &state.global_state,
            &round.admitted,
            |client_id| state.reputation.weight_for(client_id),
        )?;

        info!("updating reputations");
        let mut reputation = state.reputation.clone();
        let aggregate = AggregateOutcome {
            round_id: state.round_id,
            step: &outcome.step,
            accuracy_delta: outcome.accuracy_delta,
        };
        for contribution in &round.admitted {
            let observation = ContributionObservation {
                delta: contribution.delta.as_slice(),
                accuracy_delta: contribution.accuracy_delta,
            };
            reputation.observe(&contribution.client_id, &observation, &aggregate);
        }
        for client_id in state
            .known_clients()
            .iter()
            .filter(|client_id| !round.submitted.contains(*client_id))
        {
            if round.penalized.contains(client_id) {
                let score = reputation.observe_rejection(client_id, state.round_id);
                debug!("client {} was rejected, reputation {:.4}", client_id, score);
            } else {
                let score = reputation.observe_absence(client_id, state.round_id);
                debug!("client {} was absent, reputation {:.4}", client_id, score);
            }
        }

        let mut convergence = state.convergence.clone();
        let signal = convergence.record(outcome.convergence_score);
        if signal.converged {
            info!(
                "training converged: {} rounds below the threshold",
                signal.streak
            );
        }

        self.private.commit = Some(RoundCommit {
            outcome,
            reputation,
            convergence,
            signal,
        });
        Ok(())
    }

    async fn next(self) -> Option<StateMachine<T>> {
        let PhaseState {
            private: Aggregating { round, commit },
            shared,
        } = self;
        Some(match commit {
            Some(commit) => PhaseState::<Broadcasting, _>::new(shared, round, commit).into(),
            None => PhaseState::<Aggregating, _>::new(shared, round)
                .into_failure_state(AggregationError::NoContributions.into()),
        })
    }
}

impl<T> PhaseState<Aggregating, T> {
    /// Creates a new aggregating state.
    pub fn new(shared: Shared<T>, round: RoundState) -> Self {
        Self {
            private: Aggregating {
                round,
                commit: None,
            },
            shared,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::ClientId,
        state_machine::tests::{builder::StateMachineBuilder, utils},
        storage::MemoryLedger,
    };

    #[tokio::test]
    async fn test_aggregating_without_contributions_fails() {
        utils::enable_logging();
        let (state_machine, _request_tx, events) = StateMachineBuilder::new(MemoryLedger::new())
            .with_phase(Aggregating {
                round: RoundState::new(),
                commit: None,
            })
            .build();
        assert!(state_machine.is_aggregating());

        let state_machine = state_machine.next().await.unwrap();
        assert!(state_machine.is_failure());
        assert_eq!(
            events.phase_listener().get_latest().event,
            PhaseName::Aggregating
        );
    }

    #[tokio::test]
    async fn test_aggregating_leaves_committed_state_untouched() {
        utils::enable_logging();
        let mut round = RoundState::new();
        round.admitted.push(utils::admitted("a", vec![1.0, 0.0, 0.0, 0.0], 100));
        round.admitted.push(utils::admitted("b", vec![0.0, 1.0, 0.0, 0.0], 100));
        round.submitted.insert(ClientId::from("a"));
        round.submitted.insert(ClientId::from("b"));

        let (state_machine, _request_tx, _events) = StateMachineBuilder::new(MemoryLedger::new())
            .with_phase(Aggregating {
                round,
                commit: None,
            })
            .build();

        let state_machine = state_machine.next().await.unwrap();
        assert!(state_machine.is_broadcasting());
        let state = state_machine.into_broadcasting_phase_state();
        assert_eq!(state.shared.state.global_state.weights, vec![0.; 4]);
        assert!(state.shared.state.reputation.records().is_empty());

        let commit = &state.private.commit;
        assert_eq!(commit.outcome.global_state.weights, vec![0.5, 0.5, 0., 0.]);
        assert_eq!(commit.reputation.records().len(), 2);
        assert_eq!(commit.signal.streak, 0);
    }
}
