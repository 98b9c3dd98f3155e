use std::{future::pending, pin::Pin};

use async_trait::async_trait;
use tokio::time::{sleep, Sleep};
use tracing::{debug, info, warn};

use crate::{
    aggregator::AdmittedContribution,
    connections::{ConnectionError, ConnectionState},
    privacy::PrivacyLedgerEntry,
    state_machine::{
        coordinator::RoundState,
        phases::{Aggregating, Handler, Phase, PhaseError, PhaseName, PhaseState, Shared, TimedOut},
        requests::{Admission, RequestError, Response},
        StateMachine,
    },
    storage::LedgerStorage,
    validation::{Contribution, RoundContext, ValidationError},
};

/// The collecting state.
#[derive(Debug)]
pub struct Collecting {
    /// The contributions admitted so far.
    round: RoundState,
    /// Whether the quorum was met when collection ended.
    quorum_met: bool,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Collecting, T>
where
    T: LedgerStorage,
{
    const NAME: PhaseName = PhaseName::Collecting;

    /// Collects contributions until the round is full, the last call after reaching the quorum
    /// is over or the collection deadline is reached.
    async fn process(&mut self) -> Result<(), PhaseError> {
        let settings = self.shared.state.round;
        let deadline = sleep(settings.collect_timeout());
        tokio::pin!(deadline);
        let mut last_call: Option<Pin<Box<Sleep>>> = None;

        loop {
            let quorum_met = self.quorum_met();
            if quorum_met && self.private.round.admitted.len() as u64 >= settings.max_contributions
            {
                info!("round is full");
                break;
            }
            if quorum_met && last_call.is_none() {
                info!(
                    "quorum of {} reached, closing in {} seconds",
                    settings.quorum, settings.grace_period
                );
                last_call = Some(Box::pin(sleep(settings.grace_period())));
            } else if !quorum_met && last_call.is_some() {
                warn!("quorum lost, cancelling the last call");
                last_call = None;
            }

            tokio::select! {
                biased;

                _ = &mut deadline => {
                    debug!("collection deadline reached");
                    break;
                }
                _ = async {
                    match last_call.as_mut() {
                        Some(last_call) => last_call.as_mut().await,
                        None => pending().await,
                    }
                } => {
                    debug!("last call is over");
                    break;
                }
                next = self.next_incoming() => {
                    self.process_incoming(next?).await;
                }
            }
        }

        self.private.quorum_met = self.quorum_met();
        let round = &self.private.round;
        info!(
            "collected {} contributions ({} rejected, {} discarded), quorum {}",
            round.admitted.len(),
            round.rejected,
            round.discarded,
            if self.private.quorum_met { "met" } else { "missed" },
        );
        Ok(())
    }

    async fn next(self) -> Option<StateMachine<T>> {
        let PhaseState {
            private: Collecting { round, quorum_met },
            shared,
        } = self;
        Some(if quorum_met {
            PhaseState::<Aggregating, _>::new(shared, round).into()
        } else {
            PhaseState::<TimedOut, _>::new(shared, round).into()
        })
    }
}

#[async_trait]
impl<T> Handler for PhaseState<Collecting, T>
where
    T: LedgerStorage,
{
    async fn handle_submit(&mut self, contribution: Contribution) -> Result<Response, RequestError> {
        let response = self.admit(contribution).await;
        if response.is_err() {
            self.private.round.rejected += 1;
        }
        response
    }
}

impl<T> PhaseState<Collecting, T> {
    /// Creates a new collecting state.
    pub fn new(shared: Shared<T>) -> Self {
        Self {
            private: Collecting {
                round: RoundState::new(),
                quorum_met: false,
            },
            shared,
        }
    }

    fn quorum_met(&self) -> bool {
        self.private
            .round
            .quorum_count(&self.shared.state.connections)
            >= self.shared.state.round.quorum
    }
}

impl<T> PhaseState<Collecting, T>
where
    T: LedgerStorage,
{
    /// Validates, charges, noises and records a contribution.
    ///
    /// The charge is written to the ledger before the contribution counts as admitted. If the
    /// write fails, the charge is revoked and the contribution is rejected.
    async fn admit(&mut self, contribution: Contribution) -> Result<Response, RequestError> {
        let state = &mut self.shared.state;
        let round = &mut self.private.round;
        let client_id = contribution.client_id.clone();

        if state.connections.state(&client_id) == ConnectionState::Disconnected {
            return Err(ConnectionError::NotConnected(client_id).into());
        }

        let ctx = RoundContext {
            phase: PhaseName::Collecting,
            round_id: state.round_id,
            version: state.global_state.version,
            model_length: state.global_state.len(),
            submitted: &round.submitted,
        };
        if let Err(err) = state.validator.validate(&contribution, &ctx) {
            if let ValidationError::MalformedPayload(_)
            | ValidationError::ImplausibleMetric(_)
            | ValidationError::NormExceeded { .. } = err
            {
                // the reputation cost is charged once, when the round is aggregated
                round.penalized.insert(client_id);
            }
            return Err(err.into());
        }

        if round.admitted.len() as u64 >= state.round.max_contributions {
            round.discarded += 1;
            return Err(RequestError::MessageDiscarded);
        }

        let epsilon = contribution
            .epsilon
            .unwrap_or(state.privacy_settings.epsilon_per_round);
        if !epsilon.is_finite() || epsilon <= 0. {
            return Err(
                ValidationError::ImplausibleMetric(format!("requested epsilon {}", epsilon)).into(),
            );
        }
        let charge = state.privacy.charge(&client_id, state.round_id, epsilon)?;

        let Contribution {
            mut delta,
            accuracy_delta,
            noised,
            ..
        } = contribution;
        let noise = if !noised && state.privacy_settings.server_noise {
            match state.mechanism.privatize(&mut delta, epsilon) {
                Ok(noise) => Some(noise),
                Err(err) => {
                    state.privacy.revoke(&charge);
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        let entry = PrivacyLedgerEntry::new(&charge, noise);
        if let Err(err) = self.shared.store.append_charge(&entry).await {
            warn!("failed to record the privacy charge of client {}: {}", client_id, err);
            state.privacy.revoke(&charge);
            return Err(RequestError::Ledger(err));
        }

        let dataset_size = state
            .connections
            .capabilities(&client_id)
            .map(|capabilities| capabilities.dataset_size)
            .unwrap_or_default();
        state.connections.mark_in_round(&client_id);
        if let Some(stats) = state.connections.stats_mut(&client_id) {
            stats.record_admitted(accuracy_delta);
        }
        round.submitted.insert(client_id.clone());
        round.admitted.push(AdmittedContribution {
            client_id: client_id.clone(),
            delta,
            accuracy_delta,
            dataset_size,
            epsilon,
            noise,
        });
        info!(
            "admitted contribution of client {} ({} admitted)",
            client_id,
            round.admitted.len()
        );

        Ok(Response::Admitted(Admission {
            round_id: state.round_id,
            epsilon,
            remaining_budget: state.privacy.remaining(&client_id),
        }))
    }
}
