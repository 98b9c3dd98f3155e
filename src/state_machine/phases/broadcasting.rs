use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::{
    services::messages::ServerMessage,
    state_machine::{
        coordinator::{RoundCommit, RoundState},
        phases::{Closed, Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    storage::LedgerStorage,
};

/// The broadcasting state.
#[derive(Debug)]
pub struct Broadcasting {
    pub(in crate::state_machine) round: RoundState,
    pub(in crate::state_machine) commit: RoundCommit,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Broadcasting, T>
where
    T: LedgerStorage,
{
    const NAME: PhaseName = PhaseName::Broadcasting;

    /// Pushes the new global state to every connected client.
    ///
    /// Delivery never waits on a client. A client that misses the update catches up by asking
    /// for the current state.
    async fn process(&mut self) -> Result<(), PhaseError> {
        let message = ServerMessage::BroadcastUpdate {
            round_id: self.shared.state.round_id,
            global_state: Arc::new(self.private.commit.outcome.global_state.clone()),
            convergence: self.private.commit.signal,
        };
        let delivered = self.shared.state.connections.broadcast(&message);
        info!(
            "pushed the new global state to {} of {} connected clients",
            delivered,
            self.shared.state.connections.connected_count()
        );
        Ok(())
    }

    async fn next(self) -> Option<StateMachine<T>> {
        let PhaseState {
            private: Broadcasting { round, commit },
            shared,
        } = self;
        Some(PhaseState::<Closed, _>::new(shared, round, commit).into())
    }
}

impl<T> PhaseState<Broadcasting, T> {
    /// Creates a new broadcasting state.
    pub fn new(shared: Shared<T>, round: RoundState, commit: RoundCommit) -> Self {
        Self {
            private: Broadcasting { round, commit },
            shared,
        }
    }
}
