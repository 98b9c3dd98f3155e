use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    common::GlobalState,
    services::messages::ServerMessage,
    state_machine::{
        phases::{Collecting, Handler, Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    storage::LedgerStorage,
};

/// The open state.
#[derive(Debug)]
pub struct Open;

#[async_trait]
impl<T> Phase<T> for PhaseState<Open, T>
where
    T: LedgerStorage,
{
    const NAME: PhaseName = PhaseName::Open;

    async fn process(&mut self) -> Result<(), PhaseError> {
        self.shared.state.connections.reset_round();
        self.apply_pending_schema();

        let state = &mut self.shared.state;
        let message = ServerMessage::RoundOpened {
            round_id: state.round_id,
            version: state.global_state.version,
            collect_timeout: state.round.collect_timeout,
        };
        let delivered = state.connections.broadcast(&message);
        info!("announced round {} to {} clients", state.round_id, delivered);

        let open_time = self.shared.state.round.open_time();
        self.process_during(open_time).await
    }

    async fn next(self) -> Option<StateMachine<T>> {
        Some(PhaseState::<Collecting, _>::new(self.shared).into())
    }
}

#[async_trait]
impl<T> Handler for PhaseState<Open, T> where T: LedgerStorage {}

impl<T> PhaseState<Open, T> {
    /// Creates a new open state.
    pub fn new(mut shared: Shared<T>) -> Self {
        // Since some events are emitted very early, the round id must
        // be correct when the open phase starts. Therefore, we update
        // it here, when instantiating the open PhaseState.
        shared.set_round_id(shared.round_id() + 1);
        debug!("new round ID = {}", shared.round_id());
        Self {
            private: Open,
            shared,
        }
    }

    /// Replaces the global state by an all-zero state of the next schema version if a schema
    /// change is pending. Every client is told to resynchronize.
    fn apply_pending_schema(&mut self) {
        let state = &mut self.shared.state;
        let length = match state.pending_schema.take() {
            Some(length) => length,
            None => return,
        };

        let version = state.global_state.version.next();
        info!("switching to schema version {} of length {}", version, length);
        let global_state = Arc::new(GlobalState::zeroed(version, length));
        state.global_state = global_state.clone();
        state.connections.broadcast(&ServerMessage::Resync {
            version,
            global_state: global_state.clone(),
        });
        self.shared.events.broadcast_model(global_state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::SchemaVersion,
        state_machine::tests::{builder::StateMachineBuilder, utils},
        storage::MemoryLedger,
    };

    #[tokio::test]
    async fn test_open_to_collecting() {
        utils::enable_logging();
        let (state_machine, _request_tx, events) = StateMachineBuilder::new(MemoryLedger::new())
            .with_round_id(2)
            .build();
        assert!(state_machine.is_open());

        let state_machine = state_machine.next().await.unwrap();
        assert!(state_machine.is_collecting());
        let state = state_machine.into_collecting_phase_state();
        assert_eq!(state.shared.round_id(), 2);
        assert_eq!(events.phase_listener().get_latest().event, PhaseName::Open);
        assert_eq!(events.phase_listener().get_latest().round_id, 2);
    }

    #[tokio::test]
    async fn test_pending_schema_is_applied() {
        utils::enable_logging();
        let mut builder = StateMachineBuilder::new(MemoryLedger::new()).with_pending_schema(7);
        let mut registration = builder.register("a", 100);
        let (state_machine, _request_tx, events) = builder.build();

        let state_machine = state_machine.next().await.unwrap();
        let state = state_machine.into_collecting_phase_state();
        let global_state = &state.shared.state.global_state;
        assert_eq!(global_state.len(), 7);
        assert_eq!(global_state.version, SchemaVersion::INITIAL.next());
        assert!(state.shared.state.pending_schema.is_none());
        assert_eq!(events.model_listener().get_latest().event.len(), 7);

        assert!(matches!(
            registration.outbound.recv().await,
            Some(ServerMessage::Resync { .. })
        ));
        assert!(matches!(
            registration.outbound.recv().await,
            Some(ServerMessage::RoundOpened { round_id: 1, .. })
        ));
    }
}
