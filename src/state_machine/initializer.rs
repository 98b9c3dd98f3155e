//! A state machine initializer that rebuilds the coordinator state from the round ledger.

use std::{collections::HashSet, sync::Arc};

use thiserror::Error;
use tracing::{debug, info};

use crate::{
    common::RoundId,
    connections::AdmissionPolicy,
    settings::CoordinatorSettings,
    state_machine::{
        coordinator::CoordinatorState,
        events::{EventPublisher, EventSubscriber},
        phases::{Open, PhaseName, PhaseState, Shared},
        requests::{RequestReceiver, RequestSender},
        StateMachine,
    },
    storage::{LedgerStorage, StorageError},
};

type StateMachineInitializationResult<T> = Result<T, StateMachineInitializationError>;

/// Errors which can occur during the initialization of the [`StateMachine`].
#[derive(Debug, Error)]
pub enum StateMachineInitializationError {
    #[error("failed to read the round ledger: {0}")]
    Ledger(#[from] StorageError),
    #[error("round {0} is closed but its snapshot is missing")]
    SnapshotMissing(RoundId),
}

/// The state machine initializer that initializes a new state machine.
pub struct StateMachineInitializer<T> {
    settings: CoordinatorSettings,
    store: T,
    admission: Option<Box<dyn AdmissionPolicy>>,
}

impl<T> StateMachineInitializer<T>
where
    T: LedgerStorage,
{
    /// Creates a new [`StateMachineInitializer`].
    pub fn new(settings: CoordinatorSettings, store: T) -> Self {
        Self {
            settings,
            store,
            admission: None,
        }
    }

    /// Replaces the admission policy derived from the connection settings.
    pub fn with_admission_policy(mut self, admission: Box<dyn AdmissionPolicy>) -> Self {
        self.admission = Some(admission);
        self
    }

    /// Initializes a new [`StateMachine`].
    ///
    /// The coordinator state is restored from the ledger: committed privacy spend, reputations,
    /// global state and convergence history are taken from rounds marked `CLOSED` only. Charges
    /// of any other round are discarded. The first round gets an id above every id in the
    /// ledger.
    ///
    /// # Errors
    /// Fails if the ledger cannot be read or is inconsistent.
    pub async fn init(
        mut self,
    ) -> StateMachineInitializationResult<(StateMachine<T>, RequestSender, EventSubscriber)> {
        let state = self.restore().await?;

        let (event_publisher, event_subscriber) = EventPublisher::init(
            state.round_id,
            PhaseName::Open,
            state.global_state.clone(),
        );
        let (request_rx, request_tx) = RequestReceiver::new();
        let shared = Shared::new(state, event_publisher, request_rx, self.store);

        let state_machine = StateMachine::from(PhaseState::<Open, _>::new(shared));
        Ok((state_machine, request_tx, event_subscriber))
    }

    async fn restore(&mut self) -> StateMachineInitializationResult<CoordinatorState> {
        let mut state = match self.admission.take() {
            Some(admission) => CoordinatorState::with_admission_policy(&self.settings, admission),
            None => CoordinatorState::new(&self.settings),
        };

        let mut rounds = self.store.rounds().await?;
        let charges = self.store.charges().await?;
        if rounds.is_empty() && charges.is_empty() {
            info!("empty ledger: starting from the initial state");
            return Ok(state);
        }
        rounds.sort_by_key(|record| record.round_id);

        state.round_id = rounds
            .iter()
            .map(|record| record.round_id)
            .chain(charges.iter().map(|entry| entry.round_id))
            .max()
            .unwrap_or_default();

        let closed: HashSet<RoundId> = rounds
            .iter()
            .filter(|record| record.is_closed())
            .map(|record| record.round_id)
            .collect();
        state.privacy.restore(&charges, &closed);

        if let Some(latest) = rounds.iter().rev().find(|record| record.is_closed()) {
            let snapshot = self
                .store
                .snapshot(latest.round_id)
                .await?
                .ok_or(StateMachineInitializationError::SnapshotMissing(latest.round_id))?;
            debug!("restoring the snapshot of round {}", latest.round_id);
            state.global_state = Arc::new(snapshot.global_state);
            state.reputation.restore(snapshot.reputations);
        }
        state.convergence.restore(
            rounds
                .iter()
                .filter(|record| record.is_closed())
                .filter_map(|record| record.convergence_score),
        );

        info!(
            "restored the coordinator state: {} closed of {} recorded rounds, last round {}",
            closed.len(),
            rounds.len(),
            state.round_id
        );
        Ok(state)
    }
}
