use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::{
    aggregator::AggregationError,
    state_machine::{
        phases::{Open, Phase, PhaseName, PhaseState, Shared, Shutdown},
        StateMachine,
    },
    storage::{LedgerStorage, StorageError},
};

/// Errors which can occur during the execution of the [`StateMachine`].
#[derive(Error, Debug)]
pub enum PhaseError {
    #[error("request channel error: {0}")]
    RequestChannel(&'static str),
    #[error("aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),
    #[error("ledger write failed: {0}")]
    Ledger(StorageError),
    #[error("internal error: {0}")]
    Internal(&'static str),
}

/// The failure state.
#[derive(Debug)]
pub struct Failure {
    pub(in crate::state_machine) error: PhaseError,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Failure, T>
where
    T: LedgerStorage,
{
    const NAME: PhaseName = PhaseName::Failure;

    /// Discards the round that failed. Uncommitted privacy charges are rolled back and the
    /// clients of the round are released.
    async fn process(&mut self) -> Result<(), PhaseError> {
        error!("phase state error: {}", self.private.error);

        let state = &mut self.shared.state;
        if state.privacy.has_pending() {
            let rolled_back = state.privacy.rollback_round();
            warn!("discarded round {}: rolled back {}", state.round_id, rolled_back);
        }
        state.connections.reset_round();
        Ok(())
    }

    async fn next(mut self) -> Option<StateMachine<T>> {
        if let PhaseError::RequestChannel(_) = self.private.error {
            return Some(PhaseState::<Shutdown, _>::new(self.shared).into());
        }

        self.wait_for_store_readiness().await;
        Some(PhaseState::<Open, _>::new(self.shared).into())
    }
}

impl<T> PhaseState<Failure, T> {
    /// Creates a new error phase.
    pub fn new(shared: Shared<T>, error: PhaseError) -> Self {
        Self {
            private: Failure { error },
            shared,
        }
    }
}

impl<T> PhaseState<Failure, T>
where
    T: LedgerStorage,
{
    /// Waits until the ledger is ready.
    async fn wait_for_store_readiness(&mut self) {
        while let Err(err) = self.shared.store.is_ready().await {
            error!("ledger not ready: {}", err);
            info!("try again in 5 sec");
            sleep(Duration::from_secs(5)).await;
        }
    }
}
