//! The state machine that runs the rounds of the coordinator.
//!
//! # Overview
//!
//! Every round passes through the phases `Open`, `Collecting`, `Aggregating`, `Broadcasting`
//! and `Closed`. A round that misses its quorum leaves `Collecting` for `TimedOut` instead. Both
//! `Closed` and `TimedOut` are followed by the `Open` phase of the next round.
//!
//! The [`StateMachine`] owns all mutable coordinator state: connections, privacy spend,
//! reputations and the global state. Requests reach it through a single channel and are handled
//! one at a time, so admitting a contribution (validate, charge, noise, record) is atomic with
//! respect to every other request.
//!
//! # Phase states
//!
//! **Open**
//!
//! Publishes [`PhaseName::Open`], increments the `round id` by `1`, applies a pending schema
//! change (telling every client to resynchronize) and announces the round.
//!
//! **Collecting**
//!
//! Publishes [`PhaseName::Collecting`] and admits contributions until the round is full, until
//! the last call after reaching the quorum is over or until the collection deadline. The quorum
//! counts admitted contributions whose client is still in the round.
//!
//! **Aggregating**
//!
//! Publishes [`PhaseName::Aggregating`], aggregates the admitted contributions weighted by
//! reputation and dataset size, and derives the reputation updates and the convergence signal.
//!
//! **Broadcasting**
//!
//! Publishes [`PhaseName::Broadcasting`] and pushes the new global state to every connected
//! client without waiting on any of them.
//!
//! **Closed**
//!
//! Publishes [`PhaseName::Closed`], writes the snapshot and the round record to the ledger and
//! only then commits the privacy spend, the reputations and the global state. Publishes the new
//! global state and the convergence signal.
//!
//! **TimedOut**
//!
//! Publishes [`PhaseName::TimedOut`], rolls back the privacy charges of the round and records
//! the timeout. The global state is left untouched.
//!
//! **Failure**
//!
//! Publishes [`PhaseName::Failure`] and handles [`PhaseError`]s. The running round is discarded
//! and a new one is opened once the ledger is ready again. If a [`PhaseError::RequestChannel`]
//! occurs, the [`StateMachine`] shuts down.
//!
//! **Shutdown**
//!
//! Publishes [`PhaseName::Shutdown`] and shuts down the [`StateMachine`]. During the shutdown,
//! the [`StateMachine`] closes the request channel and consumes all remaining requests.
//!
//! # Requests
//!
//! By initiating a new [`StateMachine`] via [`StateMachineInitializer::init()`], a new request
//! channel is created. The sender half ([`RequestSender`]) is returned to the caller, the
//! receiver half is used by the [`StateMachine`].
//!
//! # Events
//!
//! The [`StateMachine`] publishes the current phase, the committed global state and the
//! convergence signal. Everyone interested can subscribe to them via the [`EventSubscriber`].
//!
//! [`PhaseName::Open`]: crate::state_machine::phases::PhaseName::Open
//! [`PhaseName::Collecting`]: crate::state_machine::phases::PhaseName::Collecting
//! [`PhaseName::Aggregating`]: crate::state_machine::phases::PhaseName::Aggregating
//! [`PhaseName::Broadcasting`]: crate::state_machine::phases::PhaseName::Broadcasting
//! [`PhaseName::Closed`]: crate::state_machine::phases::PhaseName::Closed
//! [`PhaseName::TimedOut`]: crate::state_machine::phases::PhaseName::TimedOut
//! [`PhaseName::Failure`]: crate::state_machine::phases::PhaseName::Failure
//! [`PhaseName::Shutdown`]: crate::state_machine::phases::PhaseName::Shutdown
//! [`PhaseError`]: crate::state_machine::phases::PhaseError
//! [`PhaseError::RequestChannel`]: crate::state_machine::phases::PhaseError::RequestChannel
//! [`RequestSender`]: crate::state_machine::requests::RequestSender
//! [`EventSubscriber`]: crate::state_machine::events::EventSubscriber

pub mod coordinator;
pub mod events;
pub mod initializer;
pub mod phases;
pub mod requests;

#[cfg(test)]
pub(crate) mod tests;

use derive_more::From;

pub use self::initializer::{StateMachineInitializationError, StateMachineInitializer};
use self::phases::{
    Aggregating,
    Broadcasting,
    Closed,
    Collecting,
    Failure,
    Open,
    Phase,
    PhaseState,
    Shutdown,
    TimedOut,
};
use crate::storage::LedgerStorage;

/// The state machine with all its states.
#[derive(From)]
pub enum StateMachine<T> {
    Open(PhaseState<Open, T>),
    Collecting(PhaseState<Collecting, T>),
    Aggregating(PhaseState<Aggregating, T>),
    Broadcasting(PhaseState<Broadcasting, T>),
    Closed(PhaseState<Closed, T>),
    TimedOut(PhaseState<TimedOut, T>),
    Failure(PhaseState<Failure, T>),
    Shutdown(PhaseState<Shutdown, T>),
}

impl<T> StateMachine<T>
where
    T: LedgerStorage,
    PhaseState<Open, T>: Phase<T>,
    PhaseState<Collecting, T>: Phase<T>,
    PhaseState<Aggregating, T>: Phase<T>,
    PhaseState<Broadcasting, T>: Phase<T>,
    PhaseState<Closed, T>: Phase<T>,
    PhaseState<TimedOut, T>: Phase<T>,
    PhaseState<Failure, T>: Phase<T>,
    PhaseState<Shutdown, T>: Phase<T>,
{
    /// Moves the [`StateMachine`] to the next state and consumes the current one.
    /// Returns the next state or `None` if the [`StateMachine`] reached the state [`Shutdown`].
    pub async fn next(self) -> Option<Self> {
        match self {
            StateMachine::Open(state) => state.run_phase().await,
            StateMachine::Collecting(state) => state.run_phase().await,
            StateMachine::Aggregating(state) => state.run_phase().await,
            StateMachine::Broadcasting(state) => state.run_phase().await,
            StateMachine::Closed(state) => state.run_phase().await,
            StateMachine::TimedOut(state) => state.run_phase().await,
            StateMachine::Failure(state) => state.run_phase().await,
            StateMachine::Shutdown(state) => state.run_phase().await,
        }
    }

    /// Runs the state machine until it shuts down.
    /// The [`StateMachine`] shuts down once all [`RequestSender`]s have been dropped.
    ///
    /// [`RequestSender`]: crate::state_machine::requests::RequestSender
    pub async fn run(mut self) -> Option<()> {
        loop {
            self = self.next().await?;
        }
    }
}
