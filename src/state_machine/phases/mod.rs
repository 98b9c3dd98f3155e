//! This module provides the states (aka phases) of the [`StateMachine`].
//!
//! [`StateMachine`]: crate::state_machine::StateMachine

mod aggregating;
mod broadcasting;
mod closed;
mod collecting;
mod failure;
mod handler;
mod open;
mod phase;
mod shutdown;
mod timed_out;

pub use self::{
    aggregating::Aggregating,
    broadcasting::Broadcasting,
    closed::Closed,
    collecting::Collecting,
    failure::{Failure, PhaseError},
    handler::Handler,
    open::Open,
    phase::{Phase, PhaseName, PhaseState, Shared},
    shutdown::Shutdown,
    timed_out::TimedOut,
};
