//! This module implements the services the coordinator provides to its clients.
//!
//! There are three main kinds of services:
//!
//! - the services for fetching data broadcasted by the state machine:
//!   - [`ModelService`]: for fetching the latest committed global state
//!   - [`ConvergenceService`]: for fetching the latest convergence signal
//! - the services for handling client messages:
//!   - [`MessageParser`]: enforces the size limit and parses incoming frames
//!   - [`StateMachineService`]: passes the requests down to the state machine
//!     for actual processing
//! - the [`session`] that serves a single client connection, and the
//!   [`orchestration`] hook that follows the outcome of every round.
//!
//! The [`Fetcher`] trait provides a unified interface for the first
//! category of services. The [`MessageHandler`] bundles the second one.
//!
//! [`ModelService`]: crate::services::fetchers::ModelService
//! [`ConvergenceService`]: crate::services::fetchers::ConvergenceService
//! [`Fetcher`]: crate::services::fetchers::Fetcher
//! [`MessageParser`]: crate::services::messages::MessageParser
//! [`StateMachineService`]: crate::services::messages::StateMachineService
//! [`MessageHandler`]: crate::services::messages::MessageHandler
pub mod fetchers;
pub mod messages;
pub mod orchestration;
pub mod session;

#[cfg(test)]
pub(crate) mod tests;
