//! # fedcoord: the coordination core of a federated learning system
//!
//! A population of clients trains a shared model. Every client keeps its data local and submits
//! model deltas. The coordinator runs the training as a sequence of rounds:
//!
//! - the [`state_machine`] opens a round, collects contributions until a quorum is reached or
//!   the collection window times out, aggregates the admitted deltas and broadcasts the new
//!   global state;
//! - the [`connections`] manager keeps track of every client channel and of its liveness;
//! - each contribution passes the [`validation`] checks and is charged against the per-client
//!   differential privacy budget of the [`privacy`] accountant;
//! - the [`aggregator`] weights the deltas by dataset size and by the [`reputation`] of their
//!   senders, and decides whether the training converged;
//! - the outcome of every round is appended to the round ledger of the [`storage`] layer.
//!
//! The clients talk to the coordinator over the [`rest`] API, which hosts the persistent
//! client channel served by the [`services`].

pub mod aggregator;
pub mod common;
pub mod connections;
pub mod privacy;
pub mod reputation;
pub mod rest;
pub mod services;
pub mod settings;
pub mod state_machine;
pub mod storage;
pub mod validation;
