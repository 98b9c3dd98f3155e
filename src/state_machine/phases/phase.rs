use std::fmt;

use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, error_span, info, warn, Span};
use tracing_futures::Instrument;

use crate::{
    connections::{ConnectionEvent, Expiration},
    state_machine::{
        coordinator::CoordinatorState,
        events::EventPublisher,
        phases::{Failure, PhaseError},
        requests::{RequestReceiver, ResponseSender, StateMachineRequest},
        StateMachine,
    },
    storage::LedgerStorage,
};

/// The name of the current phase.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseName {
    #[display(fmt = "OPEN")]
    Open,
    #[display(fmt = "COLLECTING")]
    Collecting,
    #[display(fmt = "AGGREGATING")]
    Aggregating,
    #[display(fmt = "BROADCASTING")]
    Broadcasting,
    #[display(fmt = "CLOSED")]
    Closed,
    #[display(fmt = "TIMED_OUT")]
    TimedOut,
    #[display(fmt = "FAILURE")]
    Failure,
    #[display(fmt = "SHUTDOWN")]
    Shutdown,
}

/// A trait that must be implemented by a state in order to move to a next state.
///
/// See the [module level documentation] for more details.
///
/// [module level documentation]: crate::state_machine
#[async_trait]
pub trait Phase<T>
where
    T: LedgerStorage,
{
    /// The name of the current phase.
    const NAME: PhaseName;

    /// Performs the tasks of this phase.
    async fn process(&mut self) -> Result<(), PhaseError>;

    /// Broadcasts data of this phase (nothing by default).
    fn broadcast(&mut self) {}

    /// Moves from this phase to the next phase.
    async fn next(self) -> Option<StateMachine<T>>;
}

/// A struct that contains the coordinator state and the I/O interfaces that are shared and
/// accessible by all `PhaseState`s.
pub struct Shared<T> {
    /// The coordinator state.
    pub(in crate::state_machine) state: CoordinatorState,
    /// The request receiver half.
    pub(in crate::state_machine) request_rx: RequestReceiver,
    /// The event publisher.
    pub(in crate::state_machine) events: EventPublisher,
    /// The round ledger.
    pub(in crate::state_machine) store: T,
}

impl<T> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("state", &self.state)
            .field("request_rx", &self.request_rx)
            .field("events", &self.events)
            .finish()
    }
}

impl<T> Shared<T> {
    /// Creates a new shared state.
    pub fn new(
        coordinator_state: CoordinatorState,
        publisher: EventPublisher,
        request_rx: RequestReceiver,
        store: T,
    ) -> Self {
        Self {
            state: coordinator_state,
            request_rx,
            events: publisher,
            store,
        }
    }

    /// Sets the round ID to the given value.
    pub fn set_round_id(&mut self, id: u64) {
        self.state.round_id = id;
        self.events.set_round_id(id);
    }

    /// Returns the current round ID.
    pub fn round_id(&self) -> u64 {
        self.state.round_id
    }
}

/// The state corresponding to a phase of a round.
///
/// This contains the state-dependent `private` state and the state-independent `shared` state
/// which is shared across state transitions.
pub struct PhaseState<S, T> {
    /// The private state.
    pub(in crate::state_machine) private: S,
    /// The shared coordinator state and I/O interfaces.
    pub(in crate::state_machine) shared: Shared<T>,
}

/// Something the state machine has to react to while it waits for requests.
pub(in crate::state_machine) enum Incoming {
    /// The heartbeat timer of a client ran out.
    Expiration(Expiration),
    /// A client or admin request.
    Request(StateMachineRequest, Span, ResponseSender),
}

impl<S, T> PhaseState<S, T>
where
    S: Send,
    T: LedgerStorage,
    Self: Phase<T>,
{
    /// Runs the current phase to completion.
    ///
    /// 1. Performs the phase tasks.
    /// 2. Broadcasts the phase data.
    /// 3. Transitions to the next phase.
    pub async fn run_phase(mut self) -> Option<StateMachine<T>> {
        let phase = Self::NAME;
        let span = error_span!("run_phase", phase = %phase, round_id = self.shared.round_id());

        async move {
            info!("starting phase");
            self.shared.events.broadcast_phase(phase);

            if let Err(err) = self.process().await {
                warn!("failed to perform the phase tasks");
                return Some(self.into_failure_state(err));
            }
            info!("phase ran successfully");

            self.broadcast();

            info!("transitioning to the next phase");
            self.next().await
        }
        .instrument(span)
        .await
    }
}

impl<S, T> PhaseState<S, T> {
    /// Waits for the next heartbeat expiration or [`StateMachineRequest`], whichever comes
    /// first. Expirations take precedence.
    ///
    /// # Errors
    /// Returns [`PhaseError::RequestChannel`] when all sender halves have been dropped.
    pub(in crate::state_machine) async fn next_incoming(&mut self) -> Result<Incoming, PhaseError> {
        debug!("waiting for the next incoming request");
        let Shared {
            state, request_rx, ..
        } = &mut self.shared;

        tokio::select! {
            biased;

            Some(expiration) = state.connections.next_expiration() => {
                Ok(Incoming::Expiration(expiration))
            }
            next = request_rx.recv() => {
                let (req, span, resp_tx) = next.ok_or_else(|| {
                    error!("request receiver broken: senders have been dropped");
                    PhaseError::RequestChannel("all message senders have been dropped!")
                })?;
                Ok(Incoming::Request(req, span, resp_tx))
            }
        }
    }

    /// Logs the connection state transitions caused by the last request or expiration.
    pub(in crate::state_machine) fn drain_connection_events(&mut self) {
        while let Some(event) = self.shared.state.connections.next_event() {
            match event {
                ConnectionEvent::Connected(client_id) => {
                    debug!("client {} joined", client_id);
                }
                ConnectionEvent::Disconnected(client_id, reason) => {
                    debug!("client {} left: {}", client_id, reason);
                }
            }
        }
    }

    pub(in crate::state_machine) fn into_failure_state(self, err: PhaseError) -> StateMachine<T> {
        PhaseState::<Failure, _>::new(self.shared, err).into()
    }
}
