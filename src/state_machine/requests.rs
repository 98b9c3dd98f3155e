//! This module provides the `StateMachineRequest`, `Response`, `RequestSender` and
//! `RequestReceiver` types.

use std::{fmt, sync::Arc};

use derive_more::{Display, From};
use displaydoc::Display as DisplayDoc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::Span;

use crate::{
    common::{Capabilities, ClientId, GlobalState, RoundId, SessionId},
    connections::{
        ClientStats,
        ConnectionError,
        ConnectionState,
        DisconnectReason,
        Registration,
        SessionConfig,
    },
    privacy::PrivacyError,
    storage::StorageError,
    validation::{Contribution, ValidationError},
};

/// The class of a [`RequestError`].
///
/// Protocol errors and policy errors mean the client has to change what it sends. Liveness,
/// quorum and internal errors are conditions a client can simply retry after.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    #[display(fmt = "PROTOCOL")]
    Protocol,
    #[display(fmt = "POLICY")]
    Policy,
    #[display(fmt = "LIVENESS")]
    Liveness,
    #[display(fmt = "QUORUM")]
    Quorum,
    #[display(fmt = "INTERNAL")]
    Internal,
}

/// Errors which can occur while the state machine handles a request.
#[derive(Debug, DisplayDoc, Error)]
pub enum RequestError {
    /// Connection request failed: {0}.
    Connection(#[from] ConnectionError),
    /// The contribution was rejected: {0}.
    Validation(#[from] ValidationError),
    /// The privacy charge was denied: {0}.
    Privacy(#[from] PrivacyError),
    /// The message was discarded: the round accepts no more contributions.
    MessageDiscarded,
    /// Invalid schema length {0}.
    InvalidSchema(usize),
    /// Unknown client {0}.
    UnknownClient(ClientId),
    /// The request could not be processed due to an internal error: {0}.
    InternalError(&'static str),
    /// The coordinator is unavailable: {0}.
    Unavailable(&'static str),
    /// Ledger request failed: {0}.
    Ledger(StorageError),
}

impl RequestError {
    /// A stable, machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection(err) => match err {
                ConnectionError::DuplicateRegistration(_) => "DUPLICATE_REGISTRATION",
                ConnectionError::ServerAtCapacity => "SERVER_AT_CAPACITY",
                ConnectionError::NotAdmitted(_) => "NOT_ADMITTED",
                ConnectionError::NotConnected(_) => "NOT_CONNECTED",
                ConnectionError::HeartbeatBackPressure(_) => "HEARTBEAT_BACK_PRESSURE",
            },
            Self::Validation(err) => match err {
                ValidationError::RoundNotAccepting => "ROUND_NOT_ACCEPTING",
                ValidationError::WrongRound { .. } => "WRONG_ROUND",
                ValidationError::DuplicateSubmission => "DUPLICATE_SUBMISSION",
                ValidationError::StaleVersion { .. } => "STALE_VERSION",
                ValidationError::MalformedPayload(_) => "MALFORMED_PAYLOAD",
                ValidationError::ImplausibleMetric(_) => "IMPLAUSIBLE_METRIC",
                ValidationError::NormExceeded { .. } => "NORM_EXCEEDED",
            },
            Self::Privacy(PrivacyError::BudgetExceeded { .. }) => "BUDGET_EXCEEDED",
            Self::Privacy(PrivacyError::InvalidNoise(_)) => "INVALID_NOISE",
            Self::MessageDiscarded => "MESSAGE_DISCARDED",
            Self::InvalidSchema(_) => "INVALID_SCHEMA",
            Self::UnknownClient(_) => "UNKNOWN_CLIENT",
            Self::InternalError(_) => "INTERNAL_ERROR",
            Self::Unavailable(_) => "COORDINATOR_UNAVAILABLE",
            Self::Ledger(_) => "LEDGER_UNAVAILABLE",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection(ConnectionError::NotAdmitted(_)) => ErrorCategory::Policy,
            Self::Connection(ConnectionError::ServerAtCapacity)
            | Self::Connection(ConnectionError::NotConnected(_)) => ErrorCategory::Liveness,
            Self::Connection(_) => ErrorCategory::Protocol,
            Self::Validation(ValidationError::NormExceeded { .. }) => ErrorCategory::Policy,
            Self::Validation(_) => ErrorCategory::Protocol,
            Self::Privacy(PrivacyError::BudgetExceeded { .. }) => ErrorCategory::Policy,
            Self::Privacy(PrivacyError::InvalidNoise(_)) => ErrorCategory::Internal,
            Self::MessageDiscarded => ErrorCategory::Quorum,
            Self::Unavailable(_) => ErrorCategory::Liveness,
            Self::InvalidSchema(_) | Self::UnknownClient(_) => ErrorCategory::Protocol,
            Self::InternalError(_) | Self::Ledger(_) => ErrorCategory::Internal,
        }
    }

    /// Whether sending the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(ValidationError::RoundNotAccepting)
            | Self::Validation(ValidationError::WrongRound { .. })
            | Self::Validation(ValidationError::StaleVersion { .. }) => true,
            _ => matches!(
                self.category(),
                ErrorCategory::Liveness | ErrorCategory::Quorum | ErrorCategory::Internal
            ),
        }
    }
}

/// A registration request.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterRequest {
    pub client_id: ClientId,
    pub capabilities: Capabilities,
}

/// An evaluation result reported by a client. It is recorded but never used for aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationRequest {
    pub client_id: ClientId,
    pub round_id: RoundId,
    pub accuracy: f64,
}

/// The end of a client session.
///
/// The session id keeps a session that was already replaced by a newer registration of the same
/// client from disconnecting the newer one.
#[derive(Debug, Clone, PartialEq)]
pub struct DisconnectRequest {
    pub client_id: ClientId,
    pub session: SessionId,
    pub reason: DisconnectReason,
}

/// A [`StateMachine`] request.
///
/// [`StateMachine`]: crate::state_machine
#[derive(Debug)]
pub enum StateMachineRequest {
    Register(RegisterRequest),
    Heartbeat(ClientId),
    Submit(Contribution),
    Disconnect(DisconnectRequest),
    Evaluation(EvaluationRequest),
    /// Pull-based catch-up on the latest committed global state.
    CurrentState,
    ClientInfo(ClientId),
    /// Schedules a schema change of the given length for the next round.
    UpdateSchema(usize),
}

impl From<RegisterRequest> for StateMachineRequest {
    fn from(req: RegisterRequest) -> Self {
        Self::Register(req)
    }
}

impl From<Contribution> for StateMachineRequest {
    fn from(contribution: Contribution) -> Self {
        Self::Submit(contribution)
    }
}

impl From<DisconnectRequest> for StateMachineRequest {
    fn from(req: DisconnectRequest) -> Self {
        Self::Disconnect(req)
    }
}

impl From<EvaluationRequest> for StateMachineRequest {
    fn from(req: EvaluationRequest) -> Self {
        Self::Evaluation(req)
    }
}

/// A confirmed registration.
pub struct Registered {
    pub config: SessionConfig,
    pub registration: Registration,
}

impl fmt::Debug for Registered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registered")
            .field("config", &self.config)
            .field("session", &self.registration.session)
            .finish()
    }
}

/// The outcome of an admitted contribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Admission {
    pub round_id: RoundId,
    pub epsilon: f64,
    pub remaining_budget: f64,
}

/// What the coordinator knows about a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub state: ConnectionState,
    pub capabilities: Capabilities,
    pub stats: ClientStats,
    pub reputation: f64,
    pub privacy_spent: f64,
    pub remaining_budget: f64,
}

/// The response to a [`StateMachineRequest`].
#[derive(Debug, From)]
pub enum Response {
    Registered(Box<Registered>),
    Ack,
    Admitted(Admission),
    State(Arc<GlobalState>),
    Client(ClientInfo),
}

/// A handle to send requests to the [`StateMachine`].
///
/// [`StateMachine`]: crate::state_machine
#[derive(Clone, From, Debug)]
pub struct RequestSender(mpsc::UnboundedSender<(StateMachineRequest, Span, ResponseSender)>);

impl RequestSender {
    /// Sends a request to the [`StateMachine`] and waits for the response.
    ///
    /// # Errors
    /// Fails with [`RequestError::Unavailable`] if the [`StateMachine`] has already shut down and
    /// the `Request` channel has been closed as a result, or if the request itself failed.
    ///
    /// [`StateMachine`]: crate::state_machine
    pub async fn request(
        &self,
        req: StateMachineRequest,
        span: Span,
    ) -> Result<Response, RequestError> {
        let (resp_tx, resp_rx) = oneshot::channel::<Result<Response, RequestError>>();
        self.0.send((req, span, resp_tx)).map_err(|_| {
            RequestError::Unavailable(
                "failed to send request to the state machine: state machine is shutting down",
            )
        })?;
        resp_rx.await.map_err(|_| {
            RequestError::Unavailable("failed to receive response from the state machine")
        })?
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// A channel for sending the state machine to send the response to a
/// [`StateMachineRequest`].
pub(in crate::state_machine) type ResponseSender = oneshot::Sender<Result<Response, RequestError>>;

/// The receiver half of the `Request` channel that is used by the [`StateMachine`] to receive
/// requests.
///
/// [`StateMachine`]: crate::state_machine
#[derive(From, Debug)]
pub struct RequestReceiver(mpsc::UnboundedReceiver<(StateMachineRequest, Span, ResponseSender)>);

impl RequestReceiver {
    /// Creates a new `Request` channel and returns the [`RequestReceiver`] as well as the
    /// [`RequestSender`] half.
    pub fn new() -> (Self, RequestSender) {
        let (tx, rx) = mpsc::unbounded_channel::<(StateMachineRequest, Span, ResponseSender)>();
        let receiver = RequestReceiver::from(rx);
        let handle = RequestSender::from(tx);
        (receiver, handle)
    }

    /// Closes the `Request` channel.
    /// See [the `tokio` documentation][close] for more information.
    ///
    /// [close]: https://docs.rs/tokio/1.1.0/tokio/sync/mpsc/struct.UnboundedReceiver.html#method.close
    pub fn close(&mut self) {
        self.0.close()
    }

    /// Receives the next request.
    pub async fn recv(&mut self) -> Option<(StateMachineRequest, Span, ResponseSender)> {
        self.0.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SchemaVersion;

    #[test]
    fn test_reason_codes() {
        let err = RequestError::from(PrivacyError::BudgetExceeded {
            spent: 0.95,
            requested: 0.1,
            budget: 1.0,
        });
        assert_eq!(err.code(), "BUDGET_EXCEEDED");
        assert_eq!(err.category(), ErrorCategory::Policy);
        assert!(!err.is_retryable());

        let err = RequestError::from(ValidationError::MalformedPayload("empty delta".into()));
        assert_eq!(err.code(), "MALFORMED_PAYLOAD");
        assert_eq!(err.category(), ErrorCategory::Protocol);
        assert!(!err.is_retryable());

        let err = RequestError::from(ValidationError::StaleVersion {
            expected: SchemaVersion::INITIAL.next(),
            got: SchemaVersion::INITIAL,
        });
        assert_eq!(err.category(), ErrorCategory::Protocol);
        assert!(err.is_retryable());

        let err = RequestError::from(ConnectionError::ServerAtCapacity);
        assert_eq!(err.category(), ErrorCategory::Liveness);
        assert!(err.is_retryable());

        assert_eq!(RequestError::MessageDiscarded.category(), ErrorCategory::Quorum);
    }

    #[tokio::test]
    async fn test_request_fails_after_receiver_is_gone() {
        let (receiver, sender) = RequestReceiver::new();
        drop(receiver);
        assert!(sender.is_closed());
        let err = sender
            .request(StateMachineRequest::CurrentState, Span::none())
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Unavailable(_)));
        assert_eq!(err.code(), "COORDINATOR_UNAVAILABLE");
        assert_eq!(err.category(), ErrorCategory::Liveness);
        assert!(err.is_retryable());
    }
}
