//! The message kinds exchanged over the persistent client channel.
//!
//! Messages are JSON objects tagged by their `kind`:
//!
//! ```json
//! {"kind": "SUBMIT_CONTRIBUTION", "round_id": 3, "version": 1, "delta": [0.1, 0.2], "accuracy_delta": 0.01}
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    aggregator::ConvergenceSignal,
    common::{Capabilities, ClientId, GlobalState, ModelDelta, RoundId, SchemaVersion, SessionId},
    connections::{DisconnectReason, SessionConfig},
    services::messages::ServiceError,
    state_machine::requests::{
        Admission,
        DisconnectRequest,
        ErrorCategory,
        EvaluationRequest,
        RegisterRequest,
        StateMachineRequest,
    },
    validation::Contribution,
};

/// A message sent by a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Must be the first message of every connection.
    Register {
        client_id: ClientId,
        capabilities: Capabilities,
    },
    Heartbeat,
    SubmitContribution {
        round_id: RoundId,
        version: SchemaVersion,
        delta: ModelDelta,
        accuracy_delta: f64,
        /// Whether the client already applied its own noise.
        #[serde(default)]
        noised: bool,
        /// The epsilon to charge instead of the per-round default.
        #[serde(default)]
        epsilon: Option<f64>,
    },
    EvaluationResult {
        round_id: RoundId,
        accuracy: f64,
    },
    CurrentState,
    Disconnect,
}

impl ClientMessage {
    /// Turns a message received on the given session of a registered client into a request for
    /// the state machine.
    ///
    /// A `Register` message always carries the id of the session it was sent on, so a second
    /// registration on the same connection is rejected as a duplicate.
    pub fn into_request(self, client_id: &ClientId, session: SessionId) -> StateMachineRequest {
        match self {
            Self::Register { capabilities, .. } => RegisterRequest {
                client_id: client_id.clone(),
                capabilities,
            }
            .into(),
            Self::Heartbeat => StateMachineRequest::Heartbeat(client_id.clone()),
            Self::SubmitContribution {
                round_id,
                version,
                delta,
                accuracy_delta,
                noised,
                epsilon,
            } => Contribution {
                client_id: client_id.clone(),
                round_id,
                version,
                delta,
                accuracy_delta,
                noised,
                epsilon,
            }
            .into(),
            Self::EvaluationResult { round_id, accuracy } => EvaluationRequest {
                client_id: client_id.clone(),
                round_id,
                accuracy,
            }
            .into(),
            Self::CurrentState => StateMachineRequest::CurrentState,
            Self::Disconnect => DisconnectRequest {
                client_id: client_id.clone(),
                session,
                reason: DisconnectReason::Requested,
            }
            .into(),
        }
    }
}

/// A message sent by the coordinator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    Registered {
        session: SessionId,
        config: SessionConfig,
    },
    Ack,
    Admitted(Admission),
    /// A request was refused. `code` is stable and machine-readable.
    Rejected {
        code: String,
        category: ErrorCategory,
        retryable: bool,
        reason: String,
    },
    RoundOpened {
        round_id: RoundId,
        version: SchemaVersion,
        /// Collection deadline in seconds.
        collect_timeout: u64,
    },
    RoundTimedOut {
        round_id: RoundId,
    },
    BroadcastUpdate {
        round_id: RoundId,
        global_state: Arc<GlobalState>,
        convergence: ConvergenceSignal,
    },
    /// The schema changed. Clients must drop their local state and continue from this one.
    Resync {
        version: SchemaVersion,
        global_state: Arc<GlobalState>,
    },
    CurrentState {
        global_state: Arc<GlobalState>,
    },
}

impl ServerMessage {
    pub fn rejected(err: &ServiceError) -> Self {
        Self::Rejected {
            code: err.code().to_string(),
            category: err.category(),
            retryable: err.is_retryable(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        common::ComputeClass,
        privacy::PrivacyError,
        state_machine::requests::RequestError,
    };

    #[test]
    fn test_parse_submission() {
        let value = json!({
            "kind": "SUBMIT_CONTRIBUTION",
            "round_id": 3,
            "version": 1,
            "delta": [0.1, -0.2],
            "accuracy_delta": 0.01,
        });
        let msg: ClientMessage = serde_json::from_value(value).unwrap();
        let req = msg.into_request(&ClientId::from("a"), SessionId::new());
        match req {
            StateMachineRequest::Submit(contribution) => {
                assert_eq!(contribution.client_id, ClientId::from("a"));
                assert_eq!(contribution.round_id, 3);
                assert_eq!(contribution.version, SchemaVersion::INITIAL);
                assert_eq!(contribution.delta.as_slice(), &[0.1, -0.2]);
                assert!(!contribution.noised);
                assert_eq!(contribution.epsilon, None);
            }
            req => panic!("unexpected request: {:?}", req),
        }
    }

    #[test]
    fn test_disconnect_names_its_session() {
        let msg: ClientMessage = serde_json::from_value(json!({"kind": "DISCONNECT"})).unwrap();
        let session = SessionId::new();
        match msg.into_request(&ClientId::from("a"), session) {
            StateMachineRequest::Disconnect(req) => {
                assert_eq!(req.client_id, ClientId::from("a"));
                assert_eq!(req.session, session);
                assert_eq!(req.reason, DisconnectReason::Requested);
            }
            req => panic!("unexpected request: {:?}", req),
        }
    }

    #[test]
    fn test_parse_register() {
        let value = json!({
            "kind": "REGISTER",
            "client_id": "client-1",
            "capabilities": {"dataset_size": 120},
        });
        let msg: ClientMessage = serde_json::from_value(value).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Register {
                client_id: ClientId::from("client-1"),
                capabilities: Capabilities {
                    dataset_size: 120,
                    compute_class: ComputeClass::Medium,
                },
            }
        );

        let msg: ClientMessage = serde_json::from_value(json!({"kind": "HEARTBEAT"})).unwrap();
        assert_eq!(msg, ClientMessage::Heartbeat);
    }

    #[test]
    fn test_unknown_kind() {
        let value = json!({"kind": "SUM", "round_id": 1});
        assert!(serde_json::from_value::<ClientMessage>(value).is_err());
    }

    #[test]
    fn test_rejection_carries_reason_code() {
        let err = RequestError::from(PrivacyError::BudgetExceeded {
            spent: 0.95,
            requested: 0.1,
            budget: 1.0,
        });
        let value = serde_json::to_value(ServerMessage::rejected(&err.into())).unwrap();
        assert_eq!(value["kind"], "REJECTED");
        assert_eq!(value["code"], "BUDGET_EXCEEDED");
        assert_eq!(value["category"], "POLICY");
        assert_eq!(value["retryable"], false);

        let err = ServiceError::MessageTooLarge { size: 10, limit: 5 };
        let value = serde_json::to_value(ServerMessage::rejected(&err)).unwrap();
        assert_eq!(value["code"], "MESSAGE_TOO_LARGE");
        assert_eq!(value["category"], "PROTOCOL");
    }

    #[test]
    fn test_serialize_broadcast() {
        let msg = ServerMessage::BroadcastUpdate {
            round_id: 2,
            global_state: Arc::new(GlobalState::zeroed(SchemaVersion::INITIAL, 2)),
            convergence: ConvergenceSignal {
                score: 0.5,
                streak: 0,
                converged: false,
            },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["kind"], "BROADCAST_UPDATE");
        assert_eq!(value["global_state"]["weights"], json!([0.0, 0.0]));
        assert_eq!(value["convergence"]["converged"], false);

        let msg: ServerMessage = serde_json::from_value(value).unwrap();
        assert!(matches!(msg, ServerMessage::BroadcastUpdate { round_id: 2, .. }));
    }
}
