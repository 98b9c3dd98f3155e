use async_trait::async_trait;
use tokio::time::Duration;
use tracing::{debug, info, Span};
use tracing_futures::Instrument;

use crate::{
    state_machine::{
        phases::{phase::Incoming, Phase, PhaseError, PhaseState},
        requests::{
            DisconnectRequest,
            EvaluationRequest,
            RegisterRequest,
            Registered,
            RequestError,
            Response,
            ResponseSender,
            StateMachineRequest,
        },
    },
    storage::LedgerStorage,
    validation::{Contribution, ValidationError},
};

/// A trait that must be implemented by a state to handle the requests that depend on the phase.
#[async_trait]
pub trait Handler: Send {
    /// Handles a contribution.
    ///
    /// Contributions are rejected by default.
    ///
    /// # Errors
    /// Fails on validation, privacy and ledger errors.
    async fn handle_submit(&mut self, _contribution: Contribution) -> Result<Response, RequestError> {
        Err(ValidationError::RoundNotAccepting.into())
    }
}

impl<S, T> PhaseState<S, T>
where
    T: LedgerStorage,
    Self: Phase<T> + Handler,
{
    /// Processes requests and heartbeat expirations for as long as the given duration.
    pub(in crate::state_machine) async fn process_during(
        &mut self,
        dur: Duration,
    ) -> Result<(), PhaseError> {
        let deadline = tokio::time::sleep(dur);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;

                _ = &mut deadline => {
                    debug!("duration elapsed");
                    break Ok(());
                }
                next = self.next_incoming() => {
                    self.process_incoming(next?).await;
                }
            }
        }
    }

    /// Processes a single heartbeat expiration or request.
    pub(in crate::state_machine) async fn process_incoming(&mut self, incoming: Incoming) {
        match incoming {
            Incoming::Expiration(expiration) => {
                self.shared.state.connections.expire(expiration);
            }
            Incoming::Request(req, span, resp_tx) => {
                self.process_single(req, span, resp_tx).await;
            }
        }
        self.drain_connection_events();
    }

    /// Processes a single request under the span of its sender.
    async fn process_single(&mut self, req: StateMachineRequest, span: Span, resp_tx: ResponseSender) {
        let response = self.handle_request(req).instrument(span.clone()).await;
        if let Err(err) = &response {
            let _span_guard = span.enter();
            debug!("request failed: {}", err);
        }

        // This may error out if the receiver has already been dropped but it doesn't matter for us.
        let _ = resp_tx.send(response);
    }

    /// Handles a request.
    ///
    /// Contributions are handed over to the phase. All other requests are handled the same way
    /// in every phase.
    async fn handle_request(&mut self, req: StateMachineRequest) -> Result<Response, RequestError> {
        let state = &mut self.shared.state;
        match req {
            StateMachineRequest::Register(RegisterRequest {
                client_id,
                capabilities,
            }) => {
                let registration = state.connections.register(client_id.clone(), capabilities)?;
                let config = state.session_config(&client_id);
                Ok(Response::Registered(Box::new(Registered {
                    config,
                    registration,
                })))
            }
            StateMachineRequest::Heartbeat(client_id) => {
                state.connections.heartbeat(&client_id)?;
                Ok(Response::Ack)
            }
            StateMachineRequest::Disconnect(DisconnectRequest {
                client_id,
                session,
                reason,
            }) => {
                state.connections.end_session(&client_id, session, reason);
                Ok(Response::Ack)
            }
            StateMachineRequest::Evaluation(EvaluationRequest {
                client_id,
                round_id,
                accuracy,
            }) => {
                if !accuracy.is_finite() {
                    return Err(ValidationError::ImplausibleMetric(format!(
                        "evaluation accuracy {}",
                        accuracy
                    ))
                    .into());
                }
                let stats = state
                    .connections
                    .stats_mut(&client_id)
                    .ok_or_else(|| RequestError::UnknownClient(client_id.clone()))?;
                stats.record_evaluation(accuracy);
                info!(
                    "client {} evaluated the state of round {}: accuracy {}",
                    client_id, round_id, accuracy
                );
                Ok(Response::Ack)
            }
            StateMachineRequest::CurrentState => Ok(Response::State(state.global_state.clone())),
            StateMachineRequest::ClientInfo(client_id) => state
                .client_info(&client_id)
                .map(Response::Client)
                .ok_or(RequestError::UnknownClient(client_id)),
            StateMachineRequest::UpdateSchema(length) => {
                if length == 0 {
                    return Err(RequestError::InvalidSchema(length));
                }
                info!("schema change to length {} scheduled for the next round", length);
                state.pending_schema = Some(length);
                Ok(Response::Ack)
            }
            StateMachineRequest::Submit(contribution) => self.handle_submit(contribution).await,
        }
    }
}
