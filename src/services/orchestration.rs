//! The hook for the training orchestration.
//!
//! The orchestration decides after every closed round whether training goes on. It is handed
//! the committed global state together with the convergence signal of the round.

use std::sync::Arc;

use tracing::{debug, info, Span};

use crate::{
    aggregator::ConvergenceSignal,
    common::{ClientId, GlobalState, ModelDelta, RoundId, SchemaVersion},
    state_machine::{
        events::EventSubscriber,
        requests::{Admission, RequestError, RequestSender, Response, StateMachineRequest},
    },
    validation::Contribution,
};

/// What the orchestration wants after a round.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrainingDecision {
    Continue,
    Stop,
}

/// Consumes the outcome of every closed round.
pub trait Orchestrator: Send {
    fn on_broadcast(
        &mut self,
        global_state: Arc<GlobalState>,
        signal: ConvergenceSignal,
    ) -> TrainingDecision;
}

/// An [`Orchestrator`] that logs every round and never stops the training.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingOrchestrator;

impl Orchestrator for LoggingOrchestrator {
    fn on_broadcast(
        &mut self,
        global_state: Arc<GlobalState>,
        signal: ConvergenceSignal,
    ) -> TrainingDecision {
        info!(
            "round {} closed: convergence score {} ({} rounds below threshold)",
            global_state.round_id, signal.score, signal.streak
        );
        TrainingDecision::Continue
    }
}

/// An [`Orchestrator`] that stops the training once the global state converged.
#[derive(Clone, Copy, Debug, Default)]
pub struct StopOnConvergence;

impl Orchestrator for StopOnConvergence {
    fn on_broadcast(
        &mut self,
        global_state: Arc<GlobalState>,
        signal: ConvergenceSignal,
    ) -> TrainingDecision {
        let decision = LoggingOrchestrator.on_broadcast(global_state, signal);
        if signal.converged {
            info!("global state converged, stopping the training");
            TrainingDecision::Stop
        } else {
            decision
        }
    }
}

/// Feeds the outcome of every closed round to the orchestrator.
///
/// Returns once the orchestrator asks to stop or the state machine is gone.
pub async fn drive<O>(mut orchestrator: O, events: &EventSubscriber)
where
    O: Orchestrator,
{
    let mut convergence = events.convergence_listener();
    let model = events.model_listener();
    while let Some(event) = convergence.changed().await {
        let signal = match event.event {
            Some(signal) => signal,
            None => continue,
        };
        let global_state = model.get_latest().event;
        if global_state.round_id != event.round_id {
            // the signal of a round is published after its state
            debug!(
                "ignoring convergence signal of round {}: global state is from round {}",
                event.round_id, global_state.round_id
            );
            continue;
        }
        if orchestrator.on_broadcast(global_state, signal) == TrainingDecision::Stop {
            return;
        }
    }
    debug!("event channel closed");
}

/// Lets the training orchestration submit contributions it computed on behalf of a client.
#[derive(Clone, Debug)]
pub struct ContributionSubmitter {
    requests: RequestSender,
}

impl ContributionSubmitter {
    pub fn new(requests: RequestSender) -> Self {
        Self { requests }
    }

    /// Submits a contribution for a registered client.
    ///
    /// # Errors
    /// Fails with the rejection of the contribution.
    pub async fn submit_contribution(
        &self,
        client_id: ClientId,
        round_id: RoundId,
        version: SchemaVersion,
        delta: ModelDelta,
        accuracy_delta: f64,
    ) -> Result<Admission, RequestError> {
        let contribution = Contribution {
            client_id,
            round_id,
            version,
            delta,
            accuracy_delta,
            noised: false,
            epsilon: None,
        };
        match self
            .requests
            .request(StateMachineRequest::Submit(contribution), Span::current())
            .await?
        {
            Response::Admitted(admission) => Ok(admission),
            _ => Err(RequestError::InternalError(
                "unexpected response to a contribution",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        services::tests::utils::new_event_channels,
        state_machine::tests::builder::StateMachineBuilder,
        storage::MemoryLedger,
    };

    struct Recorder(mpsc::UnboundedSender<(RoundId, ConvergenceSignal)>);

    impl Orchestrator for Recorder {
        fn on_broadcast(
            &mut self,
            global_state: Arc<GlobalState>,
            signal: ConvergenceSignal,
        ) -> TrainingDecision {
            let _ = self.0.send((global_state.round_id, signal));
            if signal.converged {
                TrainingDecision::Stop
            } else {
                TrainingDecision::Continue
            }
        }
    }

    fn signal(converged: bool) -> ConvergenceSignal {
        ConvergenceSignal {
            score: 1e-4,
            streak: if converged { 3 } else { 1 },
            converged,
        }
    }

    fn state(round_id: RoundId) -> Arc<GlobalState> {
        Arc::new(GlobalState {
            version: SchemaVersion::INITIAL,
            round_id,
            weights: vec![0.; 4],
        })
    }

    #[tokio::test]
    async fn test_drive_until_converged() {
        let (mut publisher, subscriber) = new_event_channels();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move { drive(Recorder(tx), &subscriber).await });

        publisher.set_round_id(1);
        publisher.broadcast_model(state(1));
        publisher.broadcast_convergence(Some(signal(false)));
        assert_eq!(rx.recv().await, Some((1, signal(false))));

        publisher.set_round_id(2);
        publisher.broadcast_model(state(2));
        publisher.broadcast_convergence(Some(signal(true)));
        assert_eq!(rx.recv().await, Some((2, signal(true))));

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_drive_ends_with_publisher() {
        let (publisher, subscriber) = new_event_channels();
        let (tx, _rx) = mpsc::unbounded_channel();
        drop(publisher);
        drive(Recorder(tx), &subscriber).await;
    }

    #[tokio::test]
    async fn test_submit_contribution() {
        tokio::time::pause();
        let mut builder = StateMachineBuilder::new(MemoryLedger::new());
        let _registration = builder.register("a", 10);
        let (state_machine, request_tx, _events) = builder.build();
        let state_machine = state_machine.next().await.unwrap();
        assert!(state_machine.is_collecting());

        let submitter = ContributionSubmitter::new(request_tx);
        let submission = submitter.submit_contribution(
            ClientId::from("a"),
            1,
            SchemaVersion::INITIAL,
            vec![0.1, 0., 0., 0.].into(),
            0.01,
        );
        let (_, admission) = tokio::join!(state_machine.next(), submission);
        let admission = admission.unwrap();
        assert_eq!(admission.round_id, 1);
        assert!((admission.epsilon - 0.1).abs() < 1e-12);

        let err = submitter
            .submit_contribution(
                ClientId::from("a"),
                1,
                SchemaVersion::INITIAL,
                vec![0.1, 0., 0., 0.].into(),
                0.01,
            )
            .await
            .unwrap_err();
        // the state machine was dropped with the join above
        assert!(matches!(err, RequestError::Unavailable(_)));
        assert_eq!(err.code(), "COORDINATOR_UNAVAILABLE");
        assert!(err.is_retryable());
    }
}
