use std::task::{Context, Poll};

use futures::future::{self, Ready};
use tower::Service;
use tracing::error_span;
use tracing_futures::{Instrument, Instrumented};

use crate::{
    aggregator::ConvergenceSignal,
    state_machine::events::{EventListener, EventSubscriber},
};

/// [`ConvergenceService`]'s request type
#[derive(Default, Clone, Eq, PartialEq, Debug)]
pub struct ConvergenceRequest;

/// [`ConvergenceService`]'s response type.
///
/// The response is `None` as long as no round was closed since the coordinator started.
pub type ConvergenceResponse = Option<ConvergenceSignal>;

/// A service that serves the convergence signal of the last closed round
pub struct ConvergenceService(EventListener<Option<ConvergenceSignal>>);

impl ConvergenceService {
    pub fn new(events: &EventSubscriber) -> Self {
        Self(events.convergence_listener())
    }
}

impl Service<ConvergenceRequest> for ConvergenceService {
    type Response = ConvergenceResponse;
    type Error = std::convert::Infallible;
    type Future = Instrumented<Ready<Result<Self::Response, Self::Error>>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: ConvergenceRequest) -> Self::Future {
        future::ready(Ok(self.0.get_latest().event))
            .instrument(error_span!("convergence_fetch_request"))
    }
}
