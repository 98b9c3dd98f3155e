use std::{
    sync::Arc,
    task::{Context, Poll},
};

use futures::future::{self, Ready};
use tower::Service;
use tracing::error_span;
use tracing_futures::{Instrument, Instrumented};

use crate::{
    common::GlobalState,
    state_machine::events::{EventListener, EventSubscriber},
};

/// [`ModelService`]'s request type
#[derive(Default, Clone, Eq, PartialEq, Debug)]
pub struct ModelRequest;

/// [`ModelService`]'s response type.
///
/// This is the latest committed global state. It is never newer than the last closed round.
pub type ModelResponse = Arc<GlobalState>;

/// A service that serves the latest committed global state
pub struct ModelService(EventListener<Arc<GlobalState>>);

impl ModelService {
    pub fn new(events: &EventSubscriber) -> Self {
        Self(events.model_listener())
    }
}

impl Service<ModelRequest> for ModelService {
    type Response = ModelResponse;
    type Error = std::convert::Infallible;
    type Future = Instrumented<Ready<Result<Self::Response, Self::Error>>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: ModelRequest) -> Self::Future {
        future::ready(Ok(self.0.get_latest().event)).instrument(error_span!("model_fetch_request"))
    }
}
