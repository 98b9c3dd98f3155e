use std::task::{Context, Poll};

use tower::Service;
use tracing::Span;

use crate::{
    services::messages::{BoxedServiceFuture, ServiceError},
    state_machine::requests::{RequestSender, Response, StateMachineRequest},
};

/// A service that hands the requests to the [`StateMachine`] that runs in the background.
///
/// The request is sent under the span of the caller, so the state machine logs it in the
/// context of the client session.
///
/// [`StateMachine`]: crate::state_machine::StateMachine
#[derive(Debug, Clone)]
pub struct StateMachineService {
    handle: RequestSender,
}

impl StateMachineService {
    /// Create a new service with the given handle for forwarding
    /// requests to the state machine. The handle should be obtained
    /// via [`init()`].
    ///
    /// [`init()`]: crate::state_machine::initializer::StateMachineInitializer::init
    pub fn new(handle: RequestSender) -> Self {
        Self { handle }
    }
}

impl Service<StateMachineRequest> for StateMachineService {
    type Response = Response;
    type Error = ServiceError;
    type Future = BoxedServiceFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: StateMachineRequest) -> Self::Future {
        let handle = self.handle.clone();
        let span = Span::current();
        Box::pin(async move {
            handle
                .request(req, span)
                .await
                .map_err(ServiceError::StateMachine)
        })
    }
}
