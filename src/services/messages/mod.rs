//! This module provides the services for processing client messages.
//!
//! A raw frame passes the [`MessageParser`] first, which enforces the size limit and turns the
//! frame into a [`ClientMessage`]. The message is then converted into a request and handed to
//! the state machine by the [`StateMachineService`]. The [`MessageHandler`] bundles both.
mod error;
mod message_parser;
mod protocol;
mod state_machine;

use std::{fmt, future::Future, pin::Pin, sync::Arc};

use futures::future::poll_fn;
use rayon::ThreadPool;
use tower::{buffer::Buffer, Service, ServiceBuilder};

pub use self::{
    error::ServiceError,
    message_parser::MessageParser,
    protocol::{ClientMessage, ServerMessage},
    state_machine::StateMachineService,
};
use crate::state_machine::requests::{RequestSender, Response, StateMachineRequest};

/// The future returned by the message services.
pub type BoxedServiceFuture<Response, Error> =
    Pin<Box<dyn Future<Output = Result<Response, Error>> + 'static + Send>>;

/// A single interface for the message processing sub-services ([`MessageParser`] and
/// [`StateMachineService`]).
#[derive(Clone)]
pub struct MessageHandler {
    parser: Buffer<MessageParser, Vec<u8>>,
    state_machine: StateMachineService,
}

impl fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHandler")
            .field("state_machine", &self.state_machine)
            .finish()
    }
}

impl MessageHandler {
    pub fn new(
        max_message_size: usize,
        thread_pool: Arc<ThreadPool>,
        requests: RequestSender,
    ) -> Self {
        let parser = ServiceBuilder::new()
            .buffer(100)
            .service(MessageParser::new(max_message_size, thread_pool));
        Self {
            parser,
            state_machine: StateMachineService::new(requests),
        }
    }

    /// Parses a raw frame.
    pub async fn parse(&mut self, frame: Vec<u8>) -> Result<ClientMessage, ServiceError> {
        poll_fn(|cx| self.parser.poll_ready(cx))
            .await
            .map_err(ServiceError::from)?;
        self.parser.call(frame).await.map_err(ServiceError::from)
    }

    /// Has a request processed by the state machine.
    pub async fn request(&mut self, req: StateMachineRequest) -> Result<Response, ServiceError> {
        poll_fn(|cx| self.state_machine.poll_ready(cx)).await?;
        self.state_machine.call(req).await
    }
}
