use std::{
    sync::Arc,
    task::{Context, Poll},
};

use futures::future;
use rayon::ThreadPool;
use tokio::sync::oneshot;
use tower::{layer::Layer, limit::ConcurrencyLimit, Service, ServiceBuilder};
use tracing::{debug, trace, warn};

use crate::services::messages::{BoxedServiceFuture, ClientMessage, ServiceError};

/// A service that discards messages above a size limit before anything else looks at them.
#[derive(Debug, Clone)]
struct SizeLimit<S> {
    /// Maximum accepted message size in bytes.
    limit: usize,
    /// Next service to be called
    next_svc: S,
}

impl<S> Service<Vec<u8>> for SizeLimit<S>
where
    S: Service<Vec<u8>, Response = ClientMessage, Error = ServiceError>,
    S::Future: Send + 'static,
{
    type Response = ClientMessage;
    type Error = ServiceError;
    type Future = BoxedServiceFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.next_svc.poll_ready(cx)
    }

    fn call(&mut self, req: Vec<u8>) -> Self::Future {
        if req.len() > self.limit {
            warn!(
                "discarding message of {} bytes: limit is {} bytes",
                req.len(),
                self.limit
            );
            return Box::pin(future::ready(Err(ServiceError::MessageTooLarge {
                size: req.len(),
                limit: self.limit,
            })));
        }
        let fut = self.next_svc.call(req);
        Box::pin(async move {
            trace!("calling inner service");
            fut.await
        })
    }
}

struct SizeLimitLayer {
    limit: usize,
}

impl<S> Layer<S> for SizeLimitLayer {
    type Service = SizeLimit<S>;

    fn layer(&self, service: S) -> SizeLimit<S> {
        SizeLimit {
            limit: self.limit,
            next_svc: service,
        }
    }
}

/// A service that deserializes client messages.
///
/// Contributions carry the full model delta, so parsing is CPU-bound for large models. The
/// work is offloaded to a `rayon` thread-pool to keep the tokio workers free.
#[derive(Debug, Clone)]
struct Parser {
    thread_pool: Arc<ThreadPool>,
}

impl Service<Vec<u8>> for Parser {
    type Response = ClientMessage;
    type Error = ServiceError;
    type Future = BoxedServiceFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Vec<u8>) -> Self::Future {
        let (tx, rx) = oneshot::channel::<Result<ClientMessage, ServiceError>>();

        trace!("spawning parsing task on thread-pool");
        self.thread_pool.spawn(move || {
            let res = serde_json::from_slice::<ClientMessage>(&req).map_err(|e| {
                debug!("failed to parse message: {}", e);
                ServiceError::from(e)
            });
            let _ = tx.send(res);
        });

        Box::pin(async move {
            rx.await.map_err(|_| {
                ServiceError::InternalError("failed to receive response from thread-pool".to_string())
            })?
        })
    }
}

type InnerService = SizeLimit<ConcurrencyLimit<Parser>>;

/// A service that turns the raw frames of a client connection into [`ClientMessage`]s.
#[derive(Debug, Clone)]
pub struct MessageParser(InnerService);

impl Service<Vec<u8>> for MessageParser {
    type Response = ClientMessage;
    type Error = ServiceError;
    type Future = BoxedServiceFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.0.poll_ready(cx)
    }

    fn call(&mut self, req: Vec<u8>) -> Self::Future {
        self.0.call(req)
    }
}

impl MessageParser {
    pub fn new(max_message_size: usize, thread_pool: Arc<ThreadPool>) -> Self {
        // one parsing task per thread at most
        let limit = thread_pool.current_num_threads();
        let inner = ServiceBuilder::new()
            .layer(SizeLimitLayer {
                limit: max_message_size,
            })
            .concurrency_limit(limit)
            .service(Parser { thread_pool });
        Self(inner)
    }
}
