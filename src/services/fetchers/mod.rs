//! This module provides the services for serving data.
//!
//! There are multiple such services and the [`Fetcher`] trait
//! provides a single unifying interface for all of these.

mod convergence;
mod model;

use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::future::poll_fn;
use tower::{layer::Layer, Service, ServiceBuilder};

pub use self::{
    convergence::{ConvergenceRequest, ConvergenceResponse, ConvergenceService},
    model::{ModelRequest, ModelResponse, ModelService},
};
use crate::state_machine::events::EventSubscriber;

/// A single interface for retrieving data from the coordinator.
#[async_trait]
pub trait Fetcher {
    /// Fetch the latest committed global state. Clients that missed a broadcast catch up
    /// with it.
    async fn model(&mut self) -> Result<ModelResponse, FetchError>;

    /// Fetch the convergence signal of the last closed round.
    async fn convergence(&mut self) -> Result<ConvergenceResponse, FetchError>;
}

/// An error returned by the [`Fetcher`]'s method.
pub type FetchError = anyhow::Error;

fn into_fetch_error<E: Into<Box<dyn ::std::error::Error + 'static + Sync + Send>>>(
    e: E,
) -> FetchError {
    anyhow::anyhow!("Fetcher failed: {:?}", e.into())
}

#[async_trait]
impl<Model, Convergence> Fetcher for Fetchers<Model, Convergence>
where
    Self: Send + Sync + 'static,

    Model: Service<ModelRequest, Response = ModelResponse> + Send + 'static,
    <Model as Service<ModelRequest>>::Future: Send + Sync + 'static,
    <Model as Service<ModelRequest>>::Error:
        Into<Box<dyn ::std::error::Error + 'static + Sync + Send>>,

    Convergence: Service<ConvergenceRequest, Response = ConvergenceResponse> + Send + 'static,
    <Convergence as Service<ConvergenceRequest>>::Future: Send + Sync + 'static,
    <Convergence as Service<ConvergenceRequest>>::Error:
        Into<Box<dyn ::std::error::Error + 'static + Sync + Send>>,
{
    async fn model(&mut self) -> Result<ModelResponse, FetchError> {
        poll_fn(|cx| <Model as Service<ModelRequest>>::poll_ready(&mut self.model, cx))
            .await
            .map_err(into_fetch_error)?;
        Ok(
            <Model as Service<ModelRequest>>::call(&mut self.model, ModelRequest)
                .await
                .map_err(into_fetch_error)?,
        )
    }

    async fn convergence(&mut self) -> Result<ConvergenceResponse, FetchError> {
        poll_fn(|cx| {
            <Convergence as Service<ConvergenceRequest>>::poll_ready(&mut self.convergence, cx)
        })
        .await
        .map_err(into_fetch_error)?;
        Ok(<Convergence as Service<ConvergenceRequest>>::call(
            &mut self.convergence,
            ConvergenceRequest,
        )
        .await
        .map_err(into_fetch_error)?)
    }
}

pub(in crate::services) struct FetcherService<S>(S);

impl<S, R> Service<R> for FetcherService<S>
where
    S: Service<R>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.0.poll_ready(cx)
    }

    fn call(&mut self, req: R) -> Self::Future {
        self.0.call(req)
    }
}

pub(in crate::services) struct FetcherLayer;

impl<S> Layer<S> for FetcherLayer {
    type Service = FetcherService<S>;

    fn layer(&self, service: S) -> Self::Service {
        FetcherService(service)
    }
}

#[derive(Debug, Clone)]
pub struct Fetchers<Model, Convergence> {
    model: Model,
    convergence: Convergence,
}

impl<Model, Convergence> Fetchers<Model, Convergence> {
    pub fn new(model: Model, convergence: Convergence) -> Self {
        Self { model, convergence }
    }
}

/// Construct a [`Fetcher`] service
pub fn fetcher(event_subscriber: &EventSubscriber) -> impl Fetcher + Sync + Send + Clone + 'static {
    let model = ServiceBuilder::new()
        .buffer(100)
        .concurrency_limit(100)
        .layer(FetcherLayer)
        .service(ModelService::new(event_subscriber));

    let convergence = ServiceBuilder::new()
        .buffer(100)
        .concurrency_limit(100)
        .layer(FetcherLayer)
        .service(ConvergenceService::new(event_subscriber));

    Fetchers::new(model, convergence)
}
