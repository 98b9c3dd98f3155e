use std::sync::Arc;

use tokio_test::assert_ready;
use tower_test::mock::Spawn;

use crate::{
    aggregator::ConvergenceSignal,
    common::{GlobalState, SchemaVersion},
    services::{
        fetchers::{
            fetcher,
            ConvergenceRequest,
            ConvergenceService,
            Fetcher,
            ModelRequest,
            ModelService,
        },
        tests::utils::new_event_channels,
    },
};

fn global_state(round_id: u64) -> Arc<GlobalState> {
    Arc::new(GlobalState {
        version: SchemaVersion::INITIAL,
        round_id,
        weights: vec![0.5, 0.25, 0., 1.],
    })
}

#[tokio::test]
async fn test_model_svc() {
    let (mut publisher, subscriber) = new_event_channels();

    let mut task = Spawn::new(ModelService::new(&subscriber));
    assert_ready!(task.poll_ready()).unwrap();

    let resp = task.call(ModelRequest).await;
    assert_eq!(resp, Ok(Arc::new(GlobalState::zeroed(SchemaVersion::INITIAL, 4))));

    let model = global_state(1);
    publisher.broadcast_model(model.clone());
    assert_ready!(task.poll_ready()).unwrap();
    let resp = task.call(ModelRequest).await;
    assert_eq!(resp, Ok(model));
}

#[tokio::test]
async fn test_convergence_svc() {
    let (mut publisher, subscriber) = new_event_channels();

    let mut task = Spawn::new(ConvergenceService::new(&subscriber));
    assert_ready!(task.poll_ready()).unwrap();

    let resp = task.call(ConvergenceRequest).await;
    assert_eq!(resp, Ok(None));

    let signal = ConvergenceSignal {
        score: 1e-4,
        streak: 1,
        converged: false,
    };
    publisher.broadcast_convergence(Some(signal));
    assert_ready!(task.poll_ready()).unwrap();
    let resp = task.call(ConvergenceRequest).await;
    assert_eq!(resp, Ok(Some(signal)));
}

#[tokio::test]
async fn test_fetcher() {
    let (mut publisher, subscriber) = new_event_channels();
    let mut fetcher = fetcher(&subscriber);

    assert_eq!(fetcher.convergence().await.unwrap(), None);

    let model = global_state(3);
    publisher.set_round_id(3);
    publisher.broadcast_model(model.clone());
    assert_eq!(fetcher.model().await.unwrap(), model);

    // clones share the underlying services
    let mut other = fetcher.clone();
    assert_eq!(other.model().await.unwrap(), model);
}
