use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::{
    aggregator::AdmittedContribution,
    common::{Capabilities, ClientId, ComputeClass, RoundId, SchemaVersion},
    settings::{CoordinatorSettings, RoundSettings},
    state_machine::{
        coordinator::CoordinatorState,
        events::{EventPublisher, EventSubscriber},
        phases::{PhaseName, Shared},
        requests::{RequestReceiver, RequestSender},
    },
    storage::LedgerStorage,
    validation::Contribution,
};

pub fn enable_logging() {
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .try_init();
}

pub fn round_settings() -> RoundSettings {
    RoundSettings {
        quorum: 3,
        max_contributions: 5,
        open_time: 0,
        collect_timeout: 60,
        grace_period: 0,
    }
}

pub fn coordinator_settings() -> CoordinatorSettings {
    CoordinatorSettings {
        round: round_settings(),
        ..CoordinatorSettings::default()
    }
}

pub fn coordinator_state() -> CoordinatorState {
    let mut state = CoordinatorState::new(&coordinator_settings());
    state.round_id = 1;
    state
}

pub fn init_shared<T>(
    coordinator_state: CoordinatorState,
    store: T,
) -> (Shared<T>, RequestSender, EventSubscriber)
where
    T: LedgerStorage,
{
    let (event_publisher, event_subscriber) = EventPublisher::init(
        coordinator_state.round_id,
        PhaseName::Open,
        coordinator_state.global_state.clone(),
    );

    let (request_rx, request_tx) = RequestReceiver::new();
    (
        Shared::new(coordinator_state, event_publisher, request_rx, store),
        request_tx,
        event_subscriber,
    )
}

pub fn capabilities(dataset_size: u64) -> Capabilities {
    Capabilities {
        dataset_size,
        compute_class: ComputeClass::Medium,
    }
}

/// A valid contribution that was already noised by the client.
pub fn contribution(client_id: &str, round_id: RoundId, delta: Vec<f64>) -> Contribution {
    Contribution {
        client_id: ClientId::from(client_id),
        round_id,
        version: SchemaVersion::INITIAL,
        delta: delta.into(),
        accuracy_delta: 0.02,
        noised: true,
        epsilon: None,
    }
}

pub fn admitted(client_id: &str, delta: Vec<f64>, dataset_size: u64) -> AdmittedContribution {
    AdmittedContribution {
        client_id: ClientId::from(client_id),
        delta: delta.into(),
        accuracy_delta: 0.02,
        dataset_size,
        epsilon: 0.1,
        noise: None,
    }
}

pub fn assert_approx_eq(left: &[f64], right: &[f64]) {
    assert_eq!(left.len(), right.len(), "{:?} != {:?}", left, right);
    for (l, r) in left.iter().zip(right) {
        assert!((l - r).abs() < 1e-9, "{:?} != {:?}", left, right);
    }
}
