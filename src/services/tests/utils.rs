use std::sync::Arc;

use crate::{
    common::{GlobalState, SchemaVersion},
    state_machine::{
        events::{EventPublisher, EventSubscriber},
        phases::PhaseName,
    },
};

pub fn new_event_channels() -> (EventPublisher, EventSubscriber) {
    let model = Arc::new(GlobalState::zeroed(SchemaVersion::INITIAL, 4));
    EventPublisher::init(0, PhaseName::Open, model)
}
