//! This module provides the [`StateMachine`]'s `Events`, `EventSubscriber` and `EventPublisher`
//! types.
//!
//! [`StateMachine`]: crate::state_machine::StateMachine

use std::sync::Arc;

use tokio::sync::watch;

use crate::{aggregator::ConvergenceSignal, common::GlobalState, state_machine::phases::PhaseName};

/// An event emitted by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<E> {
    /// Metadata that associates this event to the round in which it is
    /// emitted.
    pub round_id: u64,
    /// The event itself
    pub event: E,
}

/// A convenience type to emit any coordinator event.
#[derive(Debug)]
pub struct EventPublisher {
    /// Round ID that is attached to all the events.
    round_id: u64,
    phase_tx: EventBroadcaster<PhaseName>,
    model_tx: EventBroadcaster<Arc<GlobalState>>,
    convergence_tx: EventBroadcaster<Option<ConvergenceSignal>>,
}

/// The `EventSubscriber` hands out `EventListener`s for any
/// coordinator event.
#[derive(Debug, Clone)]
pub struct EventSubscriber {
    phase_rx: EventListener<PhaseName>,
    model_rx: EventListener<Arc<GlobalState>>,
    convergence_rx: EventListener<Option<ConvergenceSignal>>,
}

impl EventPublisher {
    /// Initialize a new event publisher with the given initial events.
    pub fn init(
        round_id: u64,
        phase: PhaseName,
        model: Arc<GlobalState>,
    ) -> (Self, EventSubscriber) {
        let (phase_tx, phase_rx) = watch::channel::<Event<PhaseName>>(Event {
            round_id,
            event: phase,
        });

        let (model_tx, model_rx) = watch::channel::<Event<Arc<GlobalState>>>(Event {
            round_id,
            event: model,
        });

        let (convergence_tx, convergence_rx) =
            watch::channel::<Event<Option<ConvergenceSignal>>>(Event {
                round_id,
                event: None,
            });

        let publisher = EventPublisher {
            round_id,
            phase_tx: phase_tx.into(),
            model_tx: model_tx.into(),
            convergence_tx: convergence_tx.into(),
        };

        let subscriber = EventSubscriber {
            phase_rx: phase_rx.into(),
            model_rx: model_rx.into(),
            convergence_rx: convergence_rx.into(),
        };

        (publisher, subscriber)
    }

    /// Set the round ID that is attached to the events the publisher broadcasts.
    pub fn set_round_id(&mut self, id: u64) {
        self.round_id = id;
    }

    fn event<T>(&self, event: T) -> Event<T> {
        Event {
            round_id: self.round_id,
            event,
        }
    }

    /// Emit a phase event
    pub fn broadcast_phase(&mut self, phase: PhaseName) {
        self.phase_tx.broadcast(self.event(phase));
    }

    /// Emit a model event
    pub fn broadcast_model(&mut self, model: Arc<GlobalState>) {
        self.model_tx.broadcast(self.event(model));
    }

    /// Emit a convergence event
    pub fn broadcast_convergence(&mut self, signal: Option<ConvergenceSignal>) {
        self.convergence_tx.broadcast(self.event(signal));
    }
}

impl EventSubscriber {
    /// Get a listener for new phase events
    pub fn phase_listener(&self) -> EventListener<PhaseName> {
        self.phase_rx.clone()
    }

    /// Get a listener for new global state events
    pub fn model_listener(&self) -> EventListener<Arc<GlobalState>> {
        self.model_rx.clone()
    }

    /// Get a listener for convergence signal events
    pub fn convergence_listener(&self) -> EventListener<Option<ConvergenceSignal>> {
        self.convergence_rx.clone()
    }
}

/// A listener for coordinator events. It can be used to either
/// retrieve the latest `Event<E>` emitted by the coordinator (with
/// `EventListener::get_latest`) or to wait for the next event (with
/// `EventListener::changed`).
#[derive(Debug, Clone)]
pub struct EventListener<E>(watch::Receiver<Event<E>>);

impl<E> From<watch::Receiver<Event<E>>> for EventListener<E> {
    fn from(receiver: watch::Receiver<Event<E>>) -> Self {
        EventListener(receiver)
    }
}

impl<E> EventListener<E>
where
    E: Clone,
{
    pub fn get_latest(&self) -> Event<E> {
        self.0.borrow().clone()
    }

    /// Waits for an event that was not seen by this listener yet and returns it.
    ///
    /// Returns `None` once the publisher is gone.
    pub async fn changed(&mut self) -> Option<Event<E>> {
        self.0.changed().await.ok()?;
        Some(self.get_latest())
    }
}

/// A channel to send `Event<E>` to all the `EventListener<E>`.
#[derive(Debug)]
pub struct EventBroadcaster<E>(watch::Sender<Event<E>>);

impl<E> EventBroadcaster<E> {
    /// Send `event` to all the `EventListener<E>`
    fn broadcast(&self, event: Event<E>) {
        // We don't care whether there's a listener or not
        let _ = self.0.send(event);
    }
}

impl<E> From<watch::Sender<Event<E>>> for EventBroadcaster<E> {
    fn from(sender: watch::Sender<Event<E>>) -> Self {
        Self(sender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SchemaVersion;

    #[tokio::test]
    async fn test_listener_sees_latest_event() {
        let model = Arc::new(GlobalState::zeroed(SchemaVersion::INITIAL, 2));
        let (mut publisher, subscriber) = EventPublisher::init(0, PhaseName::Open, model);
        let mut phases = subscriber.phase_listener();
        assert_eq!(phases.get_latest().event, PhaseName::Open);

        publisher.set_round_id(1);
        publisher.broadcast_phase(PhaseName::Collecting);
        assert_eq!(
            phases.changed().await,
            Some(Event {
                round_id: 1,
                event: PhaseName::Collecting
            })
        );

        // old events keep their round id
        assert_eq!(subscriber.convergence_listener().get_latest().round_id, 0);

        drop(publisher);
        assert_eq!(phases.changed().await, None);
    }
}
