//! The connection manager.
//!
//! The [`ConnectionManager`] owns the live connection of every client: its outbound message
//! queue, its heartbeat timer and its [`ConnectionState`]. It is owned by the state machine and
//! therefore only ever mutated from the state machine's single request loop. Every state
//! transition is recorded as a [`ConnectionEvent`] which the state machine drains with
//! [`ConnectionManager::next_event()`].

mod heartbeat;

use std::{
    collections::{HashMap, HashSet, VecDeque},
    time::Duration,
};

use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

pub use self::heartbeat::{Expiration, HeartBeatTimer};
use crate::{
    common::{Capabilities, ClientId, RoundId, SchemaVersion, SessionId},
    services::messages::ServerMessage,
    settings::ConnectionSettings,
};

/// The length of the heartbeat reset queue of a connection.
const HEARTBEAT_RESET_CAPACITY: usize = 10;

/// The connection state of a client.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    #[display(fmt = "DISCONNECTED")]
    Disconnected,
    #[display(fmt = "CONNECTED")]
    Connected,
    #[display(fmt = "IN_ROUND")]
    InRound,
}

/// Why a client was disconnected.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum DisconnectReason {
    /// The client asked to be disconnected.
    #[display(fmt = "requested")]
    Requested,
    /// The client sent no heartbeat in time.
    #[display(fmt = "heartbeat timeout")]
    HeartbeatTimeout,
    /// The outbound queue of the client was closed by its session.
    #[display(fmt = "channel closed")]
    ChannelClosed,
}

/// A connection state transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(ClientId),
    Disconnected(ClientId, DisconnectReason),
}

/// Errors of connection management operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("client {0} is already connected")]
    DuplicateRegistration(ClientId),
    #[error("server at capacity")]
    ServerAtCapacity,
    #[error("client {0} is not admitted")]
    NotAdmitted(ClientId),
    #[error("client {0} is not connected")]
    NotConnected(ClientId),
    #[error("too many heartbeats from client {0}")]
    HeartbeatBackPressure(ClientId),
}

/// Decides which client ids may register.
pub trait AdmissionPolicy: Send + Sync {
    fn admit(&self, client_id: &ClientId) -> bool;
}

/// Admits every client.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl AdmissionPolicy for AllowAll {
    fn admit(&self, _client_id: &ClientId) -> bool {
        true
    }
}

/// Admits the listed clients only.
#[derive(Clone, Debug, Default)]
pub struct AllowList(HashSet<ClientId>);

impl AllowList {
    pub fn new<I, T>(ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ClientId>,
    {
        Self(ids.into_iter().map(Into::into).collect())
    }
}

impl AdmissionPolicy for AllowList {
    fn admit(&self, client_id: &ClientId) -> bool {
        self.0.contains(client_id)
    }
}

/// Per-client statistics that outlive connections.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientStats {
    /// The number of admitted contributions.
    pub admitted: u64,
    /// The running mean of the reported accuracy deltas of admitted contributions.
    pub mean_accuracy_delta: f64,
    /// The number of evaluation results received.
    pub evaluations: u64,
    /// The last reported evaluation accuracy.
    pub last_evaluation: Option<f64>,
}

impl ClientStats {
    pub fn record_admitted(&mut self, accuracy_delta: f64) {
        self.admitted += 1;
        self.mean_accuracy_delta += (accuracy_delta - self.mean_accuracy_delta) / self.admitted as f64;
    }

    pub fn record_evaluation(&mut self, accuracy: f64) {
        self.evaluations += 1;
        self.last_evaluation = Some(accuracy);
    }
}

/// The live half of a client record.
#[derive(Debug)]
struct Connection {
    session: SessionId,
    outbound: mpsc::Sender<ServerMessage>,
    heartbeat_reset: mpsc::Sender<Duration>,
}

impl Connection {
    fn reset_heartbeat(
        &self,
        client_id: &ClientId,
        timeout: Duration,
    ) -> Result<(), ConnectionError> {
        self.heartbeat_reset.try_send(timeout).map_err(|err| match err {
            TrySendError::Full(_) => {
                warn!("could not reset heartbeat timer: a client may be flooding us with heartbeat requests");
                ConnectionError::HeartbeatBackPressure(client_id.clone())
            }
            TrySendError::Closed(_) => {
                debug!("could not reset heartbeat timer: timer dropped already");
                ConnectionError::NotConnected(client_id.clone())
            }
        })
    }
}

#[derive(Debug)]
struct ClientRecord {
    capabilities: Capabilities,
    state: ConnectionState,
    connection: Option<Connection>,
    stats: ClientStats,
}

/// A successful registration.
///
/// The caller must spawn the heartbeat timer and forward the messages of the outbound queue to
/// the client.
pub struct Registration {
    pub session: SessionId,
    pub outbound: mpsc::Receiver<ServerMessage>,
    pub heartbeat: HeartBeatTimer,
}

/// Tracks registration, liveness and outbound queues of all clients.
pub struct ConnectionManager {
    clients: HashMap<ClientId, ClientRecord>,
    heartbeat_timeout: Duration,
    max_clients: usize,
    outbound_capacity: usize,
    admission: Box<dyn AdmissionPolicy>,
    expirations_tx: mpsc::UnboundedSender<Expiration>,
    expirations_rx: mpsc::UnboundedReceiver<Expiration>,
    events: VecDeque<ConnectionEvent>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("clients", &self.clients.len())
            .field("connected", &self.connected_count())
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("max_clients", &self.max_clients)
            .finish()
    }
}

impl ConnectionManager {
    /// Creates a connection manager. The admission policy is derived from the allow list.
    pub fn new(settings: &ConnectionSettings) -> Self {
        let admission: Box<dyn AdmissionPolicy> = match &settings.allow_list {
            Some(ids) => Box::new(AllowList::new(ids.iter().map(String::as_str))),
            None => Box::new(AllowAll),
        };
        Self::with_admission_policy(settings, admission)
    }

    pub fn with_admission_policy(
        settings: &ConnectionSettings,
        admission: Box<dyn AdmissionPolicy>,
    ) -> Self {
        let (expirations_tx, expirations_rx) = mpsc::unbounded_channel();
        Self {
            clients: HashMap::new(),
            heartbeat_timeout: settings.heartbeat_timeout(),
            max_clients: settings.max_clients,
            outbound_capacity: settings.outbound_capacity,
            admission,
            expirations_tx,
            expirations_rx,
            events: VecDeque::new(),
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Registers a client.
    ///
    /// # Errors
    /// Fails if the client is not admitted, already connected or if the server is full.
    pub fn register(
        &mut self,
        client_id: ClientId,
        capabilities: Capabilities,
    ) -> Result<Registration, ConnectionError> {
        if !self.admission.admit(&client_id) {
            return Err(ConnectionError::NotAdmitted(client_id));
        }
        if self.state(&client_id) != ConnectionState::Disconnected {
            return Err(ConnectionError::DuplicateRegistration(client_id));
        }
        if self.connected_count() >= self.max_clients {
            warn!("rejecting client {}: server at capacity", client_id);
            return Err(ConnectionError::ServerAtCapacity);
        }

        let session = SessionId::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.outbound_capacity);
        let (reset_tx, reset_rx) = mpsc::channel(HEARTBEAT_RESET_CAPACITY);
        let heartbeat = HeartBeatTimer::new(
            client_id.clone(),
            session,
            self.heartbeat_timeout,
            self.expirations_tx.clone(),
            reset_rx,
        );
        let connection = Connection {
            session,
            outbound: outbound_tx,
            heartbeat_reset: reset_tx,
        };

        let record = self
            .clients
            .entry(client_id.clone())
            .or_insert_with(|| ClientRecord {
                capabilities: capabilities.clone(),
                state: ConnectionState::Disconnected,
                connection: None,
                stats: ClientStats::default(),
            });
        record.capabilities = capabilities;
        record.state = ConnectionState::Connected;
        record.connection = Some(connection);

        info!("client {} connected (session {})", client_id, session);
        self.events.push_back(ConnectionEvent::Connected(client_id));
        Ok(Registration {
            session,
            outbound: outbound_rx,
            heartbeat,
        })
    }

    /// Resets the liveness timer of a client.
    pub fn heartbeat(&mut self, client_id: &ClientId) -> Result<(), ConnectionError> {
        let timeout = self.heartbeat_timeout;
        let result = match self.clients.get(client_id).and_then(|r| r.connection.as_ref()) {
            Some(connection) => connection.reset_heartbeat(client_id, timeout),
            None => return Err(ConnectionError::NotConnected(client_id.clone())),
        };
        if let Err(ConnectionError::NotConnected(_)) = result {
            // the timer is gone, the expiration is already queued
            self.disconnect(client_id, DisconnectReason::HeartbeatTimeout);
        }
        result
    }

    /// Disconnects a client. Returns whether the client was connected.
    ///
    /// Disconnecting a client that is not connected has no effect.
    pub fn disconnect(&mut self, client_id: &ClientId, reason: DisconnectReason) -> bool {
        match self.clients.get_mut(client_id) {
            Some(record) if record.state != ConnectionState::Disconnected => {
                record.state = ConnectionState::Disconnected;
                // dropping the connection ends the heartbeat timer and the client's outbound stream
                record.connection = None;
                info!("client {} disconnected: {}", client_id, reason);
                self.events
                    .push_back(ConnectionEvent::Disconnected(client_id.clone(), reason));
                true
            }
            _ => false,
        }
    }

    /// Handles a heartbeat expiration. Expirations of an outdated session are ignored.
    pub fn expire(&mut self, expiration: Expiration) -> bool {
        let Expiration { client_id, session } = expiration;
        self.end_session(&client_id, session, DisconnectReason::HeartbeatTimeout)
    }

    /// Disconnects a client if `session` is its current session. Returns whether the client was
    /// disconnected.
    ///
    /// A session that was replaced by a newer registration of the same client has no effect.
    pub fn end_session(
        &mut self,
        client_id: &ClientId,
        session: SessionId,
        reason: DisconnectReason,
    ) -> bool {
        let current = self
            .clients
            .get(client_id)
            .and_then(|r| r.connection.as_ref())
            .map(|c| c.session);
        if current == Some(session) {
            self.disconnect(client_id, reason)
        } else {
            debug!("ignoring the end of outdated session {}", session);
            false
        }
    }

    /// Waits for the next heartbeat expiration.
    pub async fn next_expiration(&mut self) -> Option<Expiration> {
        self.expirations_rx.recv().await
    }

    /// Pops the oldest unprocessed connection event.
    pub fn next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    /// Returns the connection state of a client. Unknown clients are disconnected.
    pub fn state(&self, client_id: &ClientId) -> ConnectionState {
        self.clients
            .get(client_id)
            .map(|r| r.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn capabilities(&self, client_id: &ClientId) -> Option<&Capabilities> {
        self.clients.get(client_id).map(|r| &r.capabilities)
    }

    pub fn stats(&self, client_id: &ClientId) -> Option<&ClientStats> {
        self.clients.get(client_id).map(|r| &r.stats)
    }

    pub fn stats_mut(&mut self, client_id: &ClientId) -> Option<&mut ClientStats> {
        self.clients.get_mut(client_id).map(|r| &mut r.stats)
    }

    pub fn connected_count(&self) -> usize {
        self.clients
            .values()
            .filter(|r| r.state != ConnectionState::Disconnected)
            .count()
    }

    /// Returns the ids of all clients that ever registered.
    pub fn known_clients(&self) -> impl Iterator<Item = &ClientId> {
        self.clients.keys()
    }

    /// Moves a connected client into the running round.
    pub fn mark_in_round(&mut self, client_id: &ClientId) {
        if let Some(record) = self.clients.get_mut(client_id) {
            if record.state == ConnectionState::Connected {
                record.state = ConnectionState::InRound;
            }
        }
    }

    /// Moves all clients of the last round back to `CONNECTED`.
    pub fn reset_round(&mut self) {
        for record in self.clients.values_mut() {
            if record.state == ConnectionState::InRound {
                record.state = ConnectionState::Connected;
            }
        }
    }

    /// Enqueues a message for a single client without waiting. Returns whether it was enqueued.
    pub fn send(&mut self, client_id: &ClientId, message: ServerMessage) -> bool {
        let result = match self.clients.get(client_id).and_then(|r| r.connection.as_ref()) {
            Some(connection) => connection.outbound.try_send(message),
            None => return false,
        };
        self.handle_send_result(client_id, result)
    }

    /// Enqueues a message for every connected client without waiting on any of them. Returns the
    /// number of clients the message was enqueued for.
    ///
    /// A client with a full queue misses the message. A client whose queue is closed is
    /// disconnected.
    pub fn broadcast(&mut self, message: &ServerMessage) -> usize {
        let results: Vec<_> = self
            .clients
            .iter()
            .filter_map(|(id, r)| r.connection.as_ref().map(|c| (id.clone(), c)))
            .map(|(id, c)| (id, c.outbound.try_send(message.clone())))
            .collect();
        let mut delivered = 0;
        for (id, result) in results {
            if self.handle_send_result(&id, result) {
                delivered += 1;
            }
        }
        delivered
    }

    fn handle_send_result(
        &mut self,
        client_id: &ClientId,
        result: Result<(), TrySendError<ServerMessage>>,
    ) -> bool {
        match result {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("dropping message for client {}: outbound queue full", client_id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.disconnect(client_id, DisconnectReason::ChannelClosed);
                false
            }
        }
    }
}

/// The parameters a client receives on registration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Heartbeat interval the client must keep, in seconds.
    pub heartbeat_timeout: u64,
    /// Collection deadline of a round, in seconds.
    pub collect_timeout: u64,
    pub round_id: RoundId,
    pub version: SchemaVersion,
    pub model_length: usize,
    /// Epsilon charged per contribution unless the client requests another amount.
    pub epsilon_per_round: f64,
    /// Remaining epsilon budget of the client.
    pub remaining_budget: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ComputeClass;

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            max_clients: 2,
            outbound_capacity: 1,
            ..ConnectionSettings::default()
        }
    }

    fn caps() -> Capabilities {
        Capabilities {
            dataset_size: 100,
            compute_class: ComputeClass::Medium,
        }
    }

    #[tokio::test]
    async fn test_register_and_duplicate() {
        let mut connections = ConnectionManager::new(&settings());
        let id = ClientId::from("a");
        assert!(connections.register(id.clone(), caps()).is_ok());
        assert_eq!(connections.state(&id), ConnectionState::Connected);
        assert_eq!(
            connections.register(id.clone(), caps()).err(),
            Some(ConnectionError::DuplicateRegistration(id.clone()))
        );
        assert_eq!(connections.next_event(), Some(ConnectionEvent::Connected(id)));
        assert_eq!(connections.next_event(), None);
    }

    #[tokio::test]
    async fn test_capacity_and_admission() {
        let mut connections = ConnectionManager::with_admission_policy(
            &settings(),
            Box::new(AllowList::new(vec!["a", "b", "c"])),
        );
        assert_eq!(
            connections.register("x".into(), caps()).err(),
            Some(ConnectionError::NotAdmitted("x".into()))
        );
        assert!(connections.register("a".into(), caps()).is_ok());
        assert!(connections.register("b".into(), caps()).is_ok());
        assert_eq!(
            connections.register("c".into(), caps()).err(),
            Some(ConnectionError::ServerAtCapacity)
        );

        connections.disconnect(&"a".into(), DisconnectReason::Requested);
        assert!(connections.register("c".into(), caps()).is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let mut connections = ConnectionManager::new(&settings());
        let id = ClientId::from("a");
        let _registration = connections.register(id.clone(), caps()).unwrap();
        connections.next_event();

        assert!(connections.disconnect(&id, DisconnectReason::Requested));
        assert!(!connections.disconnect(&id, DisconnectReason::Requested));
        assert!(!connections.disconnect(&"unknown".into(), DisconnectReason::Requested));
        assert_eq!(
            connections.next_event(),
            Some(ConnectionEvent::Disconnected(id.clone(), DisconnectReason::Requested))
        );
        assert_eq!(connections.next_event(), None);
        assert_eq!(
            connections.heartbeat(&id),
            Err(ConnectionError::NotConnected(id))
        );
    }

    #[tokio::test]
    async fn test_outdated_expiration_is_ignored() {
        let mut connections = ConnectionManager::new(&settings());
        let id = ClientId::from("a");
        let first = connections.register(id.clone(), caps()).unwrap();
        connections.disconnect(&id, DisconnectReason::Requested);
        let _second = connections.register(id.clone(), caps()).unwrap();

        assert!(!connections.expire(Expiration {
            client_id: id.clone(),
            session: first.session,
        }));
        assert_eq!(connections.state(&id), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_outdated_session_end_is_ignored() {
        let mut connections = ConnectionManager::new(&settings());
        let id = ClientId::from("a");
        let first = connections.register(id.clone(), caps()).unwrap();
        assert!(connections.expire(Expiration {
            client_id: id.clone(),
            session: first.session,
        }));
        let second = connections.register(id.clone(), caps()).unwrap();

        // the first session only notices now that it is gone
        assert!(!connections.end_session(&id, first.session, DisconnectReason::ChannelClosed));
        assert_eq!(connections.state(&id), ConnectionState::Connected);

        assert!(connections.end_session(&id, second.session, DisconnectReason::ChannelClosed));
        assert_eq!(connections.state(&id), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_disconnects() {
        tokio::time::pause();
        let mut connections = ConnectionManager::new(&settings());
        let id = ClientId::from("a");
        let registration = connections.register(id.clone(), caps()).unwrap();
        tokio::spawn(registration.heartbeat);

        let expiration = connections.next_expiration().await.unwrap();
        assert!(connections.expire(expiration));
        assert_eq!(connections.state(&id), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_broadcast_does_not_block_on_full_queue() {
        let mut connections = ConnectionManager::new(&settings());
        let mut slow = connections.register("slow".into(), caps()).unwrap();
        let mut fast = connections.register("fast".into(), caps()).unwrap();

        assert_eq!(connections.broadcast(&ServerMessage::Ack), 2);
        fast.outbound.recv().await.unwrap();
        // the queue of `slow` has capacity 1 and is still full
        assert_eq!(connections.broadcast(&ServerMessage::Ack), 1);
        assert_eq!(fast.outbound.recv().await, Some(ServerMessage::Ack));
        assert_eq!(slow.outbound.recv().await, Some(ServerMessage::Ack));
    }

    #[tokio::test]
    async fn test_closed_queue_disconnects() {
        let mut connections = ConnectionManager::new(&settings());
        let id = ClientId::from("a");
        let registration = connections.register(id.clone(), caps()).unwrap();
        drop(registration.outbound);

        assert_eq!(connections.broadcast(&ServerMessage::Ack), 0);
        assert_eq!(connections.state(&id), ConnectionState::Disconnected);
    }

    #[test]
    fn test_client_stats() {
        let mut stats = ClientStats::default();
        stats.record_admitted(0.1);
        stats.record_admitted(0.3);
        assert_eq!(stats.admitted, 2);
        assert!((stats.mean_accuracy_delta - 0.2).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_round_membership() {
        let mut connections = ConnectionManager::new(&settings());
        let id = ClientId::from("a");
        let _registration = connections.register(id.clone(), caps()).unwrap();
        connections.mark_in_round(&id);
        assert_eq!(connections.state(&id), ConnectionState::InRound);
        connections.reset_round();
        assert_eq!(connections.state(&id), ConnectionState::Connected);
    }
}
