//! Coordinator state and round state types.

use std::{
    collections::{BTreeSet, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};

use crate::{
    aggregator::{
        AdmittedContribution,
        AggregationOutcome,
        Aggregator,
        ConvergenceSignal,
        ConvergenceTracker,
    },
    common::{ClientId, GlobalState, RoundId, SchemaVersion},
    connections::{AdmissionPolicy, ConnectionManager, ConnectionState, SessionConfig},
    privacy::{GaussianMechanism, PrivacyAccountant},
    reputation::ReputationEngine,
    settings::{CoordinatorSettings, PrivacySettings, RoundSettings},
    state_machine::requests::ClientInfo,
    storage::Participation,
    validation::ContributionValidator,
};

/// The coordinator state.
///
/// Everything in here is only ever mutated by the state machine, one request at a time.
#[derive(Debug)]
pub struct CoordinatorState {
    /// Internal ID used to identify a round
    pub round_id: RoundId,
    /// The round parameters.
    pub round: RoundSettings,
    /// The privacy parameters.
    pub privacy_settings: PrivacySettings,
    /// The latest committed global state.
    pub global_state: Arc<GlobalState>,
    /// The schema length that takes effect at the beginning of the next round.
    pub pending_schema: Option<usize>,
    /// The latest committed convergence signal.
    pub convergence_signal: Option<ConvergenceSignal>,
    pub connections: ConnectionManager,
    pub privacy: PrivacyAccountant,
    pub mechanism: GaussianMechanism,
    pub validator: ContributionValidator,
    pub reputation: ReputationEngine,
    pub aggregator: Aggregator,
    pub convergence: ConvergenceTracker,
}

impl CoordinatorState {
    pub fn new(settings: &CoordinatorSettings) -> Self {
        Self::with_connections(settings, ConnectionManager::new(&settings.connection))
    }

    pub fn with_admission_policy(
        settings: &CoordinatorSettings,
        admission: Box<dyn AdmissionPolicy>,
    ) -> Self {
        Self::with_connections(
            settings,
            ConnectionManager::with_admission_policy(&settings.connection, admission),
        )
    }

    fn with_connections(settings: &CoordinatorSettings, connections: ConnectionManager) -> Self {
        Self {
            round_id: 0,
            round: settings.round,
            privacy_settings: settings.privacy,
            global_state: Arc::new(GlobalState::zeroed(
                SchemaVersion::INITIAL,
                settings.model.length,
            )),
            pending_schema: None,
            convergence_signal: None,
            connections,
            privacy: PrivacyAccountant::new(settings.privacy.budget),
            mechanism: GaussianMechanism::new(
                settings.validation.clip_norm,
                settings.privacy.delta,
            ),
            validator: ContributionValidator::new(settings.validation),
            reputation: ReputationEngine::new(settings.reputation),
            aggregator: Aggregator::new(),
            convergence: ConvergenceTracker::new(settings.aggregation),
        }
    }

    /// The parameters a client gets on registration.
    pub fn session_config(&self, client_id: &ClientId) -> SessionConfig {
        SessionConfig {
            heartbeat_timeout: self.connections.heartbeat_timeout().as_secs(),
            collect_timeout: self.round.collect_timeout,
            round_id: self.round_id,
            version: self.global_state.version,
            model_length: self.global_state.len(),
            epsilon_per_round: self.privacy_settings.epsilon_per_round,
            remaining_budget: self.privacy.remaining(client_id),
        }
    }

    /// What the coordinator knows about a client, if the client ever registered.
    pub fn client_info(&self, client_id: &ClientId) -> Option<ClientInfo> {
        let capabilities = self.connections.capabilities(client_id)?.clone();
        Some(ClientInfo {
            client_id: client_id.clone(),
            state: self.connections.state(client_id),
            capabilities,
            stats: self.connections.stats(client_id).cloned().unwrap_or_default(),
            reputation: self.reputation.weight_for(client_id),
            privacy_spent: self.privacy.spent(client_id),
            remaining_budget: self.privacy.remaining(client_id),
        })
    }

    /// All clients the coordinator keeps any record of, ordered by id.
    pub fn known_clients(&self) -> BTreeSet<ClientId> {
        self.connections
            .known_clients()
            .cloned()
            .chain(self.reputation.records().into_iter().map(|r| r.client_id))
            .collect()
    }
}

/// The contributions of the running round.
#[derive(Debug)]
pub struct RoundState {
    pub started_at: DateTime<Utc>,
    /// Admitted contributions in order of admission.
    pub admitted: Vec<AdmittedContribution>,
    /// Clients with an admitted contribution.
    pub submitted: HashSet<ClientId>,
    /// Clients with a contribution rejected for a policy or metric violation.
    pub penalized: HashSet<ClientId>,
    pub rejected: u64,
    pub discarded: u64,
}

impl Default for RoundState {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundState {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            admitted: Vec::new(),
            submitted: HashSet::new(),
            penalized: HashSet::new(),
            rejected: 0,
            discarded: 0,
        }
    }

    /// The number of admitted contributions whose client is still in the round.
    pub fn quorum_count(&self, connections: &ConnectionManager) -> u64 {
        self.admitted
            .iter()
            .filter(|c| connections.state(&c.client_id) == ConnectionState::InRound)
            .count() as u64
    }

    /// The ids of the contributing clients in order of admission.
    pub fn participant_ids(&self) -> Vec<ClientId> {
        self.admitted.iter().map(|c| c.client_id.clone()).collect()
    }

    /// The ledger record of every admitted contribution, given the aggregation weights.
    pub fn participations(&self, outcome: &AggregationOutcome) -> Vec<Participation> {
        self.admitted
            .iter()
            .zip(&outcome.weights)
            .map(|(c, (_, weight))| Participation {
                client_id: c.client_id.clone(),
                weight: *weight,
                dataset_size: c.dataset_size,
                accuracy_delta: c.accuracy_delta,
                epsilon: c.epsilon,
            })
            .collect()
    }

    /// The total epsilon charged in this round.
    pub fn privacy_spent(&self) -> f64 {
        self.admitted.iter().map(|c| c.epsilon).sum()
    }
}

/// Everything an aggregated round changes. It only takes effect once the round is closed.
#[derive(Debug, Clone)]
pub struct RoundCommit {
    pub outcome: AggregationOutcome,
    pub reputation: ReputationEngine,
    pub convergence: ConvergenceTracker,
    pub signal: ConvergenceSignal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Capabilities, ComputeClass};

    #[tokio::test]
    async fn test_quorum_counts_clients_in_round() {
        let settings = CoordinatorSettings::default();
        let mut state = CoordinatorState::new(&settings);
        let caps = Capabilities {
            dataset_size: 10,
            compute_class: ComputeClass::Low,
        };
        let _a = state.connections.register("a".into(), caps.clone()).unwrap();
        let _b = state.connections.register("b".into(), caps).unwrap();

        let mut round = RoundState::new();
        for id in &["a", "b"] {
            let client_id = ClientId::from(*id);
            state.connections.mark_in_round(&client_id);
            round.submitted.insert(client_id.clone());
            round.admitted.push(AdmittedContribution {
                client_id,
                delta: vec![0.; 4].into(),
                accuracy_delta: 0.,
                dataset_size: 10,
                epsilon: 0.1,
                noise: None,
            });
        }
        assert_eq!(round.quorum_count(&state.connections), 2);
        assert!((round.privacy_spent() - 0.2).abs() < 1e-12);

        state
            .connections
            .disconnect(&"a".into(), crate::connections::DisconnectReason::Requested);
        assert_eq!(round.quorum_count(&state.connections), 1);
        assert_eq!(round.participant_ids().len(), 2);
    }

    #[test]
    fn test_session_config() {
        let settings = CoordinatorSettings::default();
        let state = CoordinatorState::new(&settings);
        let config = state.session_config(&"a".into());
        assert_eq!(config.model_length, 4);
        assert_eq!(config.version, SchemaVersion::INITIAL);
        assert_eq!(config.remaining_budget, 1.0);
        assert!(state.client_info(&"a".into()).is_none());
    }
}
