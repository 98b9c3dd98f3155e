//! Trust scores of clients.
//!
//! Every client has a [`ReputationRecord`] holding an exponentially weighted score in
//! `[floor, ceiling]`. After a round was aggregated, the score of every participant moves towards
//! its agreement with the aggregate outcome, while the score of every absent client decays with
//! the length of its absence streak.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    common::{cosine_similarity, ClientId, RoundId},
    settings::ReputationSettings,
};

/// The reputation of a single client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReputationRecord {
    pub client_id: ClientId,
    pub score: f64,
    pub last_updated_round: RoundId,
    /// The number of consecutive rounds the client did not contribute to.
    pub absence_streak: u32,
}

/// What a client contributed to a round.
#[derive(Clone, Copy, Debug)]
pub struct ContributionObservation<'a> {
    /// The admitted, possibly noised delta.
    pub delta: &'a [f64],
    pub accuracy_delta: f64,
}

/// What the aggregation of a round produced.
#[derive(Clone, Copy, Debug)]
pub struct AggregateOutcome<'a> {
    pub round_id: RoundId,
    /// The step from the previous to the new global state.
    pub step: &'a [f64],
    /// The weighted mean of the reported accuracy deltas.
    pub accuracy_delta: f64,
}

/// Maintains the reputation table.
#[derive(Debug, Clone)]
pub struct ReputationEngine {
    settings: ReputationSettings,
    records: HashMap<ClientId, ReputationRecord>,
}

impl ReputationEngine {
    pub fn new(settings: ReputationSettings) -> Self {
        Self {
            settings,
            records: HashMap::new(),
        }
    }

    fn record_mut(&mut self, client_id: &ClientId) -> &mut ReputationRecord {
        let initial = self.settings.initial;
        self.records
            .entry(client_id.clone())
            .or_insert_with(|| ReputationRecord {
                client_id: client_id.clone(),
                score: initial,
                last_updated_round: 0,
                absence_streak: 0,
            })
    }

    /// How well a contribution agrees with the aggregate outcome, in `[0, 1]`.
    ///
    /// The agreement is the product of the directional agreement of the delta with the aggregate
    /// step and the closeness of the reported accuracy delta to the aggregate one, discounted by
    /// the absence streak the client had before this round.
    pub fn agreement(
        &self,
        contribution: &ContributionObservation<'_>,
        outcome: &AggregateOutcome<'_>,
        absence_streak: u32,
    ) -> f64 {
        let direction = (cosine_similarity(contribution.delta, outcome.step) + 1.) / 2.;
        let deviation = (contribution.accuracy_delta - outcome.accuracy_delta).abs();
        let accuracy = 1. / (1. + deviation / self.settings.accuracy_tolerance);
        let participation =
            (1. - self.settings.absence_penalty * f64::from(absence_streak)).max(0.);
        (direction * accuracy * participation).max(0.).min(1.)
    }

    /// Updates the score of a client that contributed to a round.
    pub fn observe(
        &mut self,
        client_id: &ClientId,
        contribution: &ContributionObservation<'_>,
        outcome: &AggregateOutcome<'_>,
    ) -> f64 {
        let streak = self.record_mut(client_id).absence_streak;
        let agreement = self.agreement(contribution, outcome, streak);
        let ReputationSettings {
            alpha,
            floor,
            ceiling,
            ..
        } = self.settings;

        let record = self.record_mut(client_id);
        let score = alpha * agreement + (1. - alpha) * record.score;
        record.score = score.max(floor).min(ceiling);
        record.last_updated_round = outcome.round_id;
        record.absence_streak = 0;
        debug!(
            "reputation of client {}: agreement {:.4}, score {:.4}",
            client_id, agreement, record.score
        );
        record.score
    }

    /// Updates the score of a known client that did not contribute to a round.
    ///
    /// A client already updated for `round_id` keeps its score.
    pub fn observe_absence(&mut self, client_id: &ClientId, round_id: RoundId) -> f64 {
        let ReputationSettings {
            alpha,
            floor,
            ceiling,
            absence_penalty,
            ..
        } = self.settings;

        let record = self.record_mut(client_id);
        if record.last_updated_round == round_id {
            return record.score;
        }
        record.absence_streak = record.absence_streak.saturating_add(1);
        let target = (1. - absence_penalty * f64::from(record.absence_streak)).max(0.) * record.score;
        let score = alpha * target + (1. - alpha) * record.score;
        record.score = score.max(floor).min(ceiling);
        record.last_updated_round = round_id;
        record.score
    }

    /// Updates the score of a client whose contributions to a round were rejected for a policy
    /// or metric violation. A rejected round counts as zero agreement, no matter how many
    /// contributions were rejected: a client already updated for `round_id` keeps its score.
    pub fn observe_rejection(&mut self, client_id: &ClientId, round_id: RoundId) -> f64 {
        let ReputationSettings {
            alpha,
            floor,
            ceiling,
            ..
        } = self.settings;

        let record = self.record_mut(client_id);
        if record.last_updated_round == round_id {
            return record.score;
        }
        let score = (1. - alpha) * record.score;
        record.score = score.max(floor).min(ceiling);
        record.last_updated_round = round_id;
        debug!("reputation of client {} after rejection: {:.4}", client_id, record.score);
        record.score
    }

    /// The aggregation weight of a client: its score, but never less than the floor.
    pub fn weight_for(&self, client_id: &ClientId) -> f64 {
        self.records
            .get(client_id)
            .map(|record| record.score)
            .unwrap_or(self.settings.initial)
            .max(self.settings.floor)
    }

    pub fn record(&self, client_id: &ClientId) -> Option<&ReputationRecord> {
        self.records.get(client_id)
    }

    /// All records, ordered by client id.
    pub fn records(&self) -> Vec<ReputationRecord> {
        let mut records: Vec<_> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        records
    }

    /// Replaces the reputation table, clamping every score into the configured bounds.
    pub fn restore(&mut self, records: Vec<ReputationRecord>) {
        let ReputationSettings { floor, ceiling, .. } = self.settings;
        self.records = records
            .into_iter()
            .map(|mut record| {
                record.score = record.score.max(floor).min(ceiling);
                (record.client_id.clone(), record)
            })
            .collect();
    }
}
