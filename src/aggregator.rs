//! Weighted aggregation of admitted contributions and the convergence signal.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    common::{ClientId, GlobalState, ModelDelta, RoundId},
    privacy::NoiseRecord,
    settings::AggregationSettings,
};

/// A contribution that passed validation and privacy accounting.
#[derive(Clone, Debug, PartialEq)]
pub struct AdmittedContribution {
    pub client_id: ClientId,
    /// The delta as admitted, i.e. after noising.
    pub delta: ModelDelta,
    pub accuracy_delta: f64,
    /// The dataset size the client declared on registration.
    pub dataset_size: u64,
    /// The epsilon charged for this contribution.
    pub epsilon: f64,
    /// The server-side noise draw, if any.
    pub noise: Option<NoiseRecord>,
}

#[derive(Debug, Error, PartialEq)]
pub enum AggregationError {
    #[error("no contributions to aggregate")]
    NoContributions,
    #[error("contribution of client {client_id} has length {got}, expected {expected}")]
    LengthMismatch {
        client_id: ClientId,
        expected: usize,
        got: usize,
    },
}

/// The result of aggregating a round.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregationOutcome {
    pub global_state: GlobalState,
    /// The euclidean distance between the previous and the new global state.
    pub convergence_score: f64,
    /// The normalized weight of every contribution, in contribution order.
    pub weights: Vec<(ClientId, f64)>,
    /// The weighted mean of the reported accuracy deltas.
    pub accuracy_delta: f64,
    /// The difference between the new and the previous global state.
    pub step: Vec<f64>,
}

/// Normalizes non-negative values to sum to `1`. Falls back to uniform weights if the values
/// carry no information.
fn normalize(values: &[f64]) -> Vec<f64> {
    let total: f64 = values.iter().sum();
    if total > 0. && total.is_finite() {
        values.iter().map(|v| v / total).collect()
    } else {
        vec![1. / values.len() as f64; values.len()]
    }
}

/// Computes the aggregation weights: the normalized reputation weight times the normalized
/// dataset size weight, renormalized over all participants.
///
/// A declared dataset size counts as at least one sample, so a client without data is
/// down-weighted but never dropped from the aggregate.
pub fn aggregation_weights<F>(contributions: &[AdmittedContribution], reputation: F) -> Vec<f64>
where
    F: Fn(&ClientId) -> f64,
{
    if contributions.is_empty() {
        return Vec::new();
    }
    let reputations: Vec<f64> = contributions
        .iter()
        .map(|c| reputation(&c.client_id).max(0.))
        .collect();
    let sizes: Vec<f64> = contributions
        .iter()
        .map(|c| c.dataset_size.max(1) as f64)
        .collect();

    let combined: Vec<f64> = normalize(&reputations)
        .into_iter()
        .zip(normalize(&sizes))
        .map(|(r, d)| r * d)
        .collect();
    normalize(&combined)
}

/// Combines the admitted contributions of a round into a new global state.
///
/// The aggregator only reports the convergence score. Whether training stops is decided by the
/// [`ConvergenceTracker`] and ultimately the training orchestration.
#[derive(Debug, Default, Clone, Copy)]
pub struct Aggregator;

impl Aggregator {
    pub fn new() -> Self {
        Self
    }

    /// Aggregates the contributions of round `round_id` on top of `previous`.
    ///
    /// # Errors
    /// Fails if there are no contributions or if a delta does not match the length of the
    /// previous global state.
    pub fn aggregate<F>(
        &self,
        round_id: RoundId,
        previous: &GlobalState,
        contributions: &[AdmittedContribution],
        reputation: F,
    ) -> Result<AggregationOutcome, AggregationError>
    where
        F: Fn(&ClientId) -> f64,
    {
        if contributions.is_empty() {
            return Err(AggregationError::NoContributions);
        }
        let length = previous.len();
        if let Some(c) = contributions.iter().find(|c| c.delta.len() != length) {
            return Err(AggregationError::LengthMismatch {
                client_id: c.client_id.clone(),
                expected: length,
                got: c.delta.len(),
            });
        }

        let weights = aggregation_weights(contributions, reputation);
        debug!("aggregating {} contributions", contributions.len());

        let step: Vec<f64> = (0..length)
            .into_par_iter()
            .map(|i| {
                contributions
                    .iter()
                    .zip(&weights)
                    .map(|(c, w)| w * c.delta.as_slice()[i])
                    .sum()
            })
            .collect();
        let new_weights: Vec<f64> = previous
            .weights
            .iter()
            .zip(&step)
            .map(|(prev, s)| prev + s)
            .collect();

        let global_state = GlobalState {
            version: previous.version,
            round_id,
            weights: new_weights,
        };
        let convergence_score = previous.distance(&global_state);
        let accuracy_delta = contributions
            .iter()
            .zip(&weights)
            .map(|(c, w)| w * c.accuracy_delta)
            .sum();
        info!(
            "aggregated round {}: convergence score {:.6}, accuracy delta {:.4}",
            round_id, convergence_score, accuracy_delta
        );

        Ok(AggregationOutcome {
            global_state,
            convergence_score,
            weights: contributions
                .iter()
                .map(|c| c.client_id.clone())
                .zip(weights)
                .collect(),
            accuracy_delta,
            step,
        })
    }
}

/// The termination signal derived from the convergence scores of consecutive rounds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceSignal {
    pub score: f64,
    /// Number of consecutive rounds with a score below the threshold.
    pub streak: u32,
    pub converged: bool,
}

/// Turns per-round convergence scores into a [`ConvergenceSignal`].
#[derive(Clone, Debug)]
pub struct ConvergenceTracker {
    threshold: f64,
    rounds: u32,
    streak: u32,
}

impl ConvergenceTracker {
    pub fn new(settings: AggregationSettings) -> Self {
        Self {
            threshold: settings.convergence_threshold,
            rounds: settings.convergence_rounds,
            streak: 0,
        }
    }

    pub fn record(&mut self, score: f64) -> ConvergenceSignal {
        if score < self.threshold {
            self.streak = self.streak.saturating_add(1);
        } else {
            self.streak = 0;
        }
        ConvergenceSignal {
            score,
            streak: self.streak,
            converged: self.streak >= self.rounds,
        }
    }

    /// Replays the scores of past rounds, oldest first.
    pub fn restore<I>(&mut self, scores: I)
    where
        I: IntoIterator<Item = f64>,
    {
        self.streak = 0;
        for score in scores {
            self.record(score);
        }
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SchemaVersion;

    fn contribution(id: &str, delta: Vec<f64>, dataset_size: u64) -> AdmittedContribution {
        AdmittedContribution {
            client_id: ClientId::from(id),
            delta: delta.into(),
            accuracy_delta: 0.02,
            dataset_size,
            epsilon: 0.1,
            noise: None,
        }
    }

    #[test]
    fn test_weights_sum_to_one() {
        let contributions = vec![
            contribution("a", vec![0.; 2], 100),
            contribution("b", vec![0.; 2], 300),
            contribution("c", vec![0.; 2], 0),
        ];
        let weights = aggregation_weights(&contributions, |id| match id.as_str() {
            "a" => 1.0,
            "b" => 0.5,
            _ => 0.05,
        });
        assert!((weights.iter().sum::<f64>() - 1.).abs() < 1e-12);
        assert!(weights.iter().all(|w| *w >= 0.));
        // a: 1/1.55 * 100/401, b: 0.5/1.55 * 300/401
        assert!(weights[1] > weights[0]);
        assert!(weights[2] > 0.);
        assert!(weights[2] < weights[0]);
    }

    #[test]
    fn test_zero_dataset_size_keeps_a_share() {
        let contributions = vec![
            contribution("a", vec![1.0, 0.0], 100),
            contribution("b", vec![0.0, 1.0], 0),
        ];
        let weights = aggregation_weights(&contributions, |_| 1.);
        assert!(weights[1] > 0.);
        assert!((weights[0] - 100. / 101.).abs() < 1e-12);

        let previous = GlobalState::zeroed(SchemaVersion::INITIAL, 2);
        let outcome = Aggregator::new()
            .aggregate(1, &previous, &contributions, |_| 1.)
            .unwrap();
        assert!(outcome.global_state.weights[1] > 0.);
    }

    #[test]
    fn test_uniform_fallback() {
        let contributions = vec![
            contribution("a", vec![0.; 2], 0),
            contribution("b", vec![0.; 2], 0),
        ];
        let weights = aggregation_weights(&contributions, |_| 0.);
        assert_eq!(weights, vec![0.5, 0.5]);
    }

    #[test]
    fn test_aggregate() {
        let previous = GlobalState::zeroed(SchemaVersion::INITIAL, 2);
        let contributions = vec![
            contribution("a", vec![1.0, 0.0], 100),
            contribution("b", vec![0.0, 1.0], 100),
        ];
        let outcome = Aggregator::new()
            .aggregate(4, &previous, &contributions, |_| 0.5)
            .unwrap();
        assert_eq!(outcome.global_state.weights, vec![0.5, 0.5]);
        assert_eq!(outcome.global_state.round_id, 4);
        assert!((outcome.convergence_score - 0.5f64.sqrt()).abs() < 1e-12);
        assert!((outcome.accuracy_delta - 0.02).abs() < 1e-12);
        assert_eq!(outcome.step, vec![0.5, 0.5]);
    }

    #[test]
    fn test_aggregate_errors() {
        let previous = GlobalState::zeroed(SchemaVersion::INITIAL, 2);
        assert_eq!(
            Aggregator::new().aggregate(1, &previous, &[], |_| 1.),
            Err(AggregationError::NoContributions)
        );
        let contributions = vec![contribution("a", vec![1.0], 1)];
        assert!(matches!(
            Aggregator::new().aggregate(1, &previous, &contributions, |_| 1.),
            Err(AggregationError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_convergence_tracker() {
        let mut tracker = ConvergenceTracker::new(AggregationSettings {
            convergence_threshold: 0.1,
            convergence_rounds: 2,
        });
        assert!(!tracker.record(0.05).converged);
        assert!(tracker.record(0.01).converged);
        let signal = tracker.record(0.5);
        assert!(!signal.converged);
        assert_eq!(signal.streak, 0);

        tracker.restore(vec![0.5, 0.01, 0.02]);
        assert_eq!(tracker.streak(), 2);
    }
}
