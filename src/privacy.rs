//! Differential privacy accounting.
//!
//! The [`PrivacyAccountant`] tracks the cumulative epsilon spent by every client. Charges of the
//! running round are kept apart as pending charges until the round is committed, so that a round
//! which never produces a global state update can be rolled back without touching the committed
//! totals. The [`GaussianMechanism`] noises contributions before they are admitted.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::common::{ClientId, ModelDelta, RoundId};

/// Slack for floating point accumulation when comparing a spend against the budget.
const BUDGET_TOLERANCE: f64 = 1e-9;

/// Errors of the privacy layer.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum PrivacyError {
    #[error("privacy budget exceeded: spent {spent}, requested {requested}, budget {budget}")]
    BudgetExceeded {
        spent: f64,
        requested: f64,
        budget: f64,
    },
    #[error("invalid noise scale {0}")]
    InvalidNoise(f64),
}

/// The noise draw applied to a contribution.
///
/// The draw is reproducible from the seed. The pre-noise payload is never recorded.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NoiseRecord {
    pub seed: u64,
    pub sigma: f64,
}

/// An accepted, not yet committed charge.
#[derive(Clone, Debug, PartialEq)]
pub struct PrivacyCharge {
    pub client_id: ClientId,
    pub round_id: RoundId,
    pub epsilon: f64,
    /// The client's spend including this charge.
    pub running_total: f64,
}

/// An append-only record of a single charge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrivacyLedgerEntry {
    pub client_id: ClientId,
    pub round_id: RoundId,
    pub epsilon: f64,
    pub running_total: f64,
    /// The server-side noise draw, if the server noised the contribution.
    pub noise: Option<NoiseRecord>,
    pub timestamp: DateTime<Utc>,
}

impl PrivacyLedgerEntry {
    pub fn new(charge: &PrivacyCharge, noise: Option<NoiseRecord>) -> Self {
        Self {
            client_id: charge.client_id.clone(),
            round_id: charge.round_id,
            epsilon: charge.epsilon,
            running_total: charge.running_total,
            noise,
            timestamp: Utc::now(),
        }
    }
}

/// Tracks the epsilon spend of every client against a common budget.
#[derive(Clone, Debug)]
pub struct PrivacyAccountant {
    budget: f64,
    committed: HashMap<ClientId, f64>,
    pending: HashMap<ClientId, PrivacyCharge>,
}

impl PrivacyAccountant {
    pub fn new(budget: f64) -> Self {
        Self {
            budget,
            committed: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub fn budget(&self) -> f64 {
        self.budget
    }

    /// The committed spend of a client.
    pub fn committed(&self, client_id: &ClientId) -> f64 {
        self.committed.get(client_id).copied().unwrap_or_default()
    }

    /// The committed plus pending spend of a client.
    pub fn spent(&self, client_id: &ClientId) -> f64 {
        self.committed(client_id)
            + self
                .pending
                .get(client_id)
                .map(|charge| charge.epsilon)
                .unwrap_or_default()
    }

    pub fn remaining(&self, client_id: &ClientId) -> f64 {
        (self.budget - self.spent(client_id)).max(0.)
    }

    /// Charges `epsilon` to a client for the running round.
    ///
    /// The charge is pending until [`commit_round()`] is called.
    ///
    /// # Errors
    /// Fails with [`PrivacyError::BudgetExceeded`] if the projected spend exceeds the budget. A
    /// denied charge leaves the spend untouched.
    ///
    /// [`commit_round()`]: PrivacyAccountant::commit_round
    pub fn charge(
        &mut self,
        client_id: &ClientId,
        round_id: RoundId,
        epsilon: f64,
    ) -> Result<PrivacyCharge, PrivacyError> {
        let spent = self.spent(client_id);
        let projected = spent + epsilon;
        if projected > self.budget + BUDGET_TOLERANCE {
            debug!(
                "denying charge of {} for client {}: {} of {} spent",
                epsilon, client_id, spent, self.budget
            );
            return Err(PrivacyError::BudgetExceeded {
                spent,
                requested: epsilon,
                budget: self.budget,
            });
        }

        let charge = PrivacyCharge {
            client_id: client_id.clone(),
            round_id,
            epsilon,
            running_total: projected,
        };
        match self.pending.get_mut(client_id) {
            Some(pending) => {
                pending.epsilon += epsilon;
                pending.running_total = projected;
            }
            None => {
                self.pending.insert(client_id.clone(), charge.clone());
            }
        }
        Ok(charge)
    }

    /// Takes back a pending charge, e.g. when it could not be written to the ledger.
    pub fn revoke(&mut self, charge: &PrivacyCharge) {
        let remove = match self.pending.get_mut(&charge.client_id) {
            Some(pending) => {
                pending.epsilon -= charge.epsilon;
                pending.running_total -= charge.epsilon;
                pending.epsilon <= BUDGET_TOLERANCE
            }
            None => false,
        };
        if remove {
            self.pending.remove(&charge.client_id);
        }
    }

    /// Turns all pending charges into committed spend. Returns the total epsilon committed.
    pub fn commit_round(&mut self) -> f64 {
        let mut total = 0.;
        for (client_id, charge) in self.pending.drain() {
            *self.committed.entry(client_id).or_default() += charge.epsilon;
            total += charge.epsilon;
        }
        info!("committed a privacy spend of {}", total);
        total
    }

    /// Discards all pending charges. Returns the total epsilon rolled back.
    pub fn rollback_round(&mut self) -> f64 {
        let total: f64 = self.pending.drain().map(|(_, charge)| charge.epsilon).sum();
        if total > 0. {
            warn!("rolled back a privacy spend of {}", total);
        }
        total
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Rebuilds the committed spend from ledger entries. Entries of rounds that are not in
    /// `closed_rounds` are discarded.
    pub fn restore<'a, I>(&mut self, entries: I, closed_rounds: &HashSet<RoundId>)
    where
        I: IntoIterator<Item = &'a PrivacyLedgerEntry>,
    {
        self.committed.clear();
        self.pending.clear();
        let mut discarded = 0;
        for entry in entries {
            if closed_rounds.contains(&entry.round_id) {
                *self.committed.entry(entry.client_id.clone()).or_default() += entry.epsilon;
            } else {
                discarded += 1;
            }
        }
        if discarded > 0 {
            info!(
                "discarded {} privacy charges of rounds that never closed",
                discarded
            );
        }
    }
}

/// The Gaussian mechanism, calibrated to the clipping bound of the deltas.
#[derive(Clone, Copy, Debug)]
pub struct GaussianMechanism {
    clip_norm: f64,
    delta: f64,
}

impl GaussianMechanism {
    pub fn new(clip_norm: f64, delta: f64) -> Self {
        Self { clip_norm, delta }
    }

    /// The standard deviation that gives `(epsilon, delta)`-privacy for an L2 sensitivity of
    /// `clip_norm`.
    pub fn sigma(&self, epsilon: f64) -> f64 {
        self.clip_norm * (2. * (1.25 / self.delta).ln()).sqrt() / epsilon
    }

    /// Adds noise to a delta with a fresh seed.
    pub fn privatize(&self, delta: &mut ModelDelta, epsilon: f64) -> Result<NoiseRecord, PrivacyError> {
        let seed = rand::thread_rng().gen();
        self.privatize_with_seed(delta, epsilon, seed)
    }

    /// Adds the noise drawn from `seed` to a delta.
    pub fn privatize_with_seed(
        &self,
        delta: &mut ModelDelta,
        epsilon: f64,
        seed: u64,
    ) -> Result<NoiseRecord, PrivacyError> {
        let sigma = self.sigma(epsilon);
        if !sigma.is_finite() || sigma <= 0. {
            return Err(PrivacyError::InvalidNoise(sigma));
        }
        let normal = Normal::new(0., sigma).map_err(|_| PrivacyError::InvalidNoise(sigma))?;
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        for x in delta.as_mut_slice() {
            *x += normal.sample(&mut rng);
        }
        Ok(NoiseRecord { seed, sigma })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ClientId {
        ClientId::from("a")
    }

    #[test]
    fn test_charge_within_budget() {
        let mut accountant = PrivacyAccountant::new(1.0);
        let charge = accountant.charge(&client(), 1, 0.4).unwrap();
        assert_eq!(charge.running_total, 0.4);
        assert_eq!(accountant.spent(&client()), 0.4);
        assert_eq!(accountant.committed(&client()), 0.);

        assert_eq!(accountant.commit_round(), 0.4);
        assert_eq!(accountant.committed(&client()), 0.4);
        assert!(!accountant.has_pending());
    }

    #[test]
    fn test_charge_exceeding_budget_is_denied_without_side_effects() {
        let mut accountant = PrivacyAccountant::new(1.0);
        accountant.charge(&client(), 1, 0.95).unwrap();
        accountant.commit_round();

        let err = accountant.charge(&client(), 2, 0.1).unwrap_err();
        assert!(matches!(err, PrivacyError::BudgetExceeded { .. }));
        assert_eq!(accountant.spent(&client()), 0.95);
        assert!(!accountant.has_pending());
    }

    #[test]
    fn test_spend_is_monotone_and_bounded() {
        let mut accountant = PrivacyAccountant::new(1.0);
        let mut last = 0.;
        for round in 0..15 {
            let _ = accountant.charge(&client(), round, 0.1);
            accountant.commit_round();
            let spent = accountant.committed(&client());
            assert!(spent >= last);
            assert!(spent <= 1.0 + BUDGET_TOLERANCE);
            last = spent;
        }
        // ten charges of 0.1 fit into the budget despite rounding
        assert!((last - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_rollback_and_revoke() {
        let mut accountant = PrivacyAccountant::new(1.0);
        accountant.charge(&client(), 1, 0.3).unwrap();
        accountant.commit_round();

        let charge = accountant.charge(&client(), 2, 0.3).unwrap();
        accountant.revoke(&charge);
        assert!(!accountant.has_pending());

        accountant.charge(&client(), 2, 0.3).unwrap();
        accountant.charge(&ClientId::from("b"), 2, 0.2).unwrap();
        assert!((accountant.rollback_round() - 0.5).abs() < 1e-12);
        assert_eq!(accountant.spent(&client()), 0.3);
        assert_eq!(accountant.spent(&ClientId::from("b")), 0.);
    }

    #[test]
    fn test_restore_discards_unclosed_rounds() {
        let charge = |round_id, epsilon| PrivacyLedgerEntry {
            client_id: client(),
            round_id,
            epsilon,
            running_total: 0.,
            noise: None,
            timestamp: Utc::now(),
        };
        let entries = vec![charge(1, 0.1), charge(2, 0.2), charge(3, 0.4)];
        let closed: HashSet<RoundId> = vec![1, 3].into_iter().collect();

        let mut accountant = PrivacyAccountant::new(1.0);
        accountant.restore(&entries, &closed);
        assert!((accountant.committed(&client()) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_gaussian_noise_is_reproducible() {
        let mechanism = GaussianMechanism::new(1.0, 1e-5);
        let sigma = mechanism.sigma(0.5);
        assert!((sigma - 2. * (2. * (1.25e5f64).ln()).sqrt()).abs() < 1e-9);

        let mut a = ModelDelta::from(vec![0.; 8]);
        let record = mechanism.privatize_with_seed(&mut a, 0.5, 42).unwrap();
        assert_eq!(record.seed, 42);
        assert_eq!(record.sigma, sigma);

        let mut c = ModelDelta::from(vec![0.; 8]);
        mechanism.privatize_with_seed(&mut c, 0.5, 42).unwrap();
        assert_eq!(a, c);
        assert!(a.as_slice().iter().any(|x| *x != 0.));
    }

    #[test]
    fn test_invalid_noise() {
        let mechanism = GaussianMechanism::new(1.0, 1e-5);
        let mut delta = ModelDelta::from(vec![0.; 2]);
        assert!(matches!(
            mechanism.privatize(&mut delta, 0.),
            Err(PrivacyError::InvalidNoise(_))
        ));
    }
}
