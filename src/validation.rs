//! Structural and numeric checks of submitted contributions.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{
    common::{ClientId, ModelDelta, RoundId, SchemaVersion},
    settings::ValidationSettings,
    state_machine::phases::PhaseName,
};

/// A client's proposed update for a round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub client_id: ClientId,
    pub round_id: RoundId,
    /// The schema version the delta was computed against.
    pub version: SchemaVersion,
    pub delta: ModelDelta,
    /// The self-reported change in local accuracy.
    pub accuracy_delta: f64,
    /// Whether the client already noised the delta.
    #[serde(default)]
    pub noised: bool,
    /// The epsilon the client wants to spend. The configured default is charged if absent.
    #[serde(default)]
    pub epsilon: Option<f64>,
}

/// The view of the running round a contribution is validated against.
#[derive(Debug)]
pub struct RoundContext<'a> {
    pub phase: PhaseName,
    pub round_id: RoundId,
    pub version: SchemaVersion,
    pub model_length: usize,
    /// Clients that already have an admitted contribution in this round.
    pub submitted: &'a HashSet<ClientId>,
}

/// Why a contribution was rejected.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("the round is not accepting contributions")]
    RoundNotAccepting,
    #[error("contribution for round {got} but round {expected} is running")]
    WrongRound { expected: RoundId, got: RoundId },
    #[error("the client already contributed to this round")]
    DuplicateSubmission,
    #[error("contribution for schema version {got} but version {expected} is current")]
    StaleVersion {
        expected: SchemaVersion,
        got: SchemaVersion,
    },
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("implausible metric: {0}")]
    ImplausibleMetric(String),
    #[error("delta norm {norm} exceeds the clipping bound {bound}")]
    NormExceeded { norm: f64, bound: f64 },
}

/// Checks contributions against the running round and the configured numeric bounds.
#[derive(Clone, Copy, Debug)]
pub struct ContributionValidator {
    clip_norm: f64,
    max_accuracy_delta: f64,
}

impl ContributionValidator {
    pub fn new(settings: ValidationSettings) -> Self {
        Self {
            clip_norm: settings.clip_norm,
            max_accuracy_delta: settings.max_accuracy_delta,
        }
    }

    pub fn clip_norm(&self) -> f64 {
        self.clip_norm
    }

    /// Validates a contribution. The checks run in a fixed order and the first failing check
    /// determines the error.
    ///
    /// A contribution that passes is not admitted yet: its privacy charge must be accepted too.
    pub fn validate(
        &self,
        contribution: &Contribution,
        ctx: &RoundContext<'_>,
    ) -> Result<(), ValidationError> {
        if ctx.phase != PhaseName::Collecting {
            return Err(ValidationError::RoundNotAccepting);
        }
        if contribution.round_id != ctx.round_id {
            return Err(ValidationError::WrongRound {
                expected: ctx.round_id,
                got: contribution.round_id,
            });
        }
        if ctx.submitted.contains(&contribution.client_id) {
            return Err(ValidationError::DuplicateSubmission);
        }
        if contribution.version != ctx.version {
            return Err(ValidationError::StaleVersion {
                expected: ctx.version,
                got: contribution.version,
            });
        }
        self.check_shape(&contribution.delta, ctx.model_length)?;
        self.check_metrics(contribution)?;
        self.check_norm(&contribution.delta)?;

        debug!("contribution of client {} is valid", contribution.client_id);
        Ok(())
    }

    fn check_shape(&self, delta: &ModelDelta, length: usize) -> Result<(), ValidationError> {
        if delta.is_empty() {
            return Err(ValidationError::MalformedPayload("empty delta".into()));
        }
        if delta.len() != length {
            return Err(ValidationError::MalformedPayload(format!(
                "expected {} elements, got {}",
                length,
                delta.len()
            )));
        }
        if !delta.is_finite() {
            return Err(ValidationError::MalformedPayload(
                "delta contains non-finite values".into(),
            ));
        }
        Ok(())
    }

    fn check_metrics(&self, contribution: &Contribution) -> Result<(), ValidationError> {
        let accuracy = contribution.accuracy_delta;
        if !accuracy.is_finite() || accuracy.abs() > self.max_accuracy_delta {
            return Err(ValidationError::ImplausibleMetric(format!(
                "accuracy delta {}",
                accuracy
            )));
        }
        match contribution.epsilon {
            Some(epsilon) if !epsilon.is_finite() || epsilon <= 0. => Err(
                ValidationError::ImplausibleMetric(format!("epsilon {}", epsilon)),
            ),
            _ => Ok(()),
        }
    }

    fn check_norm(&self, delta: &ModelDelta) -> Result<(), ValidationError> {
        let norm = delta.l2_norm();
        if norm > self.clip_norm {
            Err(ValidationError::NormExceeded {
                norm,
                bound: self.clip_norm,
            })
        } else {
            Ok(())
        }
    }
}
