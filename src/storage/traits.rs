//! Storage API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{
    common::{ClientId, GlobalState, RoundId},
    privacy::PrivacyLedgerEntry,
    reputation::ReputationRecord,
};

/// The error type for storage operations that are not directly related to application domain.
/// These include, for example IO errors like broken pipe, file not found, out-of-memory, etc.
pub type StorageError = anyhow::Error;

/// The result of the storage operation.
pub type StorageResult<T> = Result<T, StorageError>;

/// How a round ended.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundOutcome {
    #[display(fmt = "CLOSED")]
    Closed,
    #[display(fmt = "TIMED_OUT")]
    TimedOut,
}

/// The part a single client played in a closed round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Participation {
    pub client_id: ClientId,
    /// The normalized aggregation weight.
    pub weight: f64,
    pub dataset_size: u64,
    pub accuracy_delta: f64,
    pub epsilon: f64,
}

/// The ledger record of a finished round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round_id: RoundId,
    pub status: RoundOutcome,
    pub participant_ids: Vec<ClientId>,
    pub admitted_count: usize,
    /// `None` for a round that timed out.
    pub convergence_score: Option<f64>,
    /// The weighted mean of the reported accuracy deltas.
    pub accuracy_delta: Option<f64>,
    /// The total epsilon committed in this round.
    pub privacy_spent: f64,
    #[serde(default)]
    pub participations: Vec<Participation>,
    pub started_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

impl RoundRecord {
    pub fn is_closed(&self) -> bool {
        self.status == RoundOutcome::Closed
    }
}

/// The committed coordinator state after a round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub round_id: RoundId,
    pub global_state: GlobalState,
    pub reputations: Vec<ReputationRecord>,
}

#[async_trait]
/// An abstract, append-only round ledger.
pub trait LedgerStorage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Appends a privacy charge.
    async fn append_charge(&mut self, entry: &PrivacyLedgerEntry) -> StorageResult<()>;

    /// Appends the snapshot of a round that is about to be closed.
    ///
    /// # Behavior
    ///
    /// - A snapshot is only taken into account once a `CLOSED` [`RoundRecord`] of the same round
    ///   was appended.
    async fn append_snapshot(&mut self, snapshot: &Snapshot) -> StorageResult<()>;

    /// Appends the record of a finished round.
    async fn append_round(&mut self, record: &RoundRecord) -> StorageResult<()>;

    /// Returns all round records in the order they were appended.
    async fn rounds(&mut self) -> StorageResult<Vec<RoundRecord>>;

    /// Returns all privacy charges in the order they were appended.
    async fn charges(&mut self) -> StorageResult<Vec<PrivacyLedgerEntry>>;

    /// Returns the snapshot of a round.
    ///
    /// # Behavior
    ///
    /// - If no snapshot was appended for the round, return `StorageResult::Ok(Option::None)`.
    /// - If several snapshots were appended for the round, return the last one.
    async fn snapshot(&mut self, round_id: RoundId) -> StorageResult<Option<Snapshot>>;

    /// Checks if the ledger is ready to process requests.
    ///
    /// # Behavior
    ///
    /// If the ledger is ready to process requests, return `StorageResult::Ok(())`.
    /// If the ledger cannot process requests because of a connection or IO error,
    /// for example, return the error.
    async fn is_ready(&mut self) -> StorageResult<()>;
}
