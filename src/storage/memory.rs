use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    common::RoundId,
    privacy::PrivacyLedgerEntry,
    storage::{LedgerStorage, RoundRecord, Snapshot, StorageResult},
};

#[derive(Debug, Default)]
struct Inner {
    rounds: Vec<RoundRecord>,
    charges: Vec<PrivacyLedgerEntry>,
    snapshots: Vec<Snapshot>,
}

/// A ledger that lives in memory. Nothing survives a restart.
#[derive(Clone, Debug, Default)]
pub struct MemoryLedger {
    inner: Arc<Mutex<Inner>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write and readiness check fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(anyhow!("memory ledger is unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LedgerStorage for MemoryLedger {
    async fn append_charge(&mut self, entry: &PrivacyLedgerEntry) -> StorageResult<()> {
        self.check_available()?;
        self.inner.lock().await.charges.push(entry.clone());
        Ok(())
    }

    async fn append_snapshot(&mut self, snapshot: &Snapshot) -> StorageResult<()> {
        self.check_available()?;
        self.inner.lock().await.snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn append_round(&mut self, record: &RoundRecord) -> StorageResult<()> {
        self.check_available()?;
        self.inner.lock().await.rounds.push(record.clone());
        Ok(())
    }

    async fn rounds(&mut self) -> StorageResult<Vec<RoundRecord>> {
        Ok(self.inner.lock().await.rounds.clone())
    }

    async fn charges(&mut self) -> StorageResult<Vec<PrivacyLedgerEntry>> {
        Ok(self.inner.lock().await.charges.clone())
    }

    async fn snapshot(&mut self, round_id: RoundId) -> StorageResult<Option<Snapshot>> {
        Ok(self
            .inner
            .lock()
            .await
            .snapshots
            .iter()
            .rev()
            .find(|snapshot| snapshot.round_id == round_id)
            .cloned())
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        self.check_available()
    }
}
