//! An append-only ledger of JSON lines files.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, warn};

use crate::{
    common::RoundId,
    privacy::PrivacyLedgerEntry,
    storage::{LedgerStorage, RoundRecord, Snapshot, StorageResult},
};

const ROUNDS_FILE: &str = "rounds.jsonl";
const CHARGES_FILE: &str = "charges.jsonl";
const SNAPSHOTS_FILE: &str = "snapshots.jsonl";

/// A ledger that appends every record as a JSON line to one of three files in a directory.
///
/// Every append is synced to disk before it returns. A truncated last line, as left behind by a
/// crash during an append, is ignored when reading.
#[derive(Clone, Debug)]
pub struct FileLedger {
    dir: Arc<PathBuf>,
    // serializes appends of all clones
    write_lock: Arc<Mutex<()>>,
}

impl FileLedger {
    /// Opens the ledger in `dir`, creating the directory if necessary.
    pub async fn open(dir: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create ledger directory {}", dir.display()))?;
        debug!("opened file ledger in {}", dir.display());
        Ok(Self {
            dir: Arc::new(dir),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    async fn append<T: Serialize>(&self, file: &str, value: &T) -> StorageResult<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');

        let path = self.dir.join(file);
        let _guard = self.write_lock.lock().await;
        let mut handle = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        handle.write_all(&line).await?;
        handle.flush().await?;
        handle.sync_data().await?;
        Ok(())
    }

    async fn read_all<T: DeserializeOwned>(&self, file: &str) -> StorageResult<Vec<T>> {
        let path = self.dir.join(file);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };

        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut values = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str(line) {
                Ok(value) => values.push(value),
                Err(err) if i + 1 == lines.len() && !content.ends_with('\n') => {
                    warn!("ignoring truncated last line of {}: {}", path.display(), err);
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("corrupt line {} in {}", i + 1, path.display())
                    })
                }
            }
        }
        Ok(values)
    }
}

#[async_trait]
impl LedgerStorage for FileLedger {
    async fn append_charge(&mut self, entry: &PrivacyLedgerEntry) -> StorageResult<()> {
        self.append(CHARGES_FILE, entry).await
    }

    async fn append_snapshot(&mut self, snapshot: &Snapshot) -> StorageResult<()> {
        self.append(SNAPSHOTS_FILE, snapshot).await
    }

    async fn append_round(&mut self, record: &RoundRecord) -> StorageResult<()> {
        self.append(ROUNDS_FILE, record).await
    }

    async fn rounds(&mut self) -> StorageResult<Vec<RoundRecord>> {
        self.read_all(ROUNDS_FILE).await
    }

    async fn charges(&mut self) -> StorageResult<Vec<PrivacyLedgerEntry>> {
        self.read_all(CHARGES_FILE).await
    }

    async fn snapshot(&mut self, round_id: RoundId) -> StorageResult<Option<Snapshot>> {
        let snapshots: Vec<Snapshot> = self.read_all(SNAPSHOTS_FILE).await?;
        Ok(snapshots
            .into_iter()
            .rev()
            .find(|snapshot| snapshot.round_id == round_id))
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        let metadata = fs::metadata(self.dir.as_ref())
            .await
            .with_context(|| format!("ledger directory {} unavailable", self.dir.display()))?;
        anyhow::ensure!(
            metadata.is_dir(),
            "{} is not a directory",
            self.dir.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::{
        common::ClientId,
        privacy::{NoiseRecord, PrivacyCharge},
        storage::RoundOutcome,
    };

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("fedcoord-ledger-{}", Uuid::new_v4()))
    }

    fn charge(round_id: RoundId) -> PrivacyLedgerEntry {
        PrivacyLedgerEntry::new(
            &PrivacyCharge {
                client_id: ClientId::from("a"),
                round_id,
                epsilon: 0.1,
                running_total: 0.1 * round_id as f64,
            },
            Some(NoiseRecord {
                seed: 7,
                sigma: 0.5,
            }),
        )
    }

    #[tokio::test]
    async fn test_records_survive_reopening() {
        let dir = temp_dir();
        let mut ledger = FileLedger::open(&dir).await.unwrap();
        assert!(ledger.is_ready().await.is_ok());
        assert!(ledger.rounds().await.unwrap().is_empty());

        ledger.append_charge(&charge(1)).await.unwrap();
        ledger.append_charge(&charge(2)).await.unwrap();
        let record = RoundRecord {
            round_id: 1,
            status: RoundOutcome::TimedOut,
            participant_ids: Vec::new(),
            admitted_count: 0,
            convergence_score: None,
            accuracy_delta: None,
            privacy_spent: 0.,
            participations: Vec::new(),
            started_at: Utc::now(),
            timestamp: Utc::now(),
        };
        ledger.append_round(&record).await.unwrap();

        let mut reopened = FileLedger::open(&dir).await.unwrap();
        let charges = reopened.charges().await.unwrap();
        assert_eq!(charges.len(), 2);
        assert_eq!(charges[1].round_id, 2);
        assert_eq!(charges[0].noise, Some(NoiseRecord { seed: 7, sigma: 0.5 }));
        assert_eq!(reopened.rounds().await.unwrap(), vec![record]);
        assert_eq!(reopened.snapshot(1).await.unwrap(), None);

        fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_truncated_last_line_is_ignored() {
        let dir = temp_dir();
        let mut ledger = FileLedger::open(&dir).await.unwrap();
        ledger.append_charge(&charge(1)).await.unwrap();

        let mut handle = fs::OpenOptions::new()
            .append(true)
            .open(dir.join(CHARGES_FILE))
            .await
            .unwrap();
        handle.write_all(b"{\"client_id\":\"a\",\"rou").await.unwrap();
        handle.flush().await.unwrap();

        assert_eq!(ledger.charges().await.unwrap().len(), 1);
        fs::remove_dir_all(&dir).await.unwrap();
    }
}
