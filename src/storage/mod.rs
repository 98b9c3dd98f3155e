//! The round ledger.
//!
//! The ledger is the durable record of the coordinator. It receives one append per privacy
//! charge, one snapshot of the committed global state and reputation table per closed round and
//! one [`RoundRecord`] per finished round. A round counts as committed once its `CLOSED` record
//! was appended.

pub mod file;
pub mod memory;
pub mod traits;

pub use self::{
    file::FileLedger,
    memory::MemoryLedger,
    traits::{
        LedgerStorage,
        Participation,
        RoundOutcome,
        RoundRecord,
        Snapshot,
        StorageError,
        StorageResult,
    },
};
