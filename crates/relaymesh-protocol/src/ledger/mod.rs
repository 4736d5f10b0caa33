/// Distributed ledger — signed, causally ordered, hash-linked entries.
///
/// Each sender owns one chain: gapless sequence numbers from 1, each entry
/// linking the previous entry's hash. There is no global order; Lamport
/// timestamps order entries causally.
pub mod entry;
pub mod lamport;
pub mod store;
pub mod sync;

pub use entry::{EntryStatus, LedgerEntry, Transaction};
pub use lamport::{LamportClock, LamportTimestamp};
pub use store::{IngestOutcome, Ledger};
pub use sync::{SyncBatch, SyncRequest};

use crate::types::PeerId;

/// Integrity and lifecycle violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("entry {entry_id}: hash does not match contents")]
    HashMismatch { entry_id: String },

    #[error("nonce {nonce} already used")]
    ReplayedNonce { nonce: u64 },

    #[error("entry {entry_id}: invalid signature from {signer}")]
    InvalidSignature { entry_id: String, signer: PeerId },

    #[error("sender {sender}: expected sequence {expected}, got {found}")]
    SequenceGap { sender: PeerId, expected: u64, found: u64 },

    #[error("entry {entry_id}: previous hash does not match chain head")]
    BrokenLink { entry_id: String },

    #[error("sender {sender}: entry {sequence} is still pending")]
    PendingHead { sender: PeerId, sequence: u64 },

    #[error("unknown entry {entry_id}")]
    UnknownEntry { entry_id: String },

    #[error("entry {entry_id}: cannot move from {from} to {to}")]
    InvalidTransition {
        entry_id: String,
        from: EntryStatus,
        to: EntryStatus,
    },

    #[error("no verifying key for {peer}")]
    UnknownKey { peer: PeerId },

    #[error("key does not belong to {expected}")]
    KeyMismatch { expected: PeerId },

    #[error("ledger serialization error: {0}")]
    Serialization(String),
}
