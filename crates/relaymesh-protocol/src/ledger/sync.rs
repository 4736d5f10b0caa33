/// Chain backfill: a node that sees a sender's entry ahead of its cursor
/// asks the sender for the missing run and ingests it in order.
use serde::{Deserialize, Serialize};

use super::entry::LedgerEntry;
use super::LedgerError;
use crate::types::PeerId;

/// Ask `sender` for its chain from `from_sequence` on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub sender: PeerId,
    pub from_sequence: u64,
}

/// Consecutive entries of one sender's chain, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncBatch {
    pub sender: PeerId,
    pub entries: Vec<LedgerEntry>,
}

impl SyncRequest {
    pub fn to_bytes(&self) -> Result<Vec<u8>, LedgerError> {
        rmp_serde::to_vec(self).map_err(|e| LedgerError::Serialization(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, LedgerError> {
        rmp_serde::from_slice(data).map_err(|e| LedgerError::Serialization(e.to_string()))
    }
}

impl SyncBatch {
    /// The part of `chain` a request asks for.
    pub fn answer(request: &SyncRequest, chain: Vec<LedgerEntry>) -> Self {
        let entries = chain
            .into_iter()
            .filter(|e| e.sender_id == request.sender && e.sequence_number >= request.from_sequence)
            .collect();
        Self {
            sender: request.sender.clone(),
            entries,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, LedgerError> {
        rmp_serde::to_vec(self).map_err(|e| LedgerError::Serialization(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, LedgerError> {
        rmp_serde::from_slice(data).map_err(|e| LedgerError::Serialization(e.to_string()))
    }
}
