/// Ledger entry record, canonical bytes, signing and hashing.
use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::lamport::LamportTimestamp;
use super::LedgerError;
use crate::types::PeerId;

/// Lifecycle of an entry. Only moves forward out of `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Accepted,
    Rejected,
    Conflicted,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Accepted => "accepted",
            EntryStatus::Rejected => "rejected",
            EntryStatus::Conflicted => "conflicted",
        }
    }

    /// `Pending → Accepted | Rejected | Conflicted`; nothing else moves.
    pub fn can_become(&self, next: EntryStatus) -> bool {
        *self == EntryStatus::Pending && next != EntryStatus::Pending
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The business content of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: String,
    pub sender_id: PeerId,
    pub receiver_id: PeerId,
    pub amount: u64,
    pub coin_type_id: String,
}

impl Transaction {
    pub fn new(sender_id: PeerId, receiver_id: PeerId, amount: u64, coin_type_id: impl Into<String>) -> Self {
        Self {
            transaction_id: uuid::Uuid::new_v4().to_string(),
            sender_id,
            receiver_id,
            amount,
            coin_type_id: coin_type_id.into(),
        }
    }
}

/// One link of a sender's hash chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: String,
    /// Per-sender, gapless, starting at 1.
    pub sequence_number: u64,
    pub transaction_id: String,
    pub sender_id: PeerId,
    pub receiver_id: PeerId,
    pub amount: u64,
    pub coin_type_id: String,
    pub lamport_timestamp: LamportTimestamp,
    pub wall_clock_time: u64,
    pub sender_signature: Vec<u8>,
    pub receiver_signature: Option<Vec<u8>>,
    /// `entry_hash` of the previous entry from the same sender.
    pub previous_entry_hash: Option<String>,
    /// Hex SHA-256 over canonical bytes, signatures and status.
    pub entry_hash: String,
    /// Peers (other than the two parties) that carried the entry.
    pub propagation_witnesses: Vec<PeerId>,
    pub nonce: u64,
    pub status: EntryStatus,
}

/// Fields covered by signatures, in fixed order.
#[derive(Serialize)]
struct CanonicalEntry<'a> {
    entry_id: &'a str,
    sequence_number: u64,
    transaction_id: &'a str,
    sender_id: &'a PeerId,
    receiver_id: &'a PeerId,
    amount: u64,
    coin_type_id: &'a str,
    lamport_timestamp: &'a LamportTimestamp,
    wall_clock_time: u64,
    previous_entry_hash: Option<&'a str>,
    nonce: u64,
}

impl LedgerEntry {
    /// MessagePack of the signed fields. Excludes signatures, status,
    /// hash and witnesses.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, LedgerError> {
        let canonical = CanonicalEntry {
            entry_id: &self.entry_id,
            sequence_number: self.sequence_number,
            transaction_id: &self.transaction_id,
            sender_id: &self.sender_id,
            receiver_id: &self.receiver_id,
            amount: self.amount,
            coin_type_id: &self.coin_type_id,
            lamport_timestamp: &self.lamport_timestamp,
            wall_clock_time: self.wall_clock_time,
            previous_entry_hash: self.previous_entry_hash.as_deref(),
            nonce: self.nonce,
        };
        rmp_serde::to_vec(&canonical).map_err(|e| LedgerError::Serialization(e.to_string()))
    }

    /// `SHA-256(canonical ‖ sender_sig ‖ receiver_sig ‖ status)`, hex encoded.
    pub fn compute_hash(&self) -> Result<String, LedgerError> {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_bytes()?);
        hasher.update(&self.sender_signature);
        if let Some(sig) = &self.receiver_signature {
            hasher.update(sig);
        }
        hasher.update(self.status.as_str().as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    /// Recompute and store `entry_hash`.
    pub fn seal(&mut self) -> Result<(), LedgerError> {
        self.entry_hash = self.compute_hash()?;
        Ok(())
    }

    pub fn hash_matches(&self) -> bool {
        self.compute_hash().is_ok_and(|h| h == self.entry_hash)
    }

    pub fn sign_as_sender(&mut self, key: &SigningKey) -> Result<(), LedgerError> {
        self.sender_signature = key.sign(&self.canonical_bytes()?).to_bytes().to_vec();
        Ok(())
    }

    pub fn sign_as_receiver(&mut self, key: &SigningKey) -> Result<(), LedgerError> {
        self.receiver_signature = Some(key.sign(&self.canonical_bytes()?).to_bytes().to_vec());
        Ok(())
    }

    pub fn verify_sender(&self, key: &VerifyingKey) -> Result<(), LedgerError> {
        self.check_signature(key, &self.sender_signature, &self.sender_id)
    }

    /// Fails when the receiver signature is missing or invalid.
    pub fn verify_receiver(&self, key: &VerifyingKey) -> Result<(), LedgerError> {
        match &self.receiver_signature {
            Some(sig) => self.check_signature(key, sig, &self.receiver_id),
            None => Err(self.invalid_signature(&self.receiver_id)),
        }
    }

    fn check_signature(&self, key: &VerifyingKey, sig: &[u8], signer: &PeerId) -> Result<(), LedgerError> {
        let bytes: [u8; 64] = sig.try_into().map_err(|_| self.invalid_signature(signer))?;
        let signature = Signature::from_bytes(&bytes);
        key.verify_strict(&self.canonical_bytes()?, &signature)
            .map_err(|_| self.invalid_signature(signer))
    }

    fn invalid_signature(&self, signer: &PeerId) -> LedgerError {
        LedgerError::InvalidSignature {
            entry_id: self.entry_id.clone(),
            signer: signer.clone(),
        }
    }

    /// True when `peer` is the sender or the receiver.
    pub fn is_party(&self, peer: &PeerId) -> bool {
        &self.sender_id == peer || &self.receiver_id == peer
    }

    /// Serialize to MessagePack for gossip.
    pub fn to_bytes(&self) -> Result<Vec<u8>, LedgerError> {
        rmp_serde::to_vec(self).map_err(|e| LedgerError::Serialization(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, LedgerError> {
        rmp_serde::from_slice(data).map_err(|e| LedgerError::Serialization(e.to_string()))
    }
}
