/// Ledger state: per-sender chains, verifier cursors and the nonce set.
///
/// One lock guards everything; sequence assignment, linking and storage
/// of an appended entry happen in a single critical section.
use std::collections::{BTreeMap, HashMap, HashSet};

use ed25519_dalek::{SigningKey, VerifyingKey};
use parking_lot::Mutex;

use super::entry::{EntryStatus, LedgerEntry, Transaction};
use super::lamport::LamportTimestamp;
use super::LedgerError;
use crate::types::{now_ms, PeerId};

/// Last verified link of a sender's chain.
#[derive(Debug, Clone)]
struct Cursor {
    sequence: u64,
    hash: String,
}

#[derive(Default)]
struct LedgerState {
    chains: HashMap<PeerId, BTreeMap<u64, LedgerEntry>>,
    locations: HashMap<String, (PeerId, u64)>,
    cursors: HashMap<PeerId, Cursor>,
    nonces: HashSet<u64>,
}

/// What `ingest` did with an entry.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// New entry, verified and appended to its sender's chain.
    Stored(LedgerEntry),
    /// Known entry moved forward (e.g. pending → accepted).
    Upgraded(LedgerEntry),
}

impl IngestOutcome {
    pub fn entry(&self) -> &LedgerEntry {
        match self {
            IngestOutcome::Stored(e) | IngestOutcome::Upgraded(e) => e,
        }
    }
}

pub struct Ledger {
    state: Mutex<LedgerState>,
    witness_threshold: usize,
}

impl Ledger {
    pub fn new(witness_threshold: usize) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            witness_threshold: witness_threshold.max(1),
        }
    }

    /// Create, sign and store the next entry of the sender's chain.
    ///
    /// With a receiver key the entry is countersigned and `accepted`
    /// immediately; otherwise it is `pending` and the sender cannot append
    /// again until it is accepted or rejected.
    pub fn append(
        &self,
        transaction: Transaction,
        lamport: LamportTimestamp,
        sender_key: &SigningKey,
        receiver_key: Option<&SigningKey>,
    ) -> Result<LedgerEntry, LedgerError> {
        let sender = PeerId::from_verifying_key(&sender_key.verifying_key());
        if transaction.sender_id != sender {
            return Err(LedgerError::KeyMismatch {
                expected: transaction.sender_id,
            });
        }
        if let Some(key) = receiver_key {
            if PeerId::from_verifying_key(&key.verifying_key()) != transaction.receiver_id {
                return Err(LedgerError::KeyMismatch {
                    expected: transaction.receiver_id,
                });
            }
        }

        let mut st = self.state.lock();
        let cursor = st.cursors.get(&sender).cloned();
        if let Some(c) = &cursor {
            if st
                .entry(&sender, c.sequence)
                .is_some_and(|head| head.status == EntryStatus::Pending)
            {
                return Err(LedgerError::PendingHead {
                    sender,
                    sequence: c.sequence,
                });
            }
        }

        let nonce = loop {
            let candidate: u64 = rand::random();
            if !st.nonces.contains(&candidate) {
                break candidate;
            }
        };
        let mut entry = LedgerEntry {
            entry_id: uuid::Uuid::new_v4().to_string(),
            sequence_number: cursor.as_ref().map_or(1, |c| c.sequence + 1),
            transaction_id: transaction.transaction_id,
            sender_id: transaction.sender_id,
            receiver_id: transaction.receiver_id,
            amount: transaction.amount,
            coin_type_id: transaction.coin_type_id,
            lamport_timestamp: lamport,
            wall_clock_time: now_ms(),
            sender_signature: Vec::new(),
            receiver_signature: None,
            previous_entry_hash: cursor.map(|c| c.hash),
            entry_hash: String::new(),
            propagation_witnesses: Vec::new(),
            nonce,
            status: EntryStatus::Pending,
        };
        entry.sign_as_sender(sender_key)?;
        if let Some(key) = receiver_key {
            entry.sign_as_receiver(key)?;
            entry.status = EntryStatus::Accepted;
        }
        entry.seal()?;

        st.advance(&entry);
        st.store(entry.clone());
        tracing::debug!(
            sender = %entry.sender_id,
            seq = entry.sequence_number,
            status = %entry.status,
            "ledger entry appended"
        );
        Ok(entry)
    }

    /// Check an entry against the sender's chain and, on success, advance
    /// the verifier cursor past it.
    ///
    /// Order: hash, nonce, signatures, sequence and link.
    pub fn verify(
        &self,
        entry: &LedgerEntry,
        sender_pk: &VerifyingKey,
        receiver_pk: Option<&VerifyingKey>,
    ) -> Result<(), LedgerError> {
        let mut st = self.state.lock();
        st.check(entry, sender_pk, receiver_pk)?;
        st.advance(entry);
        Ok(())
    }

    /// Verify and store an entry received from the mesh, or move a stored
    /// one forward.
    pub fn ingest(
        &self,
        entry: LedgerEntry,
        sender_pk: &VerifyingKey,
        receiver_pk: Option<&VerifyingKey>,
    ) -> Result<IngestOutcome, LedgerError> {
        let mut st = self.state.lock();
        if st.locations.contains_key(&entry.entry_id) {
            return st.upgrade(entry, sender_pk, receiver_pk);
        }

        if let Err(err) = st.check(&entry, sender_pk, receiver_pk) {
            // Two different entries, both signed by the sender, claiming the
            // same slot: the stored one can no longer be trusted. Anything
            // unsigned is just dropped.
            let signed_fork = entry.hash_matches() && sender_signed(&entry, sender_pk).is_ok();
            if let Some(existing) = st.entry(&entry.sender_id, entry.sequence_number).filter(|_| signed_fork) {
                if existing.entry_id != entry.entry_id && existing.status == EntryStatus::Pending {
                    let (sender, seq) = (existing.sender_id.clone(), existing.sequence_number);
                    tracing::warn!(%sender, seq, "conflicting entries for one sequence number");
                    st.restamp(&sender, seq, EntryStatus::Conflicted)?;
                }
            }
            tracing::warn!(entry = %entry.entry_id, "ledger entry rejected: {err}");
            return Err(err);
        }
        st.advance(&entry);
        st.store(entry.clone());
        Ok(IngestOutcome::Stored(entry))
    }

    /// Countersign a stored pending entry as its receiver.
    pub fn accept(&self, entry: &LedgerEntry, receiver_key: &SigningKey) -> Result<LedgerEntry, LedgerError> {
        if PeerId::from_verifying_key(&receiver_key.verifying_key()) != entry.receiver_id {
            return Err(LedgerError::KeyMismatch {
                expected: entry.receiver_id.clone(),
            });
        }
        let mut st = self.state.lock();
        let (sender, seq) = st.locate(&entry.entry_id)?;
        let stored = st.entry_mut(&sender, seq).ok_or_else(|| LedgerError::UnknownEntry {
            entry_id: entry.entry_id.clone(),
        })?;
        if !stored.status.can_become(EntryStatus::Accepted) {
            return Err(LedgerError::InvalidTransition {
                entry_id: stored.entry_id.clone(),
                from: stored.status,
                to: EntryStatus::Accepted,
            });
        }
        stored.sign_as_receiver(receiver_key)?;
        stored.status = EntryStatus::Accepted;
        stored.seal()?;
        let accepted = stored.clone();
        st.relink(&sender, seq, &accepted.entry_hash);
        tracing::debug!(entry = %accepted.entry_id, "ledger entry accepted");
        Ok(accepted)
    }

    /// Mark a stored pending entry rejected.
    pub fn reject(&self, entry_id: &str) -> Result<LedgerEntry, LedgerError> {
        let mut st = self.state.lock();
        let (sender, seq) = st.locate(entry_id)?;
        st.restamp(&sender, seq, EntryStatus::Rejected)
    }

    /// Record that `witness` carried the entry. Parties and repeats are
    /// ignored; returns whether the witness set grew.
    pub fn record_witness(&self, entry_id: &str, witness: &PeerId) -> Result<bool, LedgerError> {
        let mut st = self.state.lock();
        let (sender, seq) = st.locate(entry_id)?;
        let Some(entry) = st.entry_mut(&sender, seq) else {
            return Err(LedgerError::UnknownEntry {
                entry_id: entry_id.to_string(),
            });
        };
        if entry.is_party(witness) || entry.propagation_witnesses.contains(witness) {
            return Ok(false);
        }
        entry.propagation_witnesses.push(witness.clone());
        Ok(true)
    }

    /// Enough distinct third-party witnesses have seen the entry.
    pub fn is_durable(&self, entry_id: &str) -> bool {
        self.get(entry_id)
            .is_some_and(|e| e.propagation_witnesses.len() >= self.witness_threshold)
    }

    pub fn get(&self, entry_id: &str) -> Option<LedgerEntry> {
        let st = self.state.lock();
        let (sender, seq) = st.locations.get(entry_id)?;
        st.entry(sender, *seq).cloned()
    }

    /// The sender's chain in sequence order.
    pub fn entries_for(&self, sender: &PeerId) -> Vec<LedgerEntry> {
        self.state
            .lock()
            .chains
            .get(sender)
            .map(|chain| chain.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Latest stored entry of the sender's chain.
    pub fn head(&self, sender: &PeerId) -> Option<LedgerEntry> {
        self.state
            .lock()
            .chains
            .get(sender)
            .and_then(|chain| chain.values().next_back().cloned())
    }

    pub fn len(&self) -> usize {
        self.state.lock().locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn witness_threshold(&self) -> usize {
        self.witness_threshold
    }
}

impl LedgerState {
    fn entry(&self, sender: &PeerId, seq: u64) -> Option<&LedgerEntry> {
        self.chains.get(sender)?.get(&seq)
    }

    fn entry_mut(&mut self, sender: &PeerId, seq: u64) -> Option<&mut LedgerEntry> {
        self.chains.get_mut(sender)?.get_mut(&seq)
    }

    fn locate(&self, entry_id: &str) -> Result<(PeerId, u64), LedgerError> {
        self.locations
            .get(entry_id)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownEntry {
                entry_id: entry_id.to_string(),
            })
    }

    fn check(
        &self,
        entry: &LedgerEntry,
        sender_pk: &VerifyingKey,
        receiver_pk: Option<&VerifyingKey>,
    ) -> Result<(), LedgerError> {
        if !entry.hash_matches() {
            return Err(LedgerError::HashMismatch {
                entry_id: entry.entry_id.clone(),
            });
        }
        if self.nonces.contains(&entry.nonce) {
            return Err(LedgerError::ReplayedNonce { nonce: entry.nonce });
        }
        check_signatures(entry, sender_pk, receiver_pk)?;

        let cursor = self.cursors.get(&entry.sender_id);
        let expected = cursor.map_or(1, |c| c.sequence + 1);
        if entry.sequence_number != expected {
            return Err(LedgerError::SequenceGap {
                sender: entry.sender_id.clone(),
                expected,
                found: entry.sequence_number,
            });
        }
        if entry.previous_entry_hash.as_deref() != cursor.map(|c| c.hash.as_str()) {
            return Err(LedgerError::BrokenLink {
                entry_id: entry.entry_id.clone(),
            });
        }
        Ok(())
    }

    fn advance(&mut self, entry: &LedgerEntry) {
        self.nonces.insert(entry.nonce);
        self.cursors.insert(
            entry.sender_id.clone(),
            Cursor {
                sequence: entry.sequence_number,
                hash: entry.entry_hash.clone(),
            },
        );
    }

    fn store(&mut self, entry: LedgerEntry) {
        self.locations.insert(
            entry.entry_id.clone(),
            (entry.sender_id.clone(), entry.sequence_number),
        );
        self.chains
            .entry(entry.sender_id.clone())
            .or_default()
            .insert(entry.sequence_number, entry);
    }

    /// Keep the cursor on the current hash of an entry that was re-sealed.
    fn relink(&mut self, sender: &PeerId, seq: u64, hash: &str) {
        if let Some(cursor) = self.cursors.get_mut(sender) {
            if cursor.sequence == seq {
                cursor.hash = hash.to_string();
            }
        }
    }

    fn restamp(&mut self, sender: &PeerId, seq: u64, to: EntryStatus) -> Result<LedgerEntry, LedgerError> {
        let Some(entry) = self.entry_mut(sender, seq) else {
            return Err(LedgerError::UnknownEntry {
                entry_id: format!("{sender}#{seq}"),
            });
        };
        if !entry.status.can_become(to) {
            return Err(LedgerError::InvalidTransition {
                entry_id: entry.entry_id.clone(),
                from: entry.status,
                to,
            });
        }
        entry.status = to;
        entry.seal()?;
        let updated = entry.clone();
        self.relink(sender, seq, &updated.entry_hash);
        Ok(updated)
    }

    /// A stored pending entry came back countersigned.
    ///
    /// Only `Pending → Accepted` is taken from the network: it is the one
    /// transition a signature vouches for. `Rejected` and `Conflicted` are
    /// local verdicts.
    fn upgrade(
        &mut self,
        incoming: LedgerEntry,
        sender_pk: &VerifyingKey,
        receiver_pk: Option<&VerifyingKey>,
    ) -> Result<IngestOutcome, LedgerError> {
        let (sender, seq) = self.locate(&incoming.entry_id)?;
        let Some(stored) = self.entry(&sender, seq) else {
            return Err(LedgerError::UnknownEntry {
                entry_id: incoming.entry_id,
            });
        };
        if stored.entry_hash == incoming.entry_hash {
            return Err(LedgerError::ReplayedNonce {
                nonce: incoming.nonce,
            });
        }
        if !incoming.hash_matches() || incoming.canonical_bytes()? != stored.canonical_bytes()? {
            return Err(LedgerError::HashMismatch {
                entry_id: incoming.entry_id,
            });
        }
        if incoming.status != EntryStatus::Accepted || !stored.status.can_become(incoming.status) {
            return Err(LedgerError::InvalidTransition {
                entry_id: incoming.entry_id,
                from: stored.status,
                to: incoming.status,
            });
        }
        // Accepted status: the receiver signature must verify.
        check_signatures(&incoming, sender_pk, receiver_pk)?;

        let Some(stored) = self.entry_mut(&sender, seq) else {
            return Err(LedgerError::UnknownEntry {
                entry_id: incoming.entry_id,
            });
        };
        stored.receiver_signature = incoming.receiver_signature;
        stored.status = incoming.status;
        stored.entry_hash = incoming.entry_hash;
        for witness in incoming.propagation_witnesses {
            if !stored.is_party(&witness) && !stored.propagation_witnesses.contains(&witness) {
                stored.propagation_witnesses.push(witness);
            }
        }
        let updated = stored.clone();
        self.relink(&sender, seq, &updated.entry_hash);
        tracing::debug!(entry = %updated.entry_id, status = %updated.status, "ledger entry upgraded");
        Ok(IngestOutcome::Upgraded(updated))
    }
}

fn sender_signed(entry: &LedgerEntry, sender_pk: &VerifyingKey) -> Result<(), LedgerError> {
    if let Some(key) = entry.sender_id.verifying_key() {
        if &key != sender_pk {
            return Err(LedgerError::KeyMismatch {
                expected: entry.sender_id.clone(),
            });
        }
    }
    entry.verify_sender(sender_pk)
}

fn check_signatures(
    entry: &LedgerEntry,
    sender_pk: &VerifyingKey,
    receiver_pk: Option<&VerifyingKey>,
) -> Result<(), LedgerError> {
    sender_signed(entry, sender_pk)?;
    if entry.receiver_signature.is_some() || entry.status == EntryStatus::Accepted {
        let key = receiver_pk.ok_or_else(|| LedgerError::UnknownKey {
            peer: entry.receiver_id.clone(),
        })?;
        entry.verify_receiver(key)?;
    }
    Ok(())
}
