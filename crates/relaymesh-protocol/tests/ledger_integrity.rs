/// Ledger tamper, replay and ordering checks, plus a pay/accept round
/// trip across a three-node mesh.
mod common;

use ed25519_dalek::SigningKey;
use relaymesh_protocol::{
    EntryStatus, IngestOutcome, LamportClock, Ledger, LedgerEntry, LedgerError, MemoryNetwork,
    MeshConfig, MeshEvent, PeerId, Transaction,
};

struct Party {
    key: SigningKey,
    id: PeerId,
}

fn party(seed: u8) -> Party {
    let key = SigningKey::from_bytes(&[seed; 32]);
    let id = PeerId::from_verifying_key(&key.verifying_key());
    Party { key, id }
}

fn accepted_entry(ledger: &Ledger, clock: &mut LamportClock, a: &Party, b: &Party, amount: u64) -> LedgerEntry {
    ledger
        .append(
            Transaction::new(a.id.clone(), b.id.clone(), amount, "mesh"),
            clock.tick(),
            &a.key,
            Some(&b.key),
        )
        .unwrap()
}

#[test]
fn any_single_field_mutation_breaks_the_hash() {
    let (a, b) = (party(1), party(2));
    let origin = Ledger::new(3);
    let mut clock = LamportClock::new(a.id.clone());
    let entry = accepted_entry(&origin, &mut clock, &a, &b, 50);

    let mutations: [(&str, fn(&mut LedgerEntry)); 10] = [
        ("amount", |e: &mut LedgerEntry| e.amount += 1),
        ("coin", |e: &mut LedgerEntry| e.coin_type_id.push('x')),
        ("receiver", |e: &mut LedgerEntry| e.receiver_id = "mallory".into()),
        ("sequence", |e: &mut LedgerEntry| e.sequence_number += 1),
        ("lamport", |e: &mut LedgerEntry| e.lamport_timestamp.counter += 1),
        ("wall clock", |e: &mut LedgerEntry| e.wall_clock_time += 1),
        ("nonce", |e: &mut LedgerEntry| e.nonce ^= 1),
        ("previous", |e: &mut LedgerEntry| e.previous_entry_hash = Some("00".repeat(32))),
        ("status", |e: &mut LedgerEntry| e.status = EntryStatus::Rejected),
        ("signature", |e: &mut LedgerEntry| e.sender_signature[0] ^= 0xff),
    ];

    for (field, mutate) in mutations {
        let remote = Ledger::new(3);
        let mut tampered = entry.clone();
        mutate(&mut tampered);
        let err = remote
            .ingest(tampered, &a.key.verifying_key(), Some(&b.key.verifying_key()))
            .unwrap_err();
        assert!(
            matches!(err, LedgerError::HashMismatch { .. }),
            "{field}: expected hash mismatch, got {err:?}"
        );
    }
}

#[test]
fn rehashed_mutation_fails_signature_check() {
    let (a, b) = (party(1), party(2));
    let origin = Ledger::new(3);
    let remote = Ledger::new(3);
    let entry = accepted_entry(&origin, &mut LamportClock::new(a.id.clone()), &a, &b, 50);

    let mut forged = entry;
    forged.amount = 5_000;
    forged.seal().unwrap();
    let err = remote
        .ingest(forged, &a.key.verifying_key(), Some(&b.key.verifying_key()))
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidSignature { .. }));
    assert!(remote.is_empty());
}

#[test]
fn replayed_nonce_is_rejected() {
    let (a, b) = (party(1), party(2));
    let origin = Ledger::new(3);
    let remote = Ledger::new(3);
    let mut clock = LamportClock::new(a.id.clone());
    let pk_a = a.key.verifying_key();
    let pk_b = b.key.verifying_key();

    let first = accepted_entry(&origin, &mut clock, &a, &b, 1);
    remote.ingest(first.clone(), &pk_a, Some(&pk_b)).unwrap();

    // The same entry again.
    assert!(matches!(
        remote.ingest(first.clone(), &pk_a, Some(&pk_b)),
        Err(LedgerError::ReplayedNonce { .. })
    ));

    // A fresh, properly signed entry that reuses the nonce.
    let mut second = accepted_entry(&origin, &mut clock, &a, &b, 2);
    second.nonce = first.nonce;
    second.sign_as_sender(&a.key).unwrap();
    second.sign_as_receiver(&b.key).unwrap();
    second.seal().unwrap();
    assert!(matches!(
        remote.ingest(second, &pk_a, Some(&pk_b)),
        Err(LedgerError::ReplayedNonce { nonce }) if nonce == first.nonce
    ));
}

#[test]
fn verify_advances_only_on_success() {
    let (a, b) = (party(1), party(2));
    let origin = Ledger::new(3);
    let verifier = Ledger::new(3);
    let mut clock = LamportClock::new(a.id.clone());
    let pk_a = a.key.verifying_key();
    let pk_b = b.key.verifying_key();

    let e1 = accepted_entry(&origin, &mut clock, &a, &b, 1);
    let e2 = accepted_entry(&origin, &mut clock, &a, &b, 2);
    let e3 = accepted_entry(&origin, &mut clock, &a, &b, 3);

    verifier.verify(&e1, &pk_a, Some(&pk_b)).unwrap();
    assert!(matches!(
        verifier.verify(&e3, &pk_a, Some(&pk_b)),
        Err(LedgerError::SequenceGap { expected: 2, found: 3, .. })
    ));
    verifier.verify(&e2, &pk_a, Some(&pk_b)).unwrap();
    verifier.verify(&e3, &pk_a, Some(&pk_b)).unwrap();
}

#[test]
fn tampered_entry_fails_with_every_later_entry() {
    const LEN: usize = 6;
    const TAMPERED: usize = 3;
    let (a, b) = (party(1), party(2));
    let origin = Ledger::new(3);
    let mut clock = LamportClock::new(a.id.clone());
    let pk_a = a.key.verifying_key();
    let pk_b = b.key.verifying_key();
    let chain: Vec<LedgerEntry> = (1..=LEN as u64)
        .map(|amount| accepted_entry(&origin, &mut clock, &a, &b, amount))
        .collect();

    let tampers: [(&str, fn(&mut LedgerEntry)); 2] = [
        ("amount", |e: &mut LedgerEntry| e.amount += 1_000),
        ("amount, rehashed", |e: &mut LedgerEntry| {
            e.amount += 1_000;
            e.seal().unwrap();
        }),
    ];
    for (name, tamper) in tampers {
        let mut chain = chain.clone();
        tamper(&mut chain[TAMPERED - 1]);

        let verifier = Ledger::new(3);
        for (i, entry) in chain.iter().enumerate() {
            let seq = i + 1;
            let result = verifier.verify(entry, &pk_a, Some(&pk_b));
            match seq {
                s if s < TAMPERED => assert!(result.is_ok(), "{name}: entry {seq} refused: {result:?}"),
                TAMPERED => assert!(
                    matches!(result, Err(LedgerError::HashMismatch { .. } | LedgerError::InvalidSignature { .. })),
                    "{name}: tampered entry {seq} gave {result:?}"
                ),
                _ => assert!(
                    matches!(result, Err(LedgerError::SequenceGap { expected, .. }) if expected == TAMPERED as u64),
                    "{name}: entry {seq} past the tamper gave {result:?}"
                ),
            }
        }
    }
}

#[test]
fn broken_link_is_detected() {
    let (a, b) = (party(1), party(2));
    let origin = Ledger::new(3);
    let remote = Ledger::new(3);
    let mut clock = LamportClock::new(a.id.clone());
    let pk_a = a.key.verifying_key();
    let pk_b = b.key.verifying_key();

    let e1 = accepted_entry(&origin, &mut clock, &a, &b, 1);
    let mut e2 = accepted_entry(&origin, &mut clock, &a, &b, 2);
    remote.ingest(e1, &pk_a, Some(&pk_b)).unwrap();

    // Re-signed by the real sender, but pointing at the wrong parent.
    e2.previous_entry_hash = Some("ab".repeat(32));
    e2.sign_as_sender(&a.key).unwrap();
    e2.sign_as_receiver(&b.key).unwrap();
    e2.seal().unwrap();
    assert!(matches!(
        remote.ingest(e2, &pk_a, Some(&pk_b)),
        Err(LedgerError::BrokenLink { .. })
    ));
}

#[test]
fn lamport_timestamps_follow_causality() {
    let (a, b) = (party(1), party(2));
    let ledger_a = Ledger::new(3);
    let ledger_b = Ledger::new(3);
    let mut clock_a = LamportClock::new(a.id.clone());
    let mut clock_b = LamportClock::new(b.id.clone());

    for _ in 0..5 {
        clock_a.tick();
    }
    let from_a = accepted_entry(&ledger_a, &mut clock_a, &a, &b, 1);

    // b learns about a's entry, then pays a back.
    clock_b.observe(&from_a.lamport_timestamp);
    let from_b = accepted_entry(&ledger_b, &mut clock_b, &b, &a, 1);

    assert!(from_b.lamport_timestamp > from_a.lamport_timestamp);
    assert!(from_b.lamport_timestamp.counter > from_a.lamport_timestamp.counter);
}

#[tokio::test]
async fn payment_is_countersigned_across_the_mesh() {
    common::init_tracing();
    let net = MemoryNetwork::new();
    let config = MeshConfig::default();
    let registered = common::keyed_nodes(&net, &[11, 12, 13], &config);
    let ids: Vec<PeerId> = registered.iter().map(|(n, _)| n.id()).collect();
    common::line(&net, &ids);
    let mut n = common::start_all(registered).await;

    let pending = n[0].node.pay(&ids[2], 40, "mesh").await.unwrap();
    assert_eq!(pending.status, EntryStatus::Pending);
    assert_eq!(pending.sequence_number, 1);

    // Receiver stores it, countersigns, and sends it back.
    let stored = n[2]
        .wait_for(|e| matches!(e, MeshEvent::LedgerEntryStored { status: EntryStatus::Accepted, .. }))
        .await;
    assert!(stored.is_some(), "receiver never accepted");

    let upgraded = n[0]
        .wait_for(|e| matches!(e, MeshEvent::LedgerEntryStored { status: EntryStatus::Accepted, .. }))
        .await;
    match upgraded {
        Some(MeshEvent::LedgerEntryStored { entry_id, .. }) => assert_eq!(entry_id, pending.entry_id),
        other => panic!("sender never saw the acceptance: {other:?}"),
    }

    let on_sender = n[0].node.ledger().get(&pending.entry_id).unwrap();
    let on_receiver = n[2].node.ledger().get(&pending.entry_id).unwrap();
    assert_eq!(on_sender.entry_hash, on_receiver.entry_hash);
    assert!(on_sender.hash_matches());
    // The relay carried it both ways.
    assert!(on_receiver.propagation_witnesses.contains(&ids[1]));
    assert!(on_sender.propagation_witnesses.contains(&ids[1]));

    // The chain head is settled, so a second payment links to it.
    let next = n[0].node.pay(&ids[2], 2, "mesh").await.unwrap();
    assert_eq!(next.sequence_number, 2);
    assert_eq!(next.previous_entry_hash.as_deref(), Some(on_sender.entry_hash.as_str()));
}

#[tokio::test]
async fn payer_alternates_between_counterparties() {
    common::init_tracing();
    let net = MemoryNetwork::new();
    let config = MeshConfig::default();
    let registered = common::keyed_nodes(&net, &[51, 52, 53], &config);
    let ids: Vec<PeerId> = registered.iter().map(|(n, _)| n.id()).collect();
    // b - a - c
    net.link(&ids[0], &ids[1]);
    net.link(&ids[0], &ids[2]);
    let mut n = common::start_all(registered).await;

    for (i, to) in [&ids[1], &ids[2], &ids[1]].into_iter().enumerate() {
        let seq = i as u64 + 1;
        let entry = n[0].node.pay(to, seq * 10, "mesh").await.unwrap();
        assert_eq!(entry.sequence_number, seq);
        let wanted = entry.entry_id.clone();
        let accepted = n[0]
            .wait_for(|e| {
                matches!(
                    e,
                    MeshEvent::LedgerEntryStored { entry_id, status: EntryStatus::Accepted, .. }
                        if *entry_id == wanted
                )
            })
            .await;
        assert!(accepted.is_some(), "payment {seq} to {to} never accepted");
    }

    let hashes = |node: &common::TestNode| -> Vec<String> {
        node.node
            .ledger()
            .entries_for(&ids[0])
            .into_iter()
            .map(|e| e.entry_hash)
            .collect()
    };
    let payer = hashes(&n[0]);
    assert_eq!(payer.len(), 3);
    // b was paid last and caught up on the payment to c along the way.
    assert_eq!(hashes(&n[1]), payer);
    assert_eq!(hashes(&n[2]), payer[..2].to_vec());
}

#[test]
fn ingest_reports_upgrade_for_known_entry() {
    let (a, b) = (party(1), party(2));
    let sender_side = Ledger::new(3);
    let receiver_side = Ledger::new(3);
    let pending = sender_side
        .append(
            Transaction::new(a.id.clone(), b.id.clone(), 3, "mesh"),
            LamportClock::new(a.id.clone()).tick(),
            &a.key,
            None,
        )
        .unwrap();
    let outcome = receiver_side
        .ingest(pending.clone(), &a.key.verifying_key(), Some(&b.key.verifying_key()))
        .unwrap();
    assert!(matches!(outcome, IngestOutcome::Stored(_)));
    let accepted = receiver_side.accept(&pending, &b.key).unwrap();
    let outcome = sender_side
        .ingest(accepted, &a.key.verifying_key(), Some(&b.key.verifying_key()))
        .unwrap();
    assert!(matches!(outcome, IngestOutcome::Upgraded(ref e) if e.status == EntryStatus::Accepted));
}
