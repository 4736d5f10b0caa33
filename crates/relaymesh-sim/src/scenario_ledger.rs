/// Ledger scenario — payments across a line of keyed nodes. Each entry is
/// countersigned by the far end, comes back accepted, and picks up the
/// relays as witnesses. A tampered copy must be refused.
use std::time::{Duration, Instant};

use relaymesh_protocol::{EntryStatus, Ledger, LedgerError, MemoryNetwork, MeshConfig, MeshEvent, PeerId};

use crate::scenario_common::{
    build_nodes, check, start_nodes, stop_nodes, timed_step_async, Identity, ScenarioResult,
};

pub struct LedgerConfig {
    pub hops: usize,
    pub payments: u32,
}

pub async fn run(config: LedgerConfig) -> anyhow::Result<ScenarioResult> {
    let mut result = ScenarioResult::new("ledger");
    let start = Instant::now();
    let count = config.hops.clamp(1, 6) + 1;

    // ── payer - relay ... relay - payee ─────────────────────────────
    let net = MemoryNetwork::new();
    let mesh_config = MeshConfig::default().default_ttl(count as u32 + 1);
    let registered = build_nodes(&net, count, &mesh_config, Identity::Keyed);
    let ids: Vec<PeerId> = registered.iter().map(|(n, _)| n.id()).collect();
    for pair in ids.windows(2) {
        net.link(&pair[0], &pair[1]);
    }
    let mut nodes = start_nodes(registered).await;
    let (payer, payee) = (0, count - 1);

    let step = timed_step_async("payments accepted", || async {
        let mut accepted = 0;
        for i in 0..config.payments {
            let entry = nodes[payer]
                .node
                .pay(&ids[payee], u64::from(i) + 1, "mesh")
                .await
                .map_err(|e| format!("payment {i} failed: {e}"))?;
            let wanted = entry.entry_id.clone();
            nodes[payer]
                .wait_for(Duration::from_secs(3), |e| {
                    matches!(
                        e,
                        MeshEvent::LedgerEntryStored { entry_id, status: EntryStatus::Accepted, .. }
                            if *entry_id == wanted
                    )
                })
                .await
                .map_err(|e| format!("payment {i} never accepted: {e}"))?;
            accepted += 1;
        }
        check(
            accepted == config.payments,
            format!("{accepted}/{} accepted", config.payments),
        )
    })
    .await;
    result.add(step);

    let step = timed_step_async("chains agree", || async {
        let ours = nodes[payer].node.ledger().entries_for(&ids[payer]);
        let theirs = nodes[payee].node.ledger().entries_for(&ids[payer]);
        let same = ours.len() == theirs.len()
            && ours.iter().zip(&theirs).all(|(a, b)| a.entry_hash == b.entry_hash);
        let linked = ours
            .windows(2)
            .all(|w| w[1].previous_entry_hash.as_deref() == Some(w[0].entry_hash.as_str()));
        check(same && linked, format!("{} entries on both ends", ours.len()))
    })
    .await;
    result.add(step);

    let step = timed_step_async("witnesses recorded", || async {
        let relays = count.saturating_sub(2);
        let ledger = nodes[payee].node.ledger();
        let witnessed = ledger
            .entries_for(&ids[payer])
            .iter()
            .filter(|e| e.propagation_witnesses.len() >= relays)
            .count();
        let durable = ledger
            .entries_for(&ids[payer])
            .iter()
            .filter(|e| ledger.is_durable(&e.entry_id))
            .count();
        check(
            witnessed == config.payments as usize,
            format!("{witnessed} entries carried by all {relays} relays, {durable} durable"),
        )
    })
    .await;
    result.add(step);

    let step = timed_step_async("tampered copy refused", || async {
        let Some(mut forged) = nodes[payer].node.ledger().head(&ids[payer]) else {
            return Err("no entries".to_string());
        };
        forged.amount += 1_000;
        let fresh = Ledger::new(mesh_config.witness_threshold);
        let sender_pk = ids[payer].verifying_key().ok_or("payer id is not a key")?;
        let receiver_pk = ids[payee].verifying_key();
        match fresh.ingest(forged, &sender_pk, receiver_pk.as_ref()) {
            Err(LedgerError::HashMismatch { .. }) => Ok("hash mismatch".into()),
            other => Err(format!("expected hash mismatch, got {other:?}")),
        }
    })
    .await;
    result.add(step);

    stop_nodes(&nodes).await;
    result.finalize(start);
    Ok(result)
}
