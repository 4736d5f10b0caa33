/// Loop scenario — flood over a ring with random chords and confirm every
/// node forwards a message at most once and TTL bounds its reach.
///
/// Self-contained: spawns `nodes` in-process nodes on a memory network.
use std::time::Instant;

use rand::Rng;
use relaymesh_protocol::{DropReason, MemoryNetwork, MeshConfig, MeshEvent, PeerId, QosClass};

use crate::scenario_common::{
    build_nodes, check, settle, start_nodes, stop_nodes, timed_step_async, Identity, ScenarioResult,
};

pub struct LoopConfig {
    pub nodes: usize,
    pub chords: usize,
    pub ttl: u32,
}

pub async fn run(config: LoopConfig) -> anyhow::Result<ScenarioResult> {
    let mut result = ScenarioResult::new("loop");
    let start = Instant::now();
    let count = config.nodes.max(4);

    // ── Ring plus random chords ─────────────────────────────────────
    let net = MemoryNetwork::new();
    let registered = build_nodes(&net, count, &MeshConfig::default(), Identity::Named);
    let ids: Vec<PeerId> = registered.iter().map(|(n, _)| n.id()).collect();
    for i in 0..count {
        net.link(&ids[i], &ids[(i + 1) % count]);
    }
    let mut rng = rand::rng();
    let mut chords = 0;
    while chords < config.chords {
        let a = rng.random_range(0..count);
        let b = rng.random_range(0..count);
        if a != b && !net.is_linked(&ids[a], &ids[b]) {
            net.link(&ids[a], &ids[b]);
            chords += 1;
        }
    }
    let mut nodes = start_nodes(registered).await;
    tracing::info!(nodes = count, chords, "mesh built");

    // ── Flood to nobody ─────────────────────────────────────────────
    let step = timed_step_async("flood dies out", || async {
        nodes[0]
            .node
            .flood(&PeerId::from("nobody"), b"echo?".to_vec(), QosClass::Bulk, config.ttl)
            .map_err(|e| format!("flood failed: {e}"))?;
        settle(300).await;
        let worst = nodes[1..]
            .iter()
            .map(|n| n.node.stats().snapshot().relayed)
            .max()
            .unwrap_or(0);
        let duplicates: u64 = nodes.iter().map(|n| n.node.stats().snapshot().duplicates).sum();
        check(
            worst <= 1 && nodes[0].node.stats().snapshot().relayed == 0,
            format!("max relays per node {worst}, {duplicates} duplicates suppressed"),
        )
    })
    .await;
    result.add(step);

    // ── Flood to the far side ───────────────────────────────────────
    let target = ids[count / 2].clone();
    let step = timed_step_async("single delivery", || async {
        nodes[0]
            .node
            .flood(&target, b"across".to_vec(), QosClass::Sync, config.ttl)
            .map_err(|e| format!("flood failed: {e}"))?;
        settle(300).await;
        let far = &mut nodes[count / 2];
        let deliveries = far
            .drain()
            .iter()
            .filter(|e| matches!(e, MeshEvent::Delivered { payload, .. } if payload == b"across"))
            .count();
        check(deliveries == 1, format!("{deliveries} deliveries at {target}"))
    })
    .await;
    result.add(step);

    // ── TTL 1 never leaves the first hop ────────────────────────────
    let step = timed_step_async("ttl 1 stops at neighbors", || async {
        for n in nodes.iter_mut() {
            n.drain();
        }
        nodes[0]
            .node
            .flood(&target, b"short".to_vec(), QosClass::Sync, 1)
            .map_err(|e| format!("flood failed: {e}"))?;
        settle(300).await;
        let mut exhausted = 0;
        let mut delivered_far = false;
        for (i, n) in nodes.iter_mut().enumerate() {
            for event in n.drain() {
                match event {
                    MeshEvent::MessageDropped { reason: DropReason::TtlExhausted, .. } => exhausted += 1,
                    MeshEvent::Delivered { payload, .. } if payload == b"short" && i == count / 2 => {
                        // Only legal when the target is a direct neighbor.
                        delivered_far = !net.is_linked(&ids[0], &ids[i]);
                    }
                    _ => {}
                }
            }
        }
        check(
            !delivered_far && exhausted > 0,
            format!("{exhausted} nodes dropped on ttl"),
        )
    })
    .await;
    result.add(step);

    stop_nodes(&nodes).await;
    result.finalize(start);
    Ok(result)
}
