/// Multi-path scenario — `paths` disjoint relays between a source and a
/// sink. The sink must deliver each send exactly once; a forging relay must
/// drop out of route selection.
use std::time::{Duration, Instant};

use relaymesh_protocol::{
    BehaviorEvent, BehaviorMetric, DropReason, MemoryNetwork, MeshConfig, MeshEvent, PeerId,
    QosClass,
};

use crate::scenario_common::{
    build_nodes, check, settle, start_nodes, stop_nodes, timed_step_async, Identity, ScenarioResult,
};

pub struct MultipathConfig {
    pub paths: usize,
    pub sends: u32,
}

pub async fn run(config: MultipathConfig) -> anyhow::Result<ScenarioResult> {
    let mut result = ScenarioResult::new("multipath");
    let start = Instant::now();
    let paths = config.paths.clamp(2, 8);

    // ── source → relay_i → sink for every i ─────────────────────────
    let net = MemoryNetwork::new();
    let mesh_config = MeshConfig::default().max_paths(paths);
    let registered = build_nodes(&net, paths + 2, &mesh_config, Identity::Named);
    let ids: Vec<PeerId> = registered.iter().map(|(n, _)| n.id()).collect();
    let (source, sink) = (0, paths + 1);
    for relay in 1..=paths {
        net.link(&ids[source], &ids[relay]);
        net.link(&ids[relay], &ids[sink]);
    }
    let mut nodes = start_nodes(registered).await;

    let step = timed_step_async("learn routes", || async {
        nodes[sink]
            .node
            .flood(&ids[source], b"beacon".to_vec(), QosClass::Sync, 3)
            .map_err(|e| format!("beacon failed: {e}"))?;
        settle(300).await;
        let known = nodes[source].node.router().candidates(&ids[sink]).len();
        check(known == paths, format!("{known} routes to sink"))
    })
    .await;
    result.add(step);

    let step = timed_step_async("deliver once per send", || async {
        nodes[sink].drain();
        let mut sent_paths = 0;
        for i in 0..config.sends {
            let report = nodes[source]
                .node
                .send(&ids[sink], format!("m{i}").into_bytes(), QosClass::RealTime)
                .await
                .map_err(|e| format!("send {i} failed: {e}"))?;
            sent_paths += report.sent_paths();
        }
        settle(300).await;
        let events = nodes[sink].drain();
        let delivered = events
            .iter()
            .filter(|e| matches!(e, MeshEvent::Delivered { .. }))
            .count();
        let suppressed = events
            .iter()
            .filter(|e| matches!(e, MeshEvent::MessageDropped { reason: DropReason::DuplicatePath, .. }))
            .count();
        check(
            delivered == config.sends as usize,
            format!("{delivered} delivered, {suppressed} extra copies suppressed, {sent_paths} path sends"),
        )
    })
    .await;
    result.add(step);

    // ── A relay gets caught forging ─────────────────────────────────
    let forger = ids[1].clone();
    let step = timed_step_async("forger excluded", || async {
        let reputation = nodes[source].node.reputation();
        let mut reports = 0;
        while !reputation.is_blacklisted(&forger, mesh_config.blacklist_threshold) && reports < 10 {
            reputation.record_event(BehaviorEvent::new(forger.clone(), BehaviorMetric::ForgeryAttempt));
            reports += 1;
        }
        let selected = nodes[source].node.router().select(&ids[sink], paths);
        let avoided = selected.iter().all(|s| !s.route.contains(&forger));
        check(
            avoided && selected.len() == paths - 1,
            format!(
                "score {:.3} after {reports} reports, {} routes left",
                reputation.score_or_neutral(&forger),
                selected.len()
            ),
        )
    })
    .await;
    result.add(step);

    let step = timed_step_async("send avoids forger", || async {
        let report = nodes[source]
            .node
            .send(&ids[sink], b"after".to_vec(), QosClass::Critical)
            .await
            .map_err(|e| format!("send failed: {e}"))?;
        let via_forger = report.paths.iter().any(|p| p.route.first_hop() == &forger);
        nodes[sink]
            .wait_for(Duration::from_secs(2), |e| {
                matches!(e, MeshEvent::Delivered { payload, .. } if payload == b"after")
            })
            .await?;
        check(!via_forger, format!("{} paths used", report.paths.len()))
    })
    .await;
    result.add(step);

    stop_nodes(&nodes).await;
    result.finalize(start);
    Ok(result)
}
