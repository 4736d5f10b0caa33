/// Churn scenario — a hub with many spokes loses a few (soft heal), then
/// many (aggressive heal with discovery).
///
/// Self-contained: the spokes are bare transports; only the hub runs a
/// mesh node, and its health checks are driven by hand.
use std::sync::Arc;
use std::time::Instant;

use relaymesh_protocol::{HealDecision, MemoryNetwork, MeshConfig, MeshNode, PeerId};

use crate::scenario_common::{check, timed_step_async, ScenarioResult};

pub struct ChurnConfig {
    pub spokes: usize,
    pub spares: usize,
}

pub async fn run(config: ChurnConfig) -> anyhow::Result<ScenarioResult> {
    let mut result = ScenarioResult::new("churn");
    let start = Instant::now();
    let spokes = config.spokes.max(6);

    // ── Hub and spokes ──────────────────────────────────────────────
    let net = MemoryNetwork::new();
    let hub_id = PeerId::from("hub");
    let (transport, _hub_inbox) = net.register(hub_id.clone());
    let mut inboxes = Vec::new();
    let spoke_ids: Vec<PeerId> = (0..spokes).map(|i| PeerId::new(format!("s{i:02}"))).collect();
    for id in &spoke_ids {
        inboxes.push(net.register(id.clone()).1);
        net.link(&hub_id, id);
    }
    for i in 0..config.spares {
        inboxes.push(net.register(PeerId::new(format!("spare{i:02}"))).1);
    }
    let (hub, _events) = MeshNode::new(hub_id.clone(), MeshConfig::default(), Arc::new(transport));
    let threshold = hub.config().churn_threshold;

    let step = timed_step_async("baseline", || async {
        let report = hub.run_health_check().await;
        check(
            report.decision == HealDecision::NoAction,
            format!("{} neighbors", hub.router().neighbors().len()),
        )
    })
    .await;
    result.add(step);

    // ── Low churn: one spoke drops ──────────────────────────────────
    let step = timed_step_async("soft heal", || async {
        net.set_link_up(&hub_id, &spoke_ids[0], false);
        let report = hub.run_health_check().await;
        let soft = matches!(report.decision, HealDecision::SoftHeal { .. });
        check(
            soft && report.reconnected == vec![spoke_ids[0].clone()],
            format!(
                "churn 1/{spokes} < {threshold}: {:?}, reconnected {}",
                report.decision,
                report.reconnected.len()
            ),
        )
    })
    .await;
    result.add(step);

    // ── High churn: a third of the spokes drop ──────────────────────
    let step = timed_step_async("aggressive heal", || async {
        let dropping = (spokes / 3).max(2);
        for id in &spoke_ids[..dropping] {
            net.set_link_up(&hub_id, id, false);
        }
        let report = hub.run_health_check().await;
        let wanted = dropping * 2;
        match &report.decision {
            HealDecision::AggressiveHeal { dropped, discover } => check(
                dropped.len() == dropping && *discover == wanted,
                format!(
                    "dropped {}, asked for {discover}, discovered {}, routes dropped {}",
                    dropped.len(),
                    report.discovered.len(),
                    report.routes_dropped
                ),
            ),
            other => Err(format!("expected aggressive heal, got {other:?}")),
        }
    })
    .await;
    result.add(step);

    let step = timed_step_async("settles", || async {
        let report = hub.run_health_check().await;
        check(
            report.decision == HealDecision::NoAction,
            format!("{} neighbors after heal", hub.router().neighbors().len()),
        )
    })
    .await;
    result.add(step);

    drop(inboxes);
    result.finalize(start);
    Ok(result)
}
