/// End-to-end mesh tests over the in-memory transport.
///
/// Nodes are real `MeshNode`s with their dispatch loops and inbox pumps
/// running; only the radio is simulated.
mod common;

use common::{init_tracing, line, nodes, settle, start_all};
use relaymesh_protocol::{DropReason, MemoryNetwork, MeshConfig, MeshEvent, PeerId, QosClass};

fn is_delivery_of(payload: &'static [u8]) -> impl FnMut(&MeshEvent) -> bool {
    move |e| matches!(e, MeshEvent::Delivered { payload: p, .. } if p == payload)
}

#[tokio::test]
async fn three_node_line_flood_then_routed_reply() {
    init_tracing();
    let net = MemoryNetwork::new();
    let config = MeshConfig::default();
    let registered = nodes(&net, &["alice", "relay", "bob"], &config);
    let ids: Vec<PeerId> = registered.iter().map(|(n, _)| n.id()).collect();
    line(&net, &ids);
    let mut n = start_all(registered).await;

    // Alice knows no route to Bob yet: flood.
    n[0].node
        .flood(&ids[2], b"hello bob".to_vec(), QosClass::Sync, 3)
        .unwrap();
    let delivered = n[2].wait_for(is_delivery_of(b"hello bob")).await;
    match delivered {
        Some(MeshEvent::Delivered { origin, .. }) => assert_eq!(origin, ids[0]),
        other => panic!("bob did not get the flood: {other:?}"),
    }

    // Bob learned the way back from the trail.
    let back = n[2].node.router().candidates(&ids[0]);
    assert_eq!(back.len(), 1);
    assert_eq!(back[0].hops(), &[ids[1].clone(), ids[0].clone()]);

    let report = n[2].node
        .send(&ids[0], b"hi alice".to_vec(), QosClass::RealTime)
        .await
        .unwrap();
    assert!(report.any_sent());
    assert!(n[0].wait_for(is_delivery_of(b"hi alice")).await.is_some());

    // And Alice now has a source route to Bob.
    let report = n[0].node
        .send(&ids[2], b"routed".to_vec(), QosClass::Sync)
        .await
        .unwrap();
    assert_eq!(report.sent_paths(), 1);
    assert!(n[2].wait_for(is_delivery_of(b"routed")).await.is_some());

    for node in &n {
        node.node.shutdown().await;
    }
}

#[tokio::test]
async fn ttl_one_stops_at_first_relay() {
    init_tracing();
    let net = MemoryNetwork::new();
    let config = MeshConfig::default();
    let registered = nodes(&net, &["a", "b", "c"], &config);
    let ids: Vec<PeerId> = registered.iter().map(|(n, _)| n.id()).collect();
    line(&net, &ids);
    let mut n = start_all(registered).await;

    n[0].node.flood(&ids[2], b"short".to_vec(), QosClass::Sync, 1).unwrap();
    let dropped = n[1]
        .wait_for(|e| matches!(e, MeshEvent::MessageDropped { .. }))
        .await;
    assert!(matches!(
        dropped,
        Some(MeshEvent::MessageDropped { reason: DropReason::TtlExhausted, .. })
    ));
    settle().await;

    assert_eq!(n[1].node.stats().snapshot().ttl_exhausted, 1);
    assert_eq!(n[1].node.stats().snapshot().relayed, 0);
    assert!(!n[2]
        .drain()
        .iter()
        .any(|e| matches!(e, MeshEvent::Delivered { .. })));

    // One more hop of budget reaches c.
    n[0].node.flood(&ids[2], b"longer".to_vec(), QosClass::Sync, 2).unwrap();
    assert!(n[2].wait_for(is_delivery_of(b"longer")).await.is_some());
}

#[tokio::test]
async fn flood_on_cyclic_mesh_is_processed_once_per_node() {
    init_tracing();
    let net = MemoryNetwork::new();
    let config = MeshConfig::default();
    let registered = nodes(&net, &["a", "b", "c", "d", "e"], &config);
    let ids: Vec<PeerId> = registered.iter().map(|(n, _)| n.id()).collect();
    // Ring a-b-c-d-e-a plus chords a-c and b-d.
    line(&net, &ids);
    net.link(&ids[4], &ids[0]);
    net.link(&ids[0], &ids[2]);
    net.link(&ids[1], &ids[3]);
    let mut n = start_all(registered).await;

    // Nobody is called "z": the message can only die of TTL or duplicates.
    n[0].node
        .flood(&PeerId::from("z"), b"loop?".to_vec(), QosClass::Bulk, 10)
        .unwrap();
    settle().await;

    for node in &n[1..] {
        let stats = node.node.stats().snapshot();
        assert!(stats.relayed <= 1, "{} relayed {} times", node.id(), stats.relayed);
    }
    // The origin never relays its own message back out.
    assert_eq!(n[0].node.stats().snapshot().relayed, 0);
    let duplicates: u64 = n.iter().map(|x| x.node.stats().snapshot().duplicates).sum();
    assert!(duplicates > 0, "a cyclic mesh must produce echoes");

    // A real destination on the same mesh gets exactly one delivery.
    n[0].node
        .flood(&ids[3], b"once".to_vec(), QosClass::Sync, 10)
        .unwrap();
    settle().await;
    let deliveries = n[3]
        .drain()
        .into_iter()
        .filter(|e| matches!(e, MeshEvent::Delivered { payload, .. } if payload == b"once"))
        .count();
    assert_eq!(deliveries, 1);
}

#[tokio::test]
async fn multipath_send_delivers_exactly_once() {
    init_tracing();
    let net = MemoryNetwork::new();
    let config = MeshConfig::default().max_paths(2);
    let registered = nodes(&net, &["a", "b", "c", "d"], &config);
    let ids: Vec<PeerId> = registered.iter().map(|(n, _)| n.id()).collect();
    // Diamond: a-b-d and a-c-d.
    net.link(&ids[0], &ids[1]);
    net.link(&ids[1], &ids[3]);
    net.link(&ids[0], &ids[2]);
    net.link(&ids[2], &ids[3]);
    let mut n = start_all(registered).await;

    // d announces itself; both copies teach a one route each.
    n[3].node
        .flood(&ids[0], b"beacon".to_vec(), QosClass::Sync, 3)
        .unwrap();
    assert!(n[0].wait_for(is_delivery_of(b"beacon")).await.is_some());
    settle().await;
    assert_eq!(n[0].node.router().candidates(&ids[3]).len(), 2);

    let report = n[0].node
        .send(&ids[3], b"twice sent".to_vec(), QosClass::Critical)
        .await
        .unwrap();
    assert_eq!(report.paths.len(), 2);
    assert_eq!(report.sent_paths(), 2);
    settle().await;

    let events = n[3].drain();
    let deliveries = events
        .iter()
        .filter(|e| matches!(e, MeshEvent::Delivered { payload, .. } if payload == b"twice sent"))
        .count();
    assert_eq!(deliveries, 1);
    assert!(events.iter().any(|e| matches!(
        e,
        MeshEvent::MessageDropped { reason: DropReason::DuplicatePath, .. }
    )));

    // Both relays were credited.
    let rep = n[0].node.reputation();
    assert!(rep.score_or_neutral(&ids[1]) > 0.5);
    assert!(rep.score_or_neutral(&ids[2]) > 0.5);
}

#[tokio::test]
async fn send_to_unknown_destination_fails_cleanly() {
    let net = MemoryNetwork::new();
    let registered = nodes(&net, &["a", "b"], &MeshConfig::default());
    let ids: Vec<PeerId> = registered.iter().map(|(n, _)| n.id()).collect();
    line(&net, &ids);
    let n = start_all(registered).await;

    let err = n[0].node
        .send(&PeerId::from("nowhere"), vec![1], QosClass::Sync)
        .await
        .unwrap_err();
    assert!(matches!(err, relaymesh_protocol::MeshError::NoViableRoute { .. }));
    assert!(n[0].node.dispatcher().is_empty());
}
