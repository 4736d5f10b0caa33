/// Priority dispatcher behavior under load.
use std::sync::Arc;

use relaymesh_protocol::{
    Dispatcher, DispatcherParams, EnqueueOutcome, LatencyWindow, MeshError, MeshEvent, MeshStats,
    OutboundItem, QosClass, ReputationEngine,
};
use tokio::sync::mpsc;

fn dispatcher(capacity: usize) -> (Arc<Dispatcher>, Arc<MeshStats>, mpsc::Receiver<MeshEvent>) {
    let (tx, rx) = mpsc::channel(4096);
    let stats = Arc::new(MeshStats::new());
    let d = Arc::new(Dispatcher::new(
        DispatcherParams {
            capacity,
            max_concurrent: 2,
            retry_limit: 3,
        },
        Arc::new(ReputationEngine::default()),
        Arc::new(LatencyWindow::new()),
        stats.clone(),
        tx,
    ));
    (d, stats, rx)
}

fn item(qos: QosClass, tag: u8) -> OutboundItem {
    OutboundItem {
        payload: vec![tag],
        destination_id: "next".into(),
        qos_class: qos,
        source_peer_id: "src".into(),
    }
}

#[test]
fn critical_overtakes_any_amount_of_bulk() {
    let (d, _, _events) = dispatcher(10_000);
    for i in 0..500 {
        d.enqueue(item(QosClass::Bulk, (i % 250) as u8)).unwrap();
    }
    d.enqueue(item(QosClass::Critical, 255)).unwrap();
    for i in 0..500 {
        d.enqueue(item(QosClass::Bulk, (i % 250) as u8)).unwrap();
    }
    let first = d.pop().unwrap();
    assert_eq!(first.qos_class, QosClass::Critical);
    assert_eq!(first.payload, vec![255]);
}

#[test]
fn saturated_bulk_queue_makes_room_for_critical() {
    let (d, stats, _events) = dispatcher(16);
    for i in 0..16 {
        d.enqueue(item(QosClass::Bulk, i)).unwrap();
    }
    // More bulk cannot get in.
    assert!(matches!(
        d.enqueue(item(QosClass::Bulk, 99)),
        Err(MeshError::QueueFull { .. })
    ));

    let outcome = d.enqueue(item(QosClass::Critical, 200)).unwrap();
    assert!(matches!(outcome, EnqueueOutcome::QueuedWithEviction { .. }));
    assert_eq!(d.len(), 16);
    assert_eq!(d.pop().unwrap().qos_class, QosClass::Critical);

    let snap = stats.snapshot();
    assert_eq!(snap.rejected, 1);
    assert_eq!(snap.evicted, 1);
}

#[test]
fn classes_drain_in_priority_then_fifo_order() {
    let (d, _, _events) = dispatcher(64);
    let order = [
        (QosClass::Sync, 1),
        (QosClass::Bulk, 2),
        (QosClass::RealTime, 3),
        (QosClass::Sync, 4),
        (QosClass::Critical, 5),
        (QosClass::Bulk, 6),
    ];
    for (qos, tag) in order {
        d.enqueue(item(qos, tag)).unwrap();
    }
    let drained: Vec<u8> = std::iter::from_fn(|| d.pop()).map(|i| i.payload[0]).collect();
    assert_eq!(drained, vec![5, 3, 1, 4, 2, 6]);
}
