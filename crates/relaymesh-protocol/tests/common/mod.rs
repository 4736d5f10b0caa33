//! Shared harness: build relaymesh nodes on an in-memory network.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use relaymesh_protocol::{MemoryNetwork, MeshConfig, MeshEvent, MeshNode, PeerId};
use tokio::sync::mpsc;

pub struct TestNode {
    pub node: Arc<MeshNode>,
    pub events: mpsc::Receiver<MeshEvent>,
}

impl TestNode {
    pub fn id(&self) -> PeerId {
        self.node.local_id().clone()
    }

    /// Wait for the first event matching `pred`, skipping others.
    pub async fn wait_for<F>(&mut self, mut pred: F) -> Option<MeshEvent>
    where
        F: FnMut(&MeshEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv()).await.ok()??;
            if pred(&event) {
                return Some(event);
            }
        }
    }

    /// Everything received so far, without waiting.
    pub fn drain(&mut self) -> Vec<MeshEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}

/// Register unstarted nodes. Link them, then call [`start_all`].
pub fn nodes(
    net: &MemoryNetwork,
    names: &[&str],
    config: &MeshConfig,
) -> Vec<(TestNode, mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>)> {
    names
        .iter()
        .map(|name| {
            let (transport, inbox) = net.register(PeerId::from(*name));
            let (node, events) = MeshNode::new(PeerId::from(*name), config.clone(), Arc::new(transport));
            (TestNode { node, events }, inbox)
        })
        .collect()
}

/// Like [`nodes`], with Ed25519 identities derived from `seeds`.
pub fn keyed_nodes(
    net: &MemoryNetwork,
    seeds: &[u8],
    config: &MeshConfig,
) -> Vec<(TestNode, mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>)> {
    seeds
        .iter()
        .map(|seed| {
            let key = SigningKey::from_bytes(&[*seed; 32]);
            let id = PeerId::from_verifying_key(&key.verifying_key());
            let (transport, inbox) = net.register(id);
            let (node, events) = MeshNode::with_key(key, config.clone(), Arc::new(transport));
            (TestNode { node, events }, inbox)
        })
        .collect()
}

/// Start every node and pump its inbox. Returns the started nodes.
pub async fn start_all(
    registered: Vec<(TestNode, mpsc::UnboundedReceiver<(PeerId, Vec<u8>)>)>,
) -> Vec<TestNode> {
    let mut started = Vec::with_capacity(registered.len());
    for (node, inbox) in registered {
        node.node.start().await;
        node.node.spawn_inbox(inbox);
        started.push(node);
    }
    started
}

/// Link consecutive ids: a - b - c - ...
pub fn line(net: &MemoryNetwork, ids: &[PeerId]) {
    for pair in ids.windows(2) {
        net.link(&pair[0], &pair[1]);
    }
}

/// Let in-flight frames settle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}
