/// Link-layer abstraction for the relay core.
///
/// In production: implemented over whatever short-range radio the node has.
/// In tests and the simulator: [`memory::MemoryTransport`].
use crate::types::PeerId;

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Peers with a live direct link.
    async fn connected_peers(&self) -> Vec<PeerId>;

    /// Send raw bytes to a directly connected peer.
    async fn send(&self, peer: &PeerId, data: &[u8]) -> Result<(), String>;

    /// Try to re-establish a dropped link.
    async fn reconnect(&self, peer: &PeerId) -> Result<(), String>;

    /// Look for up to `count` new peers to link with; returns the ones
    /// that were connected.
    async fn discover(&self, count: usize) -> Vec<PeerId>;
}

// ── In-memory network ─────────────────────────────────────────────────

pub mod memory {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::Transport;
    use crate::types::PeerId;

    /// A frame as seen by the receiving node: `(from, bytes)`.
    pub type Frame = (PeerId, Vec<u8>);

    #[derive(Debug, Clone, Copy)]
    struct Link {
        up: bool,
        latency: Duration,
    }

    #[derive(Default)]
    struct NetState {
        inboxes: HashMap<PeerId, mpsc::UnboundedSender<Frame>>,
        links: HashMap<(PeerId, PeerId), Link>,
    }

    fn link_key(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
        if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }

    /// Shared in-process "air" connecting [`MemoryTransport`]s.
    ///
    /// Links are undirected, can be taken down and brought back, and carry
    /// an optional fixed latency.
    #[derive(Clone, Default)]
    pub struct MemoryNetwork {
        state: Arc<Mutex<NetState>>,
    }

    impl MemoryNetwork {
        pub fn new() -> Self {
            Self::default()
        }

        /// Attach a node. Frames addressed to it arrive on the returned receiver.
        pub fn register(&self, id: PeerId) -> (MemoryTransport, mpsc::UnboundedReceiver<Frame>) {
            let (tx, rx) = mpsc::unbounded_channel();
            self.state.lock().inboxes.insert(id.clone(), tx);
            let transport = MemoryTransport {
                local_id: id,
                network: self.clone(),
            };
            (transport, rx)
        }

        pub fn link(&self, a: &PeerId, b: &PeerId) {
            self.link_with_latency(a, b, Duration::ZERO);
        }

        pub fn link_with_latency(&self, a: &PeerId, b: &PeerId, latency: Duration) {
            self.state
                .lock()
                .links
                .insert(link_key(a, b), Link { up: true, latency });
        }

        /// Remove a link entirely; `reconnect` cannot bring it back.
        pub fn unlink(&self, a: &PeerId, b: &PeerId) {
            self.state.lock().links.remove(&link_key(a, b));
        }

        /// Take a link down or bring it back up. Unknown links are ignored.
        pub fn set_link_up(&self, a: &PeerId, b: &PeerId, up: bool) {
            if let Some(link) = self.state.lock().links.get_mut(&link_key(a, b)) {
                link.up = up;
            }
        }

        pub fn set_latency(&self, a: &PeerId, b: &PeerId, latency: Duration) {
            if let Some(link) = self.state.lock().links.get_mut(&link_key(a, b)) {
                link.latency = latency;
            }
        }

        /// Take down every link of `peer` (the node "walks away").
        pub fn isolate(&self, peer: &PeerId) {
            for (key, link) in self.state.lock().links.iter_mut() {
                if &key.0 == peer || &key.1 == peer {
                    link.up = false;
                }
            }
        }

        pub fn is_linked(&self, a: &PeerId, b: &PeerId) -> bool {
            self.state
                .lock()
                .links
                .get(&link_key(a, b))
                .is_some_and(|l| l.up)
        }

        fn neighbors(&self, of: &PeerId) -> Vec<PeerId> {
            let state = self.state.lock();
            let mut peers: Vec<PeerId> = state
                .links
                .iter()
                .filter(|(_, link)| link.up)
                .filter_map(|((a, b), _)| {
                    if a == of {
                        Some(b.clone())
                    } else if b == of {
                        Some(a.clone())
                    } else {
                        None
                    }
                })
                .collect();
            peers.sort();
            peers
        }
    }

    /// One node's handle on a [`MemoryNetwork`].
    #[derive(Clone)]
    pub struct MemoryTransport {
        local_id: PeerId,
        network: MemoryNetwork,
    }

    impl MemoryTransport {
        pub fn local_id(&self) -> &PeerId {
            &self.local_id
        }
    }

    #[async_trait::async_trait]
    impl Transport for MemoryTransport {
        async fn connected_peers(&self) -> Vec<PeerId> {
            self.network.neighbors(&self.local_id)
        }

        async fn send(&self, peer: &PeerId, data: &[u8]) -> Result<(), String> {
            let (link, inbox) = {
                let state = self.network.state.lock();
                let link = state.links.get(&link_key(&self.local_id, peer)).copied();
                (link, state.inboxes.get(peer).cloned())
            };
            let link = match link {
                Some(l) if l.up => l,
                _ => return Err(format!("no link to {peer}")),
            };
            let inbox = inbox.ok_or_else(|| format!("unknown peer {peer}"))?;
            if !link.latency.is_zero() {
                tokio::time::sleep(link.latency).await;
            }
            // The link may have failed while the frame was in the air.
            if !self.network.is_linked(&self.local_id, peer) {
                return Err(format!("link to {peer} lost in flight"));
            }
            inbox
                .send((self.local_id.clone(), data.to_vec()))
                .map_err(|_| format!("{peer} is gone"))
        }

        async fn reconnect(&self, peer: &PeerId) -> Result<(), String> {
            let mut guard = self.network.state.lock();
            let state = &mut *guard;
            match state.links.get_mut(&link_key(&self.local_id, peer)) {
                Some(link) if peer_is_alive(&state.inboxes, peer) => {
                    link.up = true;
                    Ok(())
                }
                _ => Err(format!("{peer} unreachable")),
            }
        }

        async fn discover(&self, count: usize) -> Vec<PeerId> {
            let mut state = self.network.state.lock();
            let mut candidates: Vec<PeerId> = state
                .inboxes
                .keys()
                .filter(|p| **p != self.local_id)
                .filter(|p| !state.links.contains_key(&link_key(&self.local_id, p)))
                .cloned()
                .collect();
            candidates.sort();
            candidates.truncate(count);
            for peer in &candidates {
                state.links.insert(
                    link_key(&self.local_id, peer),
                    Link {
                        up: true,
                        latency: Duration::ZERO,
                    },
                );
            }
            candidates
        }
    }

    fn peer_is_alive(inboxes: &HashMap<PeerId, mpsc::UnboundedSender<Frame>>, peer: &PeerId) -> bool {
        inboxes.get(peer).is_some_and(|tx| !tx.is_closed())
    }

}
