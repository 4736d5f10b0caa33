use crate::dispatcher::SendDropReason;
use crate::forwarding::DropReason;
use crate::healing::{HealDecision, SlowPeerChange};
use crate::ledger::EntryStatus;
use crate::types::{PeerId, QosClass};

/// Events a node reports to the application.
///
/// Sent with `try_send`: a slow consumer loses events, never blocks the node.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A data message addressed to this node.
    Delivered {
        message_id: String,
        origin: PeerId,
        qos: QosClass,
        payload: Vec<u8>,
    },
    /// A message was relayed to `next_hops` neighbors.
    Relayed { message_id: String, next_hops: usize },
    /// An incoming message was not delivered or relayed.
    MessageDropped { message_id: String, reason: DropReason },
    /// A queued send reached the transport.
    SendCompleted {
        item_id: u64,
        peer: PeerId,
        latency_ms: f64,
    },
    /// A queued send was given up on.
    SendDropped {
        item_id: u64,
        destination: PeerId,
        reason: SendDropReason,
    },
    PeerConnected { peer: PeerId },
    PeerDisconnected { peer: PeerId },
    /// The monitor took a corrective action.
    Healed { decision: HealDecision },
    SlowPeer { change: SlowPeerChange },
    /// A ledger entry was stored or moved forward.
    LedgerEntryStored {
        entry_id: String,
        sender: PeerId,
        status: EntryStatus,
    },
    /// A received ledger entry failed verification.
    LedgerEntryRejected { entry_id: String, reason: String },
    /// Non-fatal runtime error.
    Error { description: String },
}
