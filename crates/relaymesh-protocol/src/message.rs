use serde::{Deserialize, Serialize};

use crate::error::MeshError;
use crate::types::{PeerId, QosClass};

/// What the payload carries. The forwarding layer never parses payloads;
/// the node runtime uses the kind to hand ledger entries to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Data,
    LedgerEntry,
    /// A [`SyncRequest`](crate::ledger::SyncRequest) for missing entries.
    LedgerSync,
    /// A [`SyncBatch`](crate::ledger::SyncBatch) answering one.
    LedgerBatch,
}

/// Tag shared by every copy of a multi-path send.
///
/// The receiver delivers the first copy for a `correlation_id` and drops
/// the rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathTag {
    pub correlation_id: String,
    pub path_index: u16,
    pub total_paths: u16,
}

/// The unit of communication between mesh nodes.
///
/// Serialized as MessagePack. `payload` is opaque to the relay core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshMessage {
    /// Unique id (UUID v4). Each path copy of a multi-path send has its own.
    pub message_id: String,
    /// Node that injected the message.
    pub origin_id: PeerId,
    /// Final recipient.
    pub destination_id: PeerId,
    /// Remaining hops, counting the hop currently being traversed.
    pub ttl: u32,
    pub qos_class: QosClass,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
    /// Source route: relays in order, ending with the destination. Empty
    /// means "flood or let relays decide".
    pub route: Vec<PeerId>,
    /// Nodes that relayed this message so far, origin first.
    pub trail: Vec<PeerId>,
    pub path_tag: Option<PathTag>,
}

impl MeshMessage {
    /// Create a flood-routed data message.
    pub fn new(
        origin_id: PeerId,
        destination_id: PeerId,
        ttl: u32,
        qos_class: QosClass,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            trail: vec![origin_id.clone()],
            origin_id,
            destination_id,
            ttl,
            qos_class,
            kind: MessageKind::Data,
            payload,
            route: Vec::new(),
            path_tag: None,
        }
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Pin the message to an explicit route (next hop first).
    pub fn with_route(mut self, route: Vec<PeerId>) -> Self {
        self.route = route;
        self
    }

    pub fn with_path_tag(mut self, tag: PathTag) -> Self {
        self.path_tag = Some(tag);
        self
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MeshError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, MeshError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }

    /// Next hop on the source route after `local`, if `local` is on it.
    pub fn next_hop_after(&self, local: &PeerId) -> Option<&PeerId> {
        let pos = self.route.iter().position(|p| p == local)?;
        self.route.get(pos + 1)
    }

    /// Reverse of the trail: the route back to the origin, as seen from the
    /// node that just received this message.
    pub fn return_route(&self) -> Vec<PeerId> {
        self.trail.iter().rev().cloned().collect()
    }
}
