/// TTL-bounded forwarding with duplicate suppression.
///
/// Pure decision logic: receives a message, returns a `RelayDecision`
/// telling the caller what to do (deliver, relay, drop). No I/O; the node
/// runtime turns relay decisions into dispatcher items.
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::error::MeshError;
use crate::message::MeshMessage;
use crate::types::PeerId;

/// Capacity of the multi-path correlation set at the destination.
const PATH_CACHE_SIZE: usize = 1024;

// ── Decisions ──────────────────────────────────────────────────────────

/// Why a message was not delivered or relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Message id already processed by this node.
    Duplicate,
    /// Another copy of the same multi-path send was already delivered.
    DuplicatePath,
    /// No hops left after the one that brought it here.
    TtlExhausted,
}

/// How a relayed message leaves this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMode {
    /// Follow the message's source route to this neighbor.
    Directed(PeerId),
    /// Broadcast to every neighbor except the one it came from.
    Flood { exclude: PeerId },
}

/// What to do with an incoming message.
#[derive(Debug)]
pub enum RelayDecision {
    /// Addressed to us; hand to the application.
    Deliver(MeshMessage),
    /// Not ours. `message` already has its TTL decremented and the local
    /// id appended to its trail.
    Relay { message: MeshMessage, mode: RelayMode },
    /// Silently ignore.
    Drop(DropReason),
}

// ── Forwarder ──────────────────────────────────────────────────────────

/// Per-node forwarding state: the processed-message recency set.
///
/// The set is bounded and evicts in insertion order (ids are only ever
/// inserted, never touched again), so memory stays fixed under a flood.
/// A message whose id has been evicted could be relayed a second time.
pub struct Forwarder {
    local_id: PeerId,
    processed: LruCache<String, ()>,
    delivered_paths: LruCache<String, ()>,
}

impl Forwarder {
    pub fn new(local_id: PeerId, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let path_capacity = NonZeroUsize::new(PATH_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            local_id,
            processed: LruCache::new(capacity),
            delivered_paths: LruCache::new(path_capacity),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Register a locally injected message so echoes of it are dropped.
    ///
    /// Rejects a zero TTL: such a message could never leave the node.
    pub fn originate(&mut self, message: &MeshMessage) -> Result<(), MeshError> {
        if message.ttl == 0 {
            return Err(MeshError::InvalidTtl { ttl: message.ttl });
        }
        self.processed.put(message.message_id.clone(), ());
        Ok(())
    }

    /// Decide what to do with a message received from neighbor `received_from`.
    ///
    /// At most one relay decision is ever produced per message id (while
    /// the id is retained in the recency set).
    pub fn relay(&mut self, mut message: MeshMessage, received_from: &PeerId) -> RelayDecision {
        if self.processed.contains(&message.message_id) {
            tracing::trace!(id = %message.message_id, from = %received_from, "duplicate dropped");
            return RelayDecision::Drop(DropReason::Duplicate);
        }
        self.processed.put(message.message_id.clone(), ());

        if message.destination_id == self.local_id {
            if let Some(tag) = &message.path_tag {
                if self.delivered_paths.contains(&tag.correlation_id) {
                    return RelayDecision::Drop(DropReason::DuplicatePath);
                }
                self.delivered_paths.put(tag.correlation_id.clone(), ());
            }
            return RelayDecision::Deliver(message);
        }

        // The wire TTL includes the hop that brought the message here.
        if message.ttl <= 1 {
            tracing::debug!(id = %message.message_id, "ttl exhausted");
            return RelayDecision::Drop(DropReason::TtlExhausted);
        }
        message.ttl -= 1;
        message.trail.push(self.local_id.clone());

        let mode = match message.next_hop_after(&self.local_id) {
            Some(next) => RelayMode::Directed(next.clone()),
            None => RelayMode::Flood {
                exclude: received_from.clone(),
            },
        };
        RelayDecision::Relay { message, mode }
    }

    /// Number of message ids currently retained.
    pub fn processed_len(&self) -> usize {
        self.processed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PathTag;
    use crate::types::QosClass;

    fn msg(to: &str, ttl: u32) -> MeshMessage {
        MeshMessage::new("a".into(), to.into(), ttl, QosClass::Sync, vec![1, 2, 3])
    }

    #[test]
    fn delivers_local_message() {
        let mut fwd = Forwarder::new("b".into(), 16);
        let decision = fwd.relay(msg("b", 3), &"a".into());
        assert!(matches!(decision, RelayDecision::Deliver(_)));
    }

    #[test]
    fn duplicate_is_dropped() {
        let mut fwd = Forwarder::new("b".into(), 16);
        let m = msg("c", 3);
        assert!(matches!(fwd.relay(m.clone(), &"a".into()), RelayDecision::Relay { .. }));
        assert!(matches!(
            fwd.relay(m, &"x".into()),
            RelayDecision::Drop(DropReason::Duplicate)
        ));
    }

    #[test]
    fn relay_decrements_ttl_and_extends_trail() {
        let mut fwd = Forwarder::new("b".into(), 16);
        match fwd.relay(msg("c", 3), &"a".into()) {
            RelayDecision::Relay { message, mode } => {
                assert_eq!(message.ttl, 2);
                assert_eq!(message.trail, vec![PeerId::from("a"), PeerId::from("b")]);
                assert_eq!(mode, RelayMode::Flood { exclude: "a".into() });
            }
            other => panic!("expected relay, got {other:?}"),
        }
    }

    #[test]
    fn ttl_one_is_not_relayed() {
        let mut fwd = Forwarder::new("b".into(), 16);
        assert!(matches!(
            fwd.relay(msg("c", 1), &"a".into()),
            RelayDecision::Drop(DropReason::TtlExhausted)
        ));
    }

    #[test]
    fn ttl_one_still_delivers_to_destination() {
        let mut fwd = Forwarder::new("b".into(), 16);
        assert!(matches!(fwd.relay(msg("b", 1), &"a".into()), RelayDecision::Deliver(_)));
    }

    #[test]
    fn source_route_gives_directed_relay() {
        let mut fwd = Forwarder::new("b".into(), 16);
        let m = msg("d", 3).with_route(vec!["b".into(), "c".into(), "d".into()]);
        match fwd.relay(m, &"a".into()) {
            RelayDecision::Relay { mode, .. } => assert_eq!(mode, RelayMode::Directed("c".into())),
            other => panic!("expected relay, got {other:?}"),
        }
    }

    #[test]
    fn originate_rejects_zero_ttl() {
        let mut fwd = Forwarder::new("a".into(), 16);
        let err = fwd.originate(&msg("c", 0)).unwrap_err();
        assert!(matches!(err, MeshError::InvalidTtl { ttl: 0 }));
    }

    #[test]
    fn own_message_echo_is_dropped() {
        let mut fwd = Forwarder::new("a".into(), 16);
        let m = msg("c", 3);
        fwd.originate(&m).unwrap();
        assert!(matches!(
            fwd.relay(m, &"b".into()),
            RelayDecision::Drop(DropReason::Duplicate)
        ));
    }

    #[test]
    fn processed_set_is_bounded_fifo() {
        let mut fwd = Forwarder::new("b".into(), 2);
        let first = msg("c", 3);
        fwd.relay(first.clone(), &"a".into());
        fwd.relay(msg("c", 3), &"a".into());
        fwd.relay(msg("c", 3), &"a".into());
        assert_eq!(fwd.processed_len(), 2);
        // The oldest id was evicted, so it is accepted again.
        assert!(matches!(fwd.relay(first, &"a".into()), RelayDecision::Relay { .. }));
    }

    #[test]
    fn second_path_copy_is_not_delivered() {
        let mut fwd = Forwarder::new("d".into(), 16);
        let tag = PathTag {
            correlation_id: "corr".into(),
            path_index: 0,
            total_paths: 2,
        };
        let first = msg("d", 3).with_path_tag(tag.clone());
        let second = msg("d", 3).with_path_tag(PathTag { path_index: 1, ..tag });
        assert!(matches!(fwd.relay(first, &"b".into()), RelayDecision::Deliver(_)));
        assert!(matches!(
            fwd.relay(second, &"c".into()),
            RelayDecision::Drop(DropReason::DuplicatePath)
        ));
    }
}
