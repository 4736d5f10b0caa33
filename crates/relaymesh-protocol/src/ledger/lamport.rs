use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::PeerId;

/// Logical time `(counter, node_id)`. Field order gives the total order:
/// counter first, node id breaks ties.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LamportTimestamp {
    pub counter: u64,
    pub node_id: PeerId,
}

impl fmt::Display for LamportTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.node_id)
    }
}

/// Per-node Lamport clock.
#[derive(Debug, Clone)]
pub struct LamportClock {
    node_id: PeerId,
    counter: u64,
}

impl LamportClock {
    pub fn new(node_id: PeerId) -> Self {
        Self { node_id, counter: 0 }
    }

    /// Advance for a local event.
    pub fn tick(&mut self) -> LamportTimestamp {
        self.counter += 1;
        self.current()
    }

    /// Merge a received timestamp: `max(local, remote) + 1`.
    pub fn observe(&mut self, remote: &LamportTimestamp) -> LamportTimestamp {
        self.counter = self.counter.max(remote.counter) + 1;
        self.current()
    }

    pub fn current(&self) -> LamportTimestamp {
        LamportTimestamp {
            counter: self.counter,
            node_id: self.node_id.clone(),
        }
    }
}
