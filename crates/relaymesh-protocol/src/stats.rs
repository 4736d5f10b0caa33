//! Node counters.
//!
//! [`Counter`] is an atomic monotonic counter; [`MeshStats`] groups the
//! ones a node keeps and can be shared between the runtime and the
//! dispatcher behind an `Arc`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A monotonically increasing counter backed by [`AtomicU64`].
///
/// Relaxed ordering: values are statistics, not synchronization.
#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Counter").field(&self.get()).finish()
    }
}

/// Live counters for one node.
#[derive(Debug, Default)]
pub struct MeshStats {
    // forwarding
    pub delivered: Counter,
    pub relayed: Counter,
    pub duplicates: Counter,
    pub ttl_exhausted: Counter,
    pub decode_errors: Counter,
    // dispatcher
    pub enqueued: Counter,
    pub sent: Counter,
    pub retried: Counter,
    pub send_dropped: Counter,
    pub evicted: Counter,
    pub rejected: Counter,
    pub withdrawn: Counter,
}

impl MeshStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            delivered: self.delivered.get(),
            relayed: self.relayed.get(),
            duplicates: self.duplicates.get(),
            ttl_exhausted: self.ttl_exhausted.get(),
            decode_errors: self.decode_errors.get(),
            enqueued: self.enqueued.get(),
            sent: self.sent.get(),
            retried: self.retried.get(),
            send_dropped: self.send_dropped.get(),
            evicted: self.evicted.get(),
            rejected: self.rejected.get(),
            withdrawn: self.withdrawn.get(),
        }
    }
}

/// Serializable copy of [`MeshStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub delivered: u64,
    pub relayed: u64,
    pub duplicates: u64,
    pub ttl_exhausted: u64,
    pub decode_errors: u64,
    pub enqueued: u64,
    pub sent: u64,
    pub retried: u64,
    pub send_dropped: u64,
    pub evicted: u64,
    pub rejected: u64,
    pub withdrawn: u64,
}
