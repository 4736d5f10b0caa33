//! relaymesh protocol core.
//!
//! TTL-bounded forwarding with duplicate suppression, behavior-based peer
//! reputation, reputation-weighted multi-path routing, a QoS priority
//! dispatcher, a churn-driven healing monitor and a signed, hash-linked
//! transaction ledger with Lamport ordering.
//!
//! Wire format: MessagePack (compact binary).
//! Crypto: Ed25519 signatures + SHA-256 entry hashes.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod forwarding;
pub mod healing;
pub mod ledger;
pub mod message;
pub mod multipath;
pub mod reputation;
pub mod runtime;
pub mod stats;
pub mod transport;
pub mod types;

pub use config::MeshConfig;
pub use dispatcher::{
    Dispatcher, DispatcherParams, EnqueueOutcome, OutboundItem, QueuedItem, SendDropReason,
    SendOutcome,
};
pub use error::MeshError;
pub use event::MeshEvent;
pub use forwarding::{DropReason, Forwarder, RelayDecision, RelayMode};
pub use healing::{
    churn_ratio, HealDecision, HealthMonitor, LatencyWindow, MonitorParams, MonitorState,
    SlowPeerChange,
};
pub use ledger::{
    EntryStatus, IngestOutcome, LamportClock, LamportTimestamp, Ledger, LedgerEntry, LedgerError,
    SyncBatch, SyncRequest, Transaction,
};
pub use message::{MeshMessage, MessageKind, PathTag};
pub use multipath::{
    route_score, select_routes, MultiPathReport, MultiPathRouter, PathOutcome, PathPlan, Route,
    RouteTable, RouterParams, ScoredRoute,
};
pub use reputation::{
    BehaviorEvent, BehaviorMetric, BehaviorMetrics, ReputationEngine, ReputationParams,
    ReputationScore, ScoreWeights,
};
pub use runtime::{HealthReport, MeshNode};
pub use stats::{MeshStats, StatsSnapshot};
pub use transport::memory::{MemoryNetwork, MemoryTransport};
pub use transport::Transport;
pub use types::{now_ms, PeerId, QosClass, DEFAULT_TTL, NEUTRAL_SCORE};
