/// Reputation engine — owns every peer's trust score.
///
/// Callers feed `BehaviorEvent`s from any task; each event is one short
/// read-modify-write of a single peer record under the engine lock.
use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{now_ms, PeerId, NEUTRAL_SCORE};

use super::scoring::{BehaviorMetric, BehaviorMetrics, ScoreWeights};

/// An immutable fact about one interaction with a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorEvent {
    pub peer_id: PeerId,
    #[serde(flatten)]
    pub metric: BehaviorMetric,
}

impl BehaviorEvent {
    pub fn new(peer_id: PeerId, metric: BehaviorMetric) -> Self {
        Self { peer_id, metric }
    }
}

/// Public view of a peer's standing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationScore {
    pub peer_id: PeerId,
    /// Always within [0, 1].
    pub score: f64,
    /// Unix ms of the last recalculation.
    pub last_updated: u64,
    /// Moving-average latency, 0 when never measured.
    pub latency_ms: f64,
}

#[derive(Debug)]
struct PeerRecord {
    metrics: BehaviorMetrics,
    score: f64,
    last_updated: u64,
    slow: bool,
}

impl PeerRecord {
    fn new(now: u64) -> Self {
        Self {
            metrics: BehaviorMetrics::new(),
            score: NEUTRAL_SCORE,
            last_updated: now,
            slow: false,
        }
    }

    fn view(&self, peer_id: &PeerId) -> ReputationScore {
        ReputationScore {
            peer_id: peer_id.clone(),
            score: self.score,
            last_updated: self.last_updated,
            latency_ms: self.metrics.latency_ms.unwrap_or(0.0),
        }
    }
}

struct EngineState {
    records: HashMap<PeerId, PeerRecord>,
    weights: ScoreWeights,
}

/// Tunables for score recalculation.
#[derive(Debug, Clone, Copy)]
pub struct ReputationParams {
    /// Blend factor: `new = old * (1 - alpha) + raw * alpha`.
    pub alpha: f64,
    pub latency_ceiling_ms: f64,
}

impl Default for ReputationParams {
    fn default() -> Self {
        Self {
            alpha: 0.4,
            latency_ceiling_ms: 2000.0,
        }
    }
}

/// Per-node reputation table.
pub struct ReputationEngine {
    state: Mutex<EngineState>,
    params: ReputationParams,
}

impl ReputationEngine {
    pub fn new(params: ReputationParams) -> Self {
        Self {
            state: Mutex::new(EngineState {
                records: HashMap::new(),
                weights: ScoreWeights::default(),
            }),
            params,
        }
    }

    /// Fold one event into the peer's metrics and recalculate its score.
    ///
    /// Returns the updated score.
    pub fn record_event(&self, event: BehaviorEvent) -> ReputationScore {
        self.record_event_at(event, now_ms())
    }

    /// Same as [`record_event`](Self::record_event) with an explicit clock (for testing).
    pub fn record_event_at(&self, event: BehaviorEvent, now: u64) -> ReputationScore {
        let mut state = self.state.lock();
        let weights = state.weights;
        let record = state
            .records
            .entry(event.peer_id.clone())
            .or_insert_with(|| PeerRecord::new(now));

        record.metrics.record(event.metric);
        let raw = record
            .metrics
            .raw_score(&weights, self.params.latency_ceiling_ms);
        let alpha = self.params.alpha;
        let previous = record.score;
        record.score = (previous * (1.0 - alpha) + raw * alpha).clamp(0.0, 1.0);
        record.last_updated = now;

        if matches!(event.metric, BehaviorMetric::ForgeryAttempt) {
            tracing::warn!(peer = %event.peer_id, from = previous, to = record.score, "forgery attempt recorded");
        } else {
            tracing::trace!(peer = %event.peer_id, metric = ?event.metric, score = record.score, "score updated");
        }
        record.view(&event.peer_id)
    }

    /// Current standing of a peer, `None` if it was never observed.
    pub fn get_score(&self, peer_id: &PeerId) -> Option<ReputationScore> {
        self.state.lock().records.get(peer_id).map(|r| r.view(peer_id))
    }

    /// Score for routing and queue ordering; unknown peers are neutral.
    pub fn score_or_neutral(&self, peer_id: &PeerId) -> f64 {
        self.state
            .lock()
            .records
            .get(peer_id)
            .map(|r| r.score)
            .unwrap_or(NEUTRAL_SCORE)
    }

    pub fn is_blacklisted(&self, peer_id: &PeerId, threshold: f64) -> bool {
        self.score_or_neutral(peer_id) < threshold
    }

    /// Replace the metric weights. Rejected (returns `false`) unless they
    /// can be normalized to sum to 1.
    pub fn set_weights(&self, weights: ScoreWeights) -> bool {
        match weights.normalized() {
            Some(w) => {
                self.state.lock().weights = w;
                true
            }
            None => {
                tracing::warn!(?weights, "rejected reputation weights");
                false
            }
        }
    }

    pub fn weights(&self) -> ScoreWeights {
        self.state.lock().weights
    }

    pub fn mark_slow(&self, peer_id: &PeerId) {
        let now = now_ms();
        self.state
            .lock()
            .records
            .entry(peer_id.clone())
            .or_insert_with(|| PeerRecord::new(now))
            .slow = true;
    }

    pub fn clear_slow(&self, peer_id: &PeerId) {
        if let Some(r) = self.state.lock().records.get_mut(peer_id) {
            r.slow = false;
        }
    }

    pub fn is_slow(&self, peer_id: &PeerId) -> bool {
        self.state
            .lock()
            .records
            .get(peer_id)
            .is_some_and(|r| r.slow)
    }

    /// All known scores, highest first.
    pub fn snapshot(&self) -> Vec<ReputationScore> {
        let state = self.state.lock();
        let mut all: Vec<ReputationScore> =
            state.records.iter().map(|(id, r)| r.view(id)).collect();
        all.sort_by(|a, b| b.score.total_cmp(&a.score));
        all
    }

    /// Number of peers with a record.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReputationEngine {
    fn default() -> Self {
        Self::new(ReputationParams::default())
    }
}
