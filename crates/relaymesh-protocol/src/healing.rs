/// Auto-healing monitor — churn detection and slow-peer handling.
///
/// Pure state machine: each cycle observes the connected peer set and
/// returns a `HealDecision`. The node runtime carries the decision out
/// (reconnects, route recalculation, discovery).
///
/// Cycle: `Idle → Observing → {NoAction | SoftHeal | AggressiveHeal} → Idle`.
use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;

use crate::reputation::{BehaviorEvent, BehaviorMetric, ReputationEngine};
use crate::types::PeerId;

/// Latency samples kept per peer for the slow-peer average.
const LATENCY_WINDOW: usize = 8;

// ── Latency window ────────────────────────────────────────────────────

/// Recent send latencies per peer, fed by the dispatcher.
#[derive(Debug, Default)]
pub struct LatencyWindow {
    samples: Mutex<HashMap<PeerId, VecDeque<f64>>>,
}

impl LatencyWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, peer: &PeerId, ms: f64) {
        if !ms.is_finite() || ms < 0.0 {
            return;
        }
        let mut samples = self.samples.lock();
        let window = samples.entry(peer.clone()).or_default();
        if window.len() == LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(ms);
    }

    /// Mean of the recent samples, `None` without samples.
    pub fn average(&self, peer: &PeerId) -> Option<f64> {
        let samples = self.samples.lock();
        let window = samples.get(peer).filter(|w| !w.is_empty())?;
        Some(window.iter().sum::<f64>() / window.len() as f64)
    }

    pub fn forget(&self, peer: &PeerId) {
        self.samples.lock().remove(peer);
    }
}

// ── Decisions ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Idle,
    Observing,
}

/// What one monitor cycle decided to do.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum HealDecision {
    NoAction,
    /// Low churn: try to bring each dropped peer back.
    SoftHeal { reconnect: Vec<PeerId> },
    /// High churn: recalculate every route and look for replacements.
    AggressiveHeal { dropped: Vec<PeerId>, discover: usize },
}

/// Slow-peer outcome for one connected peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "change")]
pub enum SlowPeerChange {
    Penalized { peer: PeerId, latency_ms: f64 },
    Recovered { peer: PeerId, latency_ms: f64 },
}

/// Monitor thresholds.
#[derive(Debug, Clone, Copy)]
pub struct MonitorParams {
    pub churn_threshold: f64,
    pub slow_latency_ms: f64,
    pub slow_score_floor: f64,
}

impl Default for MonitorParams {
    fn default() -> Self {
        Self {
            churn_threshold: 0.20,
            slow_latency_ms: 1000.0,
            slow_score_floor: 0.20,
        }
    }
}

/// Churn ratio over one window. 0 when nothing was connected or dropped.
pub fn churn_ratio(connected: usize, dropped: usize) -> f64 {
    let total = connected + dropped;
    if total == 0 {
        0.0
    } else {
        dropped as f64 / total as f64
    }
}

// ── Monitor ───────────────────────────────────────────────────────────

struct MonitorInner {
    state: MonitorState,
    /// Connected set seen at the end of the previous cycle.
    last_connected: HashSet<PeerId>,
    /// Disconnects reported by the transport since the previous cycle.
    reported_drops: HashSet<PeerId>,
    cycles: u64,
}

pub struct HealthMonitor {
    inner: Mutex<MonitorInner>,
    params: MonitorParams,
}

impl HealthMonitor {
    pub fn new(params: MonitorParams) -> Self {
        Self {
            inner: Mutex::new(MonitorInner {
                state: MonitorState::Idle,
                last_connected: HashSet::new(),
                reported_drops: HashSet::new(),
                cycles: 0,
            }),
            params,
        }
    }

    pub fn state(&self) -> MonitorState {
        self.inner.lock().state
    }

    pub fn cycles(&self) -> u64 {
        self.inner.lock().cycles
    }

    /// Transport reported a link loss.
    pub fn note_disconnected(&self, peer: &PeerId) {
        self.inner.lock().reported_drops.insert(peer.clone());
    }

    /// A peer (re)connected; it no longer counts as dropped.
    pub fn note_connected(&self, peer: &PeerId) {
        let mut inner = self.inner.lock();
        inner.reported_drops.remove(peer);
        inner.last_connected.insert(peer.clone());
    }

    /// Mark the start of a cycle.
    pub fn begin_cycle(&self) {
        self.inner.lock().state = MonitorState::Observing;
    }

    /// Decide on the window that ends now and return to `Idle`.
    ///
    /// A peer counts as dropped when it was connected at the previous
    /// cycle (or reported a disconnect) and is not connected now.
    pub fn observe(&self, connected: &[PeerId]) -> HealDecision {
        let mut inner = self.inner.lock();
        inner.state = MonitorState::Observing;

        let now: HashSet<PeerId> = connected.iter().cloned().collect();
        let mut dropped: Vec<PeerId> = inner
            .last_connected
            .iter()
            .chain(inner.reported_drops.iter())
            .filter(|p| !now.contains(*p))
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        dropped.sort();

        let churn = churn_ratio(now.len(), dropped.len());
        let decision = if dropped.is_empty() {
            HealDecision::NoAction
        } else if churn >= self.params.churn_threshold {
            HealDecision::AggressiveHeal {
                discover: dropped.len() * 2,
                dropped,
            }
        } else {
            HealDecision::SoftHeal { reconnect: dropped }
        };

        tracing::debug!(connected = now.len(), churn, ?decision, "monitor cycle");
        inner.last_connected = now;
        inner.reported_drops.clear();
        inner.cycles += 1;
        inner.state = MonitorState::Idle;
        decision
    }

    /// Penalize connected peers that are persistently slow and clear the
    /// flag on peers that recovered.
    pub fn check_latency(
        &self,
        connected: &[PeerId],
        latency: &LatencyWindow,
        reputation: &ReputationEngine,
    ) -> Vec<SlowPeerChange> {
        let mut changes = Vec::new();
        for peer in connected {
            let Some(avg) = latency.average(peer) else {
                continue;
            };
            if avg > self.params.slow_latency_ms {
                if reputation.score_or_neutral(peer) > self.params.slow_score_floor {
                    reputation.record_event(BehaviorEvent::new(
                        peer.clone(),
                        BehaviorMetric::LatencyPenalty { ms: avg },
                    ));
                    reputation.mark_slow(peer);
                    changes.push(SlowPeerChange::Penalized {
                        peer: peer.clone(),
                        latency_ms: avg,
                    });
                }
            } else if reputation.is_slow(peer) {
                reputation.clear_slow(peer);
                changes.push(SlowPeerChange::Recovered {
                    peer: peer.clone(),
                    latency_ms: avg,
                });
            }
        }
        changes
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(MonitorParams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(ids: &[&str]) -> Vec<PeerId> {
        ids.iter().map(|s| PeerId::from(*s)).collect()
    }

    #[test]
    fn churn_ratio_handles_empty_window() {
        assert_eq!(churn_ratio(0, 0), 0.0);
        assert_eq!(churn_ratio(4, 1), 0.2);
    }

    #[test]
    fn stable_set_needs_no_action() {
        let monitor = HealthMonitor::default();
        let all = peers(&["a", "b", "c"]);
        assert_eq!(monitor.observe(&all), HealDecision::NoAction);
        assert_eq!(monitor.observe(&all), HealDecision::NoAction);
        assert_eq!(monitor.state(), MonitorState::Idle);
        assert_eq!(monitor.cycles(), 2);
    }

    #[test]
    fn low_churn_soft_heals() {
        let monitor = HealthMonitor::default();
        monitor.observe(&peers(&["a", "b", "c", "d", "e", "f"]));
        // 1 dropped / (5 connected + 1 dropped) ≈ 0.17 < 0.20
        let decision = monitor.observe(&peers(&["a", "b", "c", "d", "e"]));
        assert_eq!(
            decision,
            HealDecision::SoftHeal {
                reconnect: peers(&["f"])
            }
        );
    }

    #[test]
    fn high_churn_heals_aggressively() {
        let monitor = HealthMonitor::default();
        monitor.observe(&peers(&["a", "b", "c", "d"]));
        let decision = monitor.observe(&peers(&["a", "b"]));
        assert_eq!(
            decision,
            HealDecision::AggressiveHeal {
                dropped: peers(&["c", "d"]),
                discover: 4,
            }
        );
    }

    #[test]
    fn churn_exactly_at_threshold_is_aggressive() {
        let monitor = HealthMonitor::default();
        monitor.observe(&peers(&["a", "b", "c", "d", "e"]));
        // 1 / (4 + 1) = 0.20
        let decision = monitor.observe(&peers(&["a", "b", "c", "d"]));
        assert!(matches!(decision, HealDecision::AggressiveHeal { .. }));
    }

    #[test]
    fn reported_disconnect_counts_even_if_never_observed() {
        let monitor = HealthMonitor::default();
        monitor.note_disconnected(&"z".into());
        let decision = monitor.observe(&peers(&["a", "b", "c", "d", "e", "f"]));
        assert!(matches!(decision, HealDecision::SoftHeal { ref reconnect } if reconnect == &peers(&["z"])));
    }

    #[test]
    fn reconnected_peer_is_not_dropped() {
        let monitor = HealthMonitor::default();
        monitor.note_disconnected(&"a".into());
        monitor.note_connected(&"a".into());
        assert_eq!(monitor.observe(&peers(&["a"])), HealDecision::NoAction);
    }

    #[test]
    fn latency_window_is_bounded_mean() {
        let window = LatencyWindow::new();
        let p: PeerId = "p".into();
        assert!(window.average(&p).is_none());
        for _ in 0..LATENCY_WINDOW {
            window.record(&p, 100.0);
        }
        window.record(&p, 900.0);
        let avg = window.average(&p).unwrap();
        assert!((avg - 200.0).abs() < 1e-9, "avg {avg}");
    }

    #[test]
    fn slow_peer_is_penalized_then_recovers() {
        let monitor = HealthMonitor::default();
        let window = LatencyWindow::new();
        let reputation = ReputationEngine::default();
        let p: PeerId = "p".into();
        window.record(&p, 1500.0);

        let changes = monitor.check_latency(&[p.clone()], &window, &reputation);
        assert_eq!(changes.len(), 1);
        assert!(matches!(changes[0], SlowPeerChange::Penalized { .. }));
        assert!(reputation.is_slow(&p));
        assert_eq!(reputation.get_score(&p).unwrap().latency_ms, 1500.0);

        window.forget(&p);
        window.record(&p, 50.0);
        let changes = monitor.check_latency(&[p.clone()], &window, &reputation);
        assert!(matches!(changes[0], SlowPeerChange::Recovered { .. }));
        assert!(!reputation.is_slow(&p));
    }

    #[test]
    fn peer_at_floor_is_not_penalized_again() {
        let monitor = HealthMonitor::new(MonitorParams {
            slow_score_floor: 0.9,
            ..MonitorParams::default()
        });
        let window = LatencyWindow::new();
        let reputation = ReputationEngine::default();
        let p: PeerId = "p".into();
        window.record(&p, 5000.0);
        assert!(monitor.check_latency(&[p.clone()], &window, &reputation).is_empty());
        assert!(reputation.get_score(&p).is_none());
    }
}
