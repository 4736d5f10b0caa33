//! Behavior metrics. Aggregates observed events for one peer and turns
//! them into a raw trust score in [0, 1].
//!
//! Five metrics, each normalized to [0, 1] before weighting: relay success
//! rate, latency/jitter, availability, forgery attempts (inverse) and sybil
//! confidence (inverse). Metrics without samples sit at the neutral midpoint.

use serde::{Deserialize, Serialize};

use crate::types::NEUTRAL_SCORE;

/// Smoothing factor for the latency and availability moving averages.
const EWMA_WEIGHT: f64 = 0.3;

/// Exponent applied to the forgery metric; each forgery report cuts trust hard.
const FORGERY_EXPONENT: i32 = 3;

/// One observation about a peer, with the value that was observed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "metric")]
pub enum BehaviorMetric {
    RelaySuccess,
    RelayFailure,
    /// Round-trip or send latency sample.
    Latency { ms: f64 },
    /// Sustained-slowness penalty issued by the healing monitor.
    LatencyPenalty { ms: f64 },
    /// Fraction of the observation window the peer was reachable.
    Availability { uptime: f64 },
    ForgeryAttempt,
    SybilSignal { confidence: f64 },
}

/// Relative weight of each metric. Always normalized to sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub relay_success: f64,
    pub latency: f64,
    pub availability: f64,
    pub forgery: f64,
    pub sybil: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            relay_success: 0.30,
            latency: 0.15,
            availability: 0.20,
            forgery: 0.25,
            sybil: 0.10,
        }
    }
}

impl ScoreWeights {
    fn sum(&self) -> f64 {
        self.relay_success + self.latency + self.availability + self.forgery + self.sybil
    }

    /// Scale the weights so they sum to 1.
    ///
    /// Returns `None` when any weight is negative or non-finite, or when
    /// they are all zero.
    pub fn normalized(self) -> Option<Self> {
        let parts = [
            self.relay_success,
            self.latency,
            self.availability,
            self.forgery,
            self.sybil,
        ];
        if parts.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return None;
        }
        let sum = self.sum();
        if sum <= 0.0 {
            return None;
        }
        Some(Self {
            relay_success: self.relay_success / sum,
            latency: self.latency / sum,
            availability: self.availability / sum,
            forgery: self.forgery / sum,
            sybil: self.sybil / sum,
        })
    }

    /// Shift weight onto the forgery metric as forgery evidence grows.
    ///
    /// `severity` in [0, 1]: 0 leaves the weights untouched, 1 puts all of
    /// the weight on forgery. The result still sums to 1.
    pub fn escalate_forgery(self, severity: f64) -> Self {
        let severity = severity.clamp(0.0, 1.0);
        let forgery = self.forgery + (1.0 - self.forgery) * severity;
        let rest = 1.0 - self.forgery;
        let scale = if rest > 0.0 { (1.0 - forgery) / rest } else { 0.0 };
        Self {
            relay_success: self.relay_success * scale,
            latency: self.latency * scale,
            availability: self.availability * scale,
            forgery,
            sybil: self.sybil * scale,
        }
    }
}

/// Aggregated counters for one peer. Raw events are folded in and dropped.
#[derive(Debug, Clone, Default)]
pub struct BehaviorMetrics {
    pub relays_ok: u64,
    pub relays_failed: u64,
    /// Moving average latency; `None` until the first sample.
    pub latency_ms: Option<f64>,
    /// Moving average of absolute deviation from `latency_ms`.
    pub jitter_ms: f64,
    pub availability: Option<f64>,
    pub forgery_attempts: u64,
    pub sybil_confidence: f64,
}

impl BehaviorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one observation into the aggregate.
    pub fn record(&mut self, metric: BehaviorMetric) {
        match metric {
            BehaviorMetric::RelaySuccess => self.relays_ok += 1,
            BehaviorMetric::RelayFailure => self.relays_failed += 1,
            BehaviorMetric::Latency { ms } | BehaviorMetric::LatencyPenalty { ms } => {
                self.record_latency(ms)
            }
            BehaviorMetric::Availability { uptime } => {
                let uptime = sanitize_unit(uptime);
                self.availability = Some(match self.availability {
                    Some(prev) => prev + EWMA_WEIGHT * (uptime - prev),
                    None => uptime,
                });
            }
            BehaviorMetric::ForgeryAttempt => self.forgery_attempts += 1,
            BehaviorMetric::SybilSignal { confidence } => {
                self.sybil_confidence = sanitize_unit(confidence);
            }
        }
    }

    fn record_latency(&mut self, ms: f64) {
        let ms = if ms.is_finite() { ms.max(0.0) } else { return };
        match self.latency_ms {
            Some(avg) => {
                let deviation = (ms - avg).abs();
                self.jitter_ms += EWMA_WEIGHT * (deviation - self.jitter_ms);
                self.latency_ms = Some(avg + EWMA_WEIGHT * (ms - avg));
            }
            None => self.latency_ms = Some(ms),
        }
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.relays_ok + self.relays_failed;
        if total == 0 {
            NEUTRAL_SCORE
        } else {
            self.relays_ok as f64 / total as f64
        }
    }

    pub fn latency_metric(&self, ceiling_ms: f64) -> f64 {
        match self.latency_ms {
            Some(avg) => 1.0 - ((avg + self.jitter_ms) / ceiling_ms.max(1.0)).min(1.0),
            None => NEUTRAL_SCORE,
        }
    }

    pub fn availability_metric(&self) -> f64 {
        self.availability.unwrap_or(NEUTRAL_SCORE)
    }

    pub fn forgery_metric(&self) -> f64 {
        1.0 / (1.0 + self.forgery_attempts as f64).powi(FORGERY_EXPONENT)
    }

    pub fn sybil_metric(&self) -> f64 {
        1.0 - self.sybil_confidence
    }

    /// Weighted sum of the normalized metrics, in [0, 1].
    pub fn raw_score(&self, weights: &ScoreWeights, latency_ceiling_ms: f64) -> f64 {
        let forgery = self.forgery_metric();
        let w = weights.escalate_forgery(1.0 - forgery);
        let raw = w.relay_success * self.success_rate()
            + w.latency * self.latency_metric(latency_ceiling_ms)
            + w.availability * self.availability_metric()
            + w.forgery * forgery
            + w.sybil * self.sybil_metric();
        raw.clamp(0.0, 1.0)
    }
}

fn sanitize_unit(v: f64) -> f64 {
    if v.is_nan() {
        NEUTRAL_SCORE
    } else {
        v.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CEILING: f64 = 2000.0;

    fn assert_sums_to_one(w: &ScoreWeights) {
        let sum = w.relay_success + w.latency + w.availability + w.forgery + w.sybil;
        assert!((sum - 1.0).abs() < 1e-9, "weights sum to {sum}");
    }

    #[test]
    fn default_weights_sum_to_one() {
        assert_sums_to_one(&ScoreWeights::default());
    }

    #[test]
    fn normalized_rescales_and_rejects_zero() {
        let w = ScoreWeights {
            relay_success: 2.0,
            latency: 2.0,
            availability: 2.0,
            forgery: 2.0,
            sybil: 2.0,
        }
        .normalized()
        .unwrap();
        assert_sums_to_one(&w);
        assert!((w.latency - 0.2).abs() < 1e-9);

        let zero = ScoreWeights {
            relay_success: 0.0,
            latency: 0.0,
            availability: 0.0,
            forgery: 0.0,
            sybil: 0.0,
        };
        assert!(zero.normalized().is_none());
    }

    #[test]
    fn escalation_keeps_sum_at_one() {
        for severity in [0.0, 0.25, 0.5, 0.9, 1.0] {
            let w = ScoreWeights::default().escalate_forgery(severity);
            assert_sums_to_one(&w);
        }
        let full = ScoreWeights::default().escalate_forgery(1.0);
        assert!((full.forgery - 1.0).abs() < 1e-9);
    }

    #[test]
    fn fresh_metrics_are_neutral_except_clean_record() {
        let m = BehaviorMetrics::new();
        assert_eq!(m.success_rate(), 0.5);
        assert_eq!(m.latency_metric(CEILING), 0.5);
        assert_eq!(m.availability_metric(), 0.5);
        assert_eq!(m.forgery_metric(), 1.0);
        assert_eq!(m.sybil_metric(), 1.0);
    }

    #[test]
    fn forgery_collapses_raw_score() {
        let mut m = BehaviorMetrics::new();
        let clean = m.raw_score(&ScoreWeights::default(), CEILING);
        m.record(BehaviorMetric::ForgeryAttempt);
        let once = m.raw_score(&ScoreWeights::default(), CEILING);
        m.record(BehaviorMetric::ForgeryAttempt);
        let twice = m.raw_score(&ScoreWeights::default(), CEILING);
        assert!(once < clean && twice < once, "{clean} > {once} > {twice}");
        assert!(twice < 0.1);
    }

    #[test]
    fn latency_and_jitter_lower_latency_metric() {
        let mut steady = BehaviorMetrics::new();
        let mut jumpy = BehaviorMetrics::new();
        for _ in 0..10 {
            steady.record(BehaviorMetric::Latency { ms: 200.0 });
        }
        for i in 0..10 {
            let ms = if i % 2 == 0 { 50.0 } else { 350.0 };
            jumpy.record(BehaviorMetric::Latency { ms });
        }
        assert!(steady.latency_metric(CEILING) > jumpy.latency_metric(CEILING));
    }

    #[test]
    fn latency_beyond_ceiling_is_zero() {
        let mut m = BehaviorMetrics::new();
        m.record(BehaviorMetric::LatencyPenalty { ms: 5000.0 });
        assert_eq!(m.latency_metric(CEILING), 0.0);
    }

    #[test]
    fn out_of_range_observations_are_clamped() {
        let mut m = BehaviorMetrics::new();
        m.record(BehaviorMetric::Availability { uptime: 7.0 });
        m.record(BehaviorMetric::SybilSignal { confidence: -3.0 });
        m.record(BehaviorMetric::Latency { ms: f64::NAN });
        assert_eq!(m.availability_metric(), 1.0);
        assert_eq!(m.sybil_metric(), 1.0);
        assert!(m.latency_ms.is_none());
    }
}
