use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::DEFAULT_TTL;

/// Node configuration for the relay core.
///
/// All fields have defaults. Use the builder setters, or deserialize from
/// JSON (missing fields fall back to the defaults):
///
/// ```rust
/// use relaymesh_protocol::MeshConfig;
///
/// let config = MeshConfig::new()
///     .default_ttl(5)
///     .max_paths(2);
/// assert_eq!(config.default_ttl, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Hop budget given to messages this node injects.
    pub default_ttl: u32,
    /// Peers scoring below this are never part of a selected route.
    pub blacklist_threshold: f64,
    /// Maximum number of parallel paths for a multi-path send.
    pub max_paths: usize,
    /// Maximum simultaneous in-flight transport sends.
    pub max_concurrent_sends: usize,
    /// Hard capacity of the priority queue.
    pub queue_capacity: usize,
    /// Churn ratio at or above which the monitor heals aggressively.
    pub churn_threshold: f64,
    /// Interval between monitor cycles.
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,
    /// Distinct witnesses needed before a ledger entry counts as durable.
    pub witness_threshold: usize,
    /// How long an own pending entry waits for its countersignature before
    /// the node rejects it and moves on.
    #[serde(with = "duration_ms")]
    pub ledger_accept_timeout: Duration,

    /// Capacity of the processed-message recency set.
    pub processed_capacity: usize,
    /// Send attempts after the first before an item is dropped.
    pub retry_limit: u32,
    /// Blend factor applied to each new raw reputation score.
    pub reputation_alpha: f64,
    /// Latency (ms) that maps to the worst latency metric.
    pub latency_ceiling_ms: f64,
    /// Average latency (ms) above which a connected peer is marked slow.
    pub slow_latency_ms: f64,
    /// Peers at or below this score are not worth a latency penalty.
    pub slow_score_floor: f64,
    /// Learned routes kept per destination.
    pub routes_per_destination: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshConfig {
    pub fn new() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            blacklist_threshold: 0.10,
            max_paths: 3,
            max_concurrent_sends: 5,
            queue_capacity: 1024,
            churn_threshold: 0.20,
            health_check_interval: Duration::from_secs(10),
            witness_threshold: 3,
            ledger_accept_timeout: Duration::from_secs(30),
            processed_capacity: 1000,
            retry_limit: 3,
            reputation_alpha: 0.4,
            latency_ceiling_ms: 2000.0,
            slow_latency_ms: 1000.0,
            slow_score_floor: 0.20,
            routes_per_destination: 8,
        }
    }

    /// Parse a JSON document; absent fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Self>(json).map(Self::sanitized)
    }

    pub fn default_ttl(mut self, ttl: u32) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn blacklist_threshold(mut self, threshold: f64) -> Self {
        self.blacklist_threshold = threshold;
        self
    }

    pub fn max_paths(mut self, paths: usize) -> Self {
        self.max_paths = paths;
        self
    }

    pub fn max_concurrent_sends(mut self, sends: usize) -> Self {
        self.max_concurrent_sends = sends;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn churn_threshold(mut self, threshold: f64) -> Self {
        self.churn_threshold = threshold;
        self
    }

    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn witness_threshold(mut self, witnesses: usize) -> Self {
        self.witness_threshold = witnesses;
        self
    }

    pub fn ledger_accept_timeout(mut self, timeout: Duration) -> Self {
        self.ledger_accept_timeout = timeout;
        self
    }

    pub fn retry_limit(mut self, retries: u32) -> Self {
        self.retry_limit = retries;
        self
    }

    pub fn reputation_alpha(mut self, alpha: f64) -> Self {
        self.reputation_alpha = alpha;
        self
    }

    pub fn slow_latency_ms(mut self, ms: f64) -> Self {
        self.slow_latency_ms = ms;
        self
    }

    /// Clamp out-of-range values to the nearest safe setting.
    ///
    /// Counts and capacities never go below 1, ratios stay inside [0, 1].
    /// Each correction is logged; nothing here fails.
    pub fn sanitized(mut self) -> Self {
        clamp_min(&mut self.default_ttl, 1, "default_ttl");
        clamp_min(&mut self.max_paths, 1, "max_paths");
        clamp_min(&mut self.max_concurrent_sends, 1, "max_concurrent_sends");
        clamp_min(&mut self.queue_capacity, 1, "queue_capacity");
        clamp_min(&mut self.witness_threshold, 1, "witness_threshold");
        clamp_min(&mut self.processed_capacity, 1, "processed_capacity");
        clamp_min(&mut self.routes_per_destination, 1, "routes_per_destination");

        clamp_unit(&mut self.blacklist_threshold, 0.10, "blacklist_threshold");
        clamp_unit(&mut self.churn_threshold, 0.20, "churn_threshold");
        clamp_unit(&mut self.slow_score_floor, 0.20, "slow_score_floor");

        // Alpha of 0 would freeze every score; keep it strictly positive.
        if !(self.reputation_alpha > 0.0 && self.reputation_alpha <= 1.0) {
            tracing::warn!(value = self.reputation_alpha, "reputation_alpha out of range, using 0.4");
            self.reputation_alpha = 0.4;
        }
        if !(self.latency_ceiling_ms >= 1.0) {
            tracing::warn!(value = self.latency_ceiling_ms, "latency_ceiling_ms clamped to 1");
            self.latency_ceiling_ms = 1.0;
        }
        if !(self.slow_latency_ms >= 1.0) {
            tracing::warn!(value = self.slow_latency_ms, "slow_latency_ms clamped to 1");
            self.slow_latency_ms = 1.0;
        }
        if self.health_check_interval.is_zero() {
            tracing::warn!("health_check_interval was zero, clamped to 1s");
            self.health_check_interval = Duration::from_secs(1);
        }
        self
    }
}

fn clamp_min<T: PartialOrd + Copy + std::fmt::Debug>(value: &mut T, min: T, name: &str) {
    if *value < min {
        tracing::warn!(field = name, value = ?*value, min = ?min, "config value clamped");
        *value = min;
    }
}

fn clamp_unit(value: &mut f64, fallback: f64, name: &str) {
    if value.is_nan() {
        tracing::warn!(field = name, "config value is NaN, using default");
        *value = fallback;
    } else if !(0.0..=1.0).contains(value) {
        tracing::warn!(field = name, value = *value, "config ratio clamped to [0, 1]");
        *value = value.clamp(0.0, 1.0);
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = MeshConfig::default();
        assert_eq!(c.default_ttl, 3);
        assert_eq!(c.blacklist_threshold, 0.10);
        assert_eq!(c.max_paths, 3);
        assert_eq!(c.max_concurrent_sends, 5);
        assert_eq!(c.churn_threshold, 0.20);
        assert_eq!(c.health_check_interval, Duration::from_secs(10));
        assert_eq!(c.witness_threshold, 3);
        assert_eq!(c.ledger_accept_timeout, Duration::from_secs(30));
        assert_eq!(c.processed_capacity, 1000);
    }

    #[test]
    fn zero_counts_clamp_to_one() {
        let c = MeshConfig::new()
            .max_paths(0)
            .max_concurrent_sends(0)
            .queue_capacity(0)
            .witness_threshold(0)
            .default_ttl(0)
            .sanitized();
        assert_eq!(c.max_paths, 1);
        assert_eq!(c.max_concurrent_sends, 1);
        assert_eq!(c.queue_capacity, 1);
        assert_eq!(c.witness_threshold, 1);
        assert_eq!(c.default_ttl, 1);
    }

    #[test]
    fn ratios_clamp_into_unit_interval() {
        let c = MeshConfig::new()
            .blacklist_threshold(-0.5)
            .churn_threshold(3.0)
            .reputation_alpha(0.0)
            .sanitized();
        assert_eq!(c.blacklist_threshold, 0.0);
        assert_eq!(c.churn_threshold, 1.0);
        assert_eq!(c.reputation_alpha, 0.4);
    }

    #[test]
    fn json_partial_document_keeps_defaults() {
        let c = MeshConfig::from_json(r#"{"max_paths": 5, "health_check_interval": 2500, "ledger_accept_timeout": 800}"#)
            .unwrap();
        assert_eq!(c.max_paths, 5);
        assert_eq!(c.health_check_interval, Duration::from_millis(2500));
        assert_eq!(c.ledger_accept_timeout, Duration::from_millis(800));
        assert_eq!(c.default_ttl, 3);
    }

    #[test]
    fn json_sanitizes_bad_values() {
        let c = MeshConfig::from_json(r#"{"max_paths": 0}"#).unwrap();
        assert_eq!(c.max_paths, 1);
    }
}
