/// Per-peer trust scores, built from observed behavior.
///
/// Scores live in [0, 1] and start at the neutral 0.5. Every observation
/// moves a score by at most `alpha` of the distance to the new raw value,
/// so a single bad report can never zero a peer.
pub mod engine;
pub mod scoring;

pub use engine::{BehaviorEvent, ReputationEngine, ReputationParams, ReputationScore};
pub use scoring::{BehaviorMetric, BehaviorMetrics, ScoreWeights};
