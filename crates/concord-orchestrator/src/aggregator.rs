//! Score aggregation over backend results.

use concord_abstraction::BackendResult;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Coherence reported when fewer than two confidences are available.
pub const NEUTRAL_COHERENCE: f64 = 0.5;

/// Scores for one fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    /// Weighted fraction of backends that succeeded, in `[0, 1]`.
    pub coordination: f64,
    /// Agreement of successful confidences, in `[0, 1]`.
    pub coherence: f64,
}

/// Computes coordination and coherence scores.
#[derive(Debug, Clone)]
pub struct ScoreAggregator {
    /// Weights from backend configuration, keyed by backend ID.
    configured_weights: HashMap<String, f64>,
    /// Standard deviation at which coherence reaches zero.
    coherence_normalization: f64,
}

impl ScoreAggregator {
    /// Creates an aggregator with configured weights and coherence normalization.
    #[must_use]
    pub fn new(configured_weights: HashMap<String, f64>, coherence_normalization: f64) -> Self {
        Self { configured_weights, coherence_normalization }
    }

    /// Aggregates results into scores.
    ///
    /// `coordination` is the sum of effective weights of successful backends.
    /// `coherence` is `1 - stddev / normalization` over successful
    /// confidences, clamped into `[0, 1]`.
    pub fn aggregate(&self, results: &[BackendResult], overrides: &BTreeMap<String, f64>) -> Scores {
        if results.is_empty() {
            return Scores { coordination: 0.0, coherence: NEUTRAL_COHERENCE };
        }

        let weights = self.effective_weights(results, overrides);
        let coordination: f64 = results
            .iter()
            .zip(&weights)
            .filter(|(result, _)| result.is_success())
            .map(|(_, weight)| weight)
            .sum();

        let confidences: Vec<f64> = results
            .iter()
            .filter(|result| result.is_success())
            .filter_map(|result| result.confidence)
            .collect();

        Scores {
            coordination: coordination.clamp(0.0, 1.0),
            coherence: coherence(&confidences, self.coherence_normalization),
        }
    }

    /// Effective weight of each result's backend, in result order, summing to 1.
    ///
    /// Per backend: the request override, else the configured weight, else
    /// the uniform share `1/N`. If everything comes out zero, all backends
    /// get `1/N`.
    pub fn effective_weights(
        &self,
        results: &[BackendResult],
        overrides: &BTreeMap<String, f64>,
    ) -> Vec<f64> {
        let count = results.len();
        if count == 0 {
            return Vec::new();
        }
        let uniform = 1.0 / count as f64;

        let raw: Vec<f64> = results
            .iter()
            .map(|result| {
                overrides
                    .get(&result.backend_id)
                    .or_else(|| self.configured_weights.get(&result.backend_id))
                    .copied()
                    .filter(|w| w.is_finite())
                    .map_or(uniform, |w| w.clamp(0.0, 1.0))
            })
            .collect();

        let total: f64 = raw.iter().sum();
        if total <= 0.0 {
            return vec![uniform; count];
        }
        raw.into_iter().map(|w| w / total).collect()
    }
}

/// Agreement among confidences: `max(0, 1 - population_stddev / normalization)`.
///
/// Fewer than two confidences yield the neutral 0.5.
pub fn coherence(confidences: &[f64], normalization: f64) -> f64 {
    if confidences.len() < 2 {
        return NEUTRAL_COHERENCE;
    }
    if normalization <= 0.0 || !normalization.is_finite() {
        return NEUTRAL_COHERENCE;
    }

    let n = confidences.len() as f64;
    let mean = confidences.iter().sum::<f64>() / n;
    let variance = confidences.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
    (1.0 - variance.sqrt() / normalization).clamp(0.0, 1.0)
}
