//! Optional secondary analysis over aggregated partial results.

use crate::aggregator::Scores;
use crate::error::{CoordinatorError, Result};
use concord_abstraction::{AnalysisInput, Analyzer, BackendResult, Payload, PredictionRequest};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What the secondary stage produced for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum SecondaryOutcome {
    /// The analyzer answered.
    Completed(Payload),
    /// The stage did not run.
    Skipped,
    /// The analyzer failed; the response is still returned.
    Failed(String),
}

/// Runs one analyzer call after aggregation. Never fails the request.
#[derive(Clone)]
pub struct SecondaryStage {
    analyzer: Option<Arc<dyn Analyzer>>,
    timeout: Duration,
}

impl std::fmt::Debug for SecondaryStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecondaryStage")
            .field("analyzer", &self.analyzer.as_ref().map(|a| a.id().to_string()))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl SecondaryStage {
    /// Creates a stage around `analyzer`, bounded by `timeout`.
    #[must_use]
    pub fn new(analyzer: Option<Arc<dyn Analyzer>>, timeout: Duration) -> Self {
        Self { analyzer, timeout }
    }

    /// A stage that never runs.
    #[cfg(test)]
    pub(crate) fn disabled() -> Self {
        Self { analyzer: None, timeout: Duration::ZERO }
    }

    /// Whether an analyzer is configured.
    pub fn is_configured(&self) -> bool {
        self.analyzer.is_some()
    }

    /// Runs only when the caller allows it, an analyzer is configured and
    /// at least one backend succeeded.
    pub fn should_run(&self, request: &PredictionRequest, results: &[BackendResult]) -> bool {
        !request.skip_secondary
            && self.analyzer.is_some()
            && results.iter().any(BackendResult::is_success)
    }

    /// Calls the analyzer once under the stage timeout.
    ///
    /// # Errors
    /// Returns `SecondaryAnalysisFailed` if no analyzer is configured, the
    /// analyzer fails, or it exceeds the timeout.
    pub async fn analyze(
        &self,
        request: &PredictionRequest,
        results: &[BackendResult],
        scores: Scores,
    ) -> Result<Payload> {
        let analyzer = self.analyzer.as_ref().ok_or_else(|| {
            CoordinatorError::SecondaryAnalysisFailed("no analyzer configured".to_string())
        })?;
        let input = AnalysisInput {
            request,
            results,
            coordination_score: scores.coordination,
            coherence_score: scores.coherence,
        };

        match tokio::time::timeout(self.timeout, analyzer.analyze(&input)).await {
            Ok(Ok(analysis)) => Ok(analysis),
            Ok(Err(err)) => Err(CoordinatorError::SecondaryAnalysisFailed(err.to_string())),
            Err(_) => Err(CoordinatorError::SecondaryAnalysisFailed(format!(
                "analyzer '{}' timed out after {}ms",
                analyzer.id(),
                self.timeout.as_millis()
            ))),
        }
    }

    /// Runs the stage if it applies, turning failures into an outcome.
    pub async fn run(
        &self,
        request: &PredictionRequest,
        results: &[BackendResult],
        scores: Scores,
    ) -> SecondaryOutcome {
        if !self.should_run(request, results) {
            debug!(fingerprint = %request.fingerprint, "Secondary analysis skipped");
            return SecondaryOutcome::Skipped;
        }

        match self.analyze(request, results, scores).await {
            Ok(analysis) => SecondaryOutcome::Completed(analysis),
            Err(err) => {
                warn!(fingerprint = %request.fingerprint, error = %err, "Secondary analysis failed");
                SecondaryOutcome::Failed(err.to_string())
            }
        }
    }
}
