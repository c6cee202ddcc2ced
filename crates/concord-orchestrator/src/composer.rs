//! Response composition and the per-request pipeline state machine.

use crate::aggregator::Scores;
use crate::error::{CoordinatorError, Result};
use crate::secondary::SecondaryOutcome;
use chrono::{DateTime, Utc};
use concord_abstraction::{BackendResult, Payload};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Whether the secondary stage contributed to a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecondaryStatus {
    /// The analysis is attached.
    Completed,
    /// The stage did not run.
    Skipped,
    /// The stage ran and failed; see `secondary_error`.
    Failed,
}

/// The unified answer to one prediction request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposedResponse {
    /// Fingerprint of the request this answers.
    pub fingerprint: String,
    /// One result per configured backend, in configuration order.
    pub backend_results: Vec<BackendResult>,
    /// Weighted fraction of backends that succeeded.
    pub coordination_score: f64,
    /// Agreement among successful confidences.
    pub coherence_score: f64,
    /// Secondary analysis, when it completed.
    pub secondary_analysis: Option<Payload>,
    /// Whether the secondary stage completed, was skipped, or failed.
    pub secondary: SecondaryStatus,
    /// Why the secondary stage failed.
    pub secondary_error: Option<String>,
    /// `true` when at least one backend did not succeed.
    pub degraded: bool,
    /// When the response was composed.
    pub computed_at: DateTime<Utc>,
}

impl ComposedResponse {
    /// Number of backends that succeeded.
    pub fn succeeded(&self) -> usize {
        self.backend_results.iter().filter(|r| r.is_success()).count()
    }

    /// Result of one backend.
    pub fn result(&self, backend_id: &str) -> Option<&BackendResult> {
        self.backend_results.iter().find(|r| r.backend_id == backend_id)
    }

    #[cfg(test)]
    pub(crate) fn for_tests(fingerprint: &str, computed_at: DateTime<Utc>) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            backend_results: Vec::new(),
            coordination_score: 0.0,
            coherence_score: 0.5,
            secondary_analysis: None,
            secondary: SecondaryStatus::Skipped,
            secondary_error: None,
            degraded: false,
            computed_at,
        }
    }
}

/// Stages a request passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Normalized, nothing dispatched yet.
    Created,
    /// Backends are being called.
    Dispatching,
    /// Results are being scored.
    Aggregating,
    /// The secondary analyzer is running.
    SecondaryAnalysis,
    /// The response is assembled.
    Composed,
    /// No backend succeeded.
    Failed,
}

impl PipelineState {
    /// Whether `next` is a legal successor of this state.
    pub fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Dispatching)
                | (Self::Dispatching, Self::Aggregating)
                | (Self::Aggregating, Self::SecondaryAnalysis | Self::Composed | Self::Failed)
                | (Self::SecondaryAnalysis, Self::Composed)
        )
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Composed | Self::Failed)
    }
}

/// Tracks one request through the pipeline and assembles its response.
#[derive(Debug)]
pub struct ResponseComposer {
    fingerprint: String,
    state: PipelineState,
}

impl ResponseComposer {
    /// Starts tracking a request in the `Created` state.
    #[must_use]
    pub fn new(fingerprint: impl Into<String>) -> Self {
        Self { fingerprint: fingerprint.into(), state: PipelineState::Created }
    }

    /// Current state.
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Moves to `next`, logging the transition.
    pub fn advance(&mut self, next: PipelineState) {
        if !self.state.can_advance_to(next) {
            warn!(
                fingerprint = %self.fingerprint,
                from = ?self.state,
                to = ?next,
                "Unexpected pipeline transition"
            );
        }
        debug!(fingerprint = %self.fingerprint, from = ?self.state, to = ?next, "Pipeline transition");
        self.state = next;
    }

    /// Marks the request failed because no backend succeeded.
    pub fn fail(&mut self, attempted: usize) -> CoordinatorError {
        self.advance(PipelineState::Failed);
        CoordinatorError::AggregationFailed { attempted }
    }

    /// Assembles the response.
    ///
    /// # Errors
    /// Returns `AggregationFailed` if no result is a success.
    pub fn compose(
        &mut self,
        backend_results: Vec<BackendResult>,
        scores: Scores,
        secondary: SecondaryOutcome,
    ) -> Result<ComposedResponse> {
        if !backend_results.iter().any(BackendResult::is_success) {
            return Err(self.fail(backend_results.len()));
        }

        let degraded = backend_results.iter().any(|r| !r.is_success());
        let (secondary_analysis, secondary, secondary_error) = match secondary {
            SecondaryOutcome::Completed(analysis) => (Some(analysis), SecondaryStatus::Completed, None),
            SecondaryOutcome::Skipped => (None, SecondaryStatus::Skipped, None),
            SecondaryOutcome::Failed(detail) => (None, SecondaryStatus::Failed, Some(detail)),
        };

        self.advance(PipelineState::Composed);
        Ok(ComposedResponse {
            fingerprint: self.fingerprint.clone(),
            backend_results,
            coordination_score: scores.coordination,
            coherence_score: scores.coherence,
            secondary_analysis,
            secondary,
            secondary_error,
            degraded,
            computed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_abstraction::BackendReply;
    use serde_json::json;
    use std::time::Duration;

    fn scores() -> Scores {
        Scores { coordination: 0.5, coherence: 0.5 }
    }

    fn aggregating(fingerprint: &str) -> ResponseComposer {
        let mut composer = ResponseComposer::new(fingerprint);
        composer.advance(PipelineState::Dispatching);
        composer.advance(PipelineState::Aggregating);
        composer
    }

    #[test]
    fn test_transitions() {
        type S = PipelineState;
        assert!(S::Created.can_advance_to(S::Dispatching));
        assert!(S::Aggregating.can_advance_to(S::Composed));
        assert!(S::Aggregating.can_advance_to(S::Failed));
        assert!(S::SecondaryAnalysis.can_advance_to(S::Composed));
        assert!(!S::Created.can_advance_to(S::Composed));
        assert!(!S::Composed.can_advance_to(S::Dispatching));
        assert!(!S::SecondaryAnalysis.can_advance_to(S::Failed));
        assert!(S::Composed.is_terminal() && S::Failed.is_terminal());
    }

    #[test]
    fn test_compose_degraded_with_failed_secondary() {
        let results = vec![
            BackendResult::success("a", BackendReply::default(), Duration::ZERO),
            BackendResult::timeout("b", Duration::from_millis(200), "deadline"),
        ];
        let mut composer = aggregating("fp");
        let response = composer
            .compose(results, scores(), SecondaryOutcome::Failed("analyzer down".to_string()))
            .unwrap();

        assert_eq!(composer.state(), PipelineState::Composed);
        assert!(response.degraded);
        assert_eq!(response.succeeded(), 1);
        assert_eq!(response.secondary, SecondaryStatus::Failed);
        assert_eq!(response.secondary_error.as_deref(), Some("analyzer down"));
        assert!(response.secondary_analysis.is_none());
        assert!(response.result("b").is_some());
    }

    #[test]
    fn test_compose_attaches_analysis() {
        let results = vec![BackendResult::success("a", BackendReply::default(), Duration::ZERO)];
        let mut analysis = Payload::new();
        analysis.insert("risk".to_string(), json!("low"));

        let mut composer = aggregating("fp");
        composer.advance(PipelineState::SecondaryAnalysis);
        let response =
            composer.compose(results, scores(), SecondaryOutcome::Completed(analysis)).unwrap();

        assert!(!response.degraded);
        assert_eq!(response.secondary, SecondaryStatus::Completed);
        assert_eq!(response.secondary_analysis.unwrap()["risk"], json!("low"));
    }

    #[test]
    fn test_compose_without_success_fails() {
        let results = vec![
            BackendResult::timeout("a", Duration::ZERO, "deadline"),
            BackendResult::error("b", Duration::ZERO, "HTTP 500"),
        ];
        let mut composer = aggregating("fp");
        let err = composer.compose(results, scores(), SecondaryOutcome::Skipped).unwrap_err();

        assert_eq!(err, CoordinatorError::AggregationFailed { attempted: 2 });
        assert_eq!(composer.state(), PipelineState::Failed);
    }

    #[test]
    fn test_response_serialization() {
        let response = ComposedResponse::for_tests("fp", Utc::now());
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["secondary"], json!("skipped"));
        assert_eq!(value["fingerprint"], json!("fp"));
        assert!(value["computed_at"].is_string());
    }
}
