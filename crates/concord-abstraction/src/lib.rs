//! Backend abstraction layer for Concord.
//!
//! This crate defines the vocabulary shared by every part of the coordinator:
//! the canonical request, the per-backend result record, and the traits that
//! prediction backends and secondary analyzers implement.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Opaque JSON object carried through the coordinator without interpretation.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Represents an error that can occur when calling a backend.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackendError {
    /// Connection or transport failure, or a non-success status from the backend.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The backend did not answer within its bound.
    #[error("Backend timed out after {}ms", .0.as_millis())]
    Timeout(#[serde(with = "duration_ms")] Duration),

    /// The backend answered, but the response failed adapter-side validation.
    #[error("Malformed backend response: {0}")]
    MalformedResponse(String),

    /// The adapter could not be built from its configuration.
    #[error("Invalid backend configuration: {0}")]
    Configuration(String),

    /// Other unexpected errors.
    #[error("Other backend error: {0}")]
    Other(String),
}

impl BackendError {
    /// Machine-readable name of the error class.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "backend_unavailable",
            Self::Timeout(_) => "backend_timeout",
            Self::MalformedResponse(_) => "backend_malformed_response",
            Self::Configuration(_) => "backend_configuration",
            Self::Other(_) => "backend_error",
        }
    }

    /// Returns `true` if this error represents an exceeded time bound.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Validates a backend-reported confidence.
///
/// # Errors
/// Returns `BackendError::MalformedResponse` if the value is not a finite number in `[0, 1]`.
pub fn checked_confidence(value: f64) -> Result<f64, BackendError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(BackendError::MalformedResponse(format!("confidence {value} is outside [0, 1]")))
    }
}

/// The canonical, normalized form of one incoming prediction call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRequest {
    /// Deterministic hash of the normalized payload and context.
    pub fingerprint: String,
    /// Caller payload, forwarded to every backend.
    pub payload: Payload,
    /// Caller context, forwarded to every backend.
    pub context: Payload,
    /// Per-request weight overrides keyed by backend ID, each in `[0, 1]`.
    #[serde(default)]
    pub backend_weights: BTreeMap<String, f64>,
    /// Overall deadline for the fan-out.
    #[serde(rename = "deadline_ms", with = "duration_ms")]
    pub deadline: Duration,
    /// Skip the secondary analysis stage.
    #[serde(default)]
    pub skip_secondary: bool,
}

/// Terminal status of one backend invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    /// The backend answered with a valid response.
    Success,
    /// The backend failed (transport, status, or validation failure).
    Error,
    /// The backend exceeded its time bound or the overall deadline.
    Timeout,
}

/// A successful backend answer as seen by the adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendReply {
    /// Opaque backend output.
    pub payload: Payload,
    /// Backend-reported confidence, if the backend provides one.
    pub confidence: Option<f64>,
}

impl BackendReply {
    /// Creates a reply with no confidence.
    #[must_use]
    pub fn new(payload: Payload) -> Self {
        Self { payload, confidence: None }
    }

    /// Sets the reported confidence.
    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// The outcome of invoking one backend for one request.
///
/// Exactly one of these exists per configured backend per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendResult {
    /// ID of the backend that produced this result.
    pub backend_id: String,
    /// Terminal status.
    pub status: BackendStatus,
    /// Backend output on success.
    pub payload: Option<Payload>,
    /// Confidence in `[0, 1]` on success, if reported.
    pub confidence: Option<f64>,
    /// Wall-clock time spent on the invocation.
    #[serde(rename = "latency_ms", with = "duration_ms")]
    pub latency: Duration,
    /// Failure description for `Error` and `Timeout`.
    pub error_detail: Option<String>,
}

impl BackendResult {
    /// Builds a `Success` result from a backend reply.
    #[must_use]
    pub fn success(backend_id: impl Into<String>, reply: BackendReply, latency: Duration) -> Self {
        Self {
            backend_id: backend_id.into(),
            status: BackendStatus::Success,
            payload: Some(reply.payload),
            confidence: reply.confidence,
            latency,
            error_detail: None,
        }
    }

    /// Builds an `Error` or `Timeout` result from a classified backend error.
    #[must_use]
    pub fn failure(backend_id: impl Into<String>, error: &BackendError, latency: Duration) -> Self {
        let status =
            if error.is_timeout() { BackendStatus::Timeout } else { BackendStatus::Error };
        Self {
            backend_id: backend_id.into(),
            status,
            payload: None,
            confidence: None,
            latency,
            error_detail: Some(error.to_string()),
        }
    }

    /// Builds a `Timeout` result with a custom detail message.
    #[must_use]
    pub fn timeout(
        backend_id: impl Into<String>,
        latency: Duration,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            backend_id: backend_id.into(),
            status: BackendStatus::Timeout,
            payload: None,
            confidence: None,
            latency,
            error_detail: Some(detail.into()),
        }
    }

    /// Builds an `Error` result with a custom detail message.
    #[must_use]
    pub fn error(
        backend_id: impl Into<String>,
        latency: Duration,
        detail: impl Into<String>,
    ) -> Self {
        Self { status: BackendStatus::Error, ..Self::timeout(backend_id, latency, detail) }
    }

    /// Returns `true` if the backend answered successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == BackendStatus::Success
    }
}

/// Everything a secondary analyzer gets to look at.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisInput<'a> {
    /// The request that was fanned out.
    pub request: &'a PredictionRequest,
    /// All backend results, successful or not.
    pub results: &'a [BackendResult],
    /// Weighted fraction of backends that succeeded.
    pub coordination_score: f64,
    /// Agreement among successful confidences.
    pub coherence_score: f64,
}

/// A trait for downstream prediction backends.
///
/// Implementations hide their transport; the coordinator only sees replies and
/// classified errors. All backends must be `Send + Sync` so one instance can
/// serve concurrent fan-outs.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Returns the ID of the backend.
    fn id(&self) -> &str;

    /// Returns the backend's own time bound.
    fn timeout(&self) -> Duration;

    /// Sends the canonical request to the backend.
    ///
    /// # Errors
    /// Returns a classified `BackendError` on any failure.
    async fn predict(&self, request: &PredictionRequest) -> Result<BackendReply, BackendError>;

    /// Probes whether the backend is reachable.
    ///
    /// # Errors
    /// Returns a `BackendError` if the backend cannot be reached.
    async fn health_check(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// A trait for the optional secondary analysis stage.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Returns the ID of the analyzer.
    fn id(&self) -> &str;

    /// Analyzes the aggregated partial results.
    ///
    /// # Errors
    /// Returns a `BackendError` if the analysis could not be produced.
    async fn analyze(&self, input: &AnalysisInput<'_>) -> Result<Payload, BackendError>;
}

/// Serializes a `Duration` as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serializes the duration as milliseconds.
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    /// Deserializes milliseconds into a duration.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_failure_classifies_timeout() {
        let err = BackendError::Timeout(Duration::from_millis(250));
        let result = BackendResult::failure("a", &err, Duration::from_millis(251));
        assert_eq!(result.status, BackendStatus::Timeout);
        assert_eq!(result.error_detail.as_deref(), Some("Backend timed out after 250ms"));
    }

    #[test]
    fn test_failure_classifies_error() {
        let err = BackendError::MalformedResponse("not an object".to_string());
        let result = BackendResult::failure("a", &err, Duration::ZERO);
        assert_eq!(result.status, BackendStatus::Error);
        assert!(result.payload.is_none());
        assert!(!result.is_success());
    }

    #[test]
    fn test_success_carries_confidence() {
        let mut payload = Payload::new();
        payload.insert("answer".to_string(), json!(42));
        let reply = BackendReply::new(payload).with_confidence(0.75);
        let result = BackendResult::success("a", reply, Duration::from_millis(3));
        assert!(result.is_success());
        assert_eq!(result.confidence, Some(0.75));
        assert_eq!(result.payload.unwrap()["answer"], json!(42));
    }

    #[test]
    fn test_checked_confidence_bounds() {
        assert_eq!(checked_confidence(0.0), Ok(0.0));
        assert_eq!(checked_confidence(1.0), Ok(1.0));
        assert!(checked_confidence(1.01).is_err());
        assert!(checked_confidence(-0.1).is_err());
        assert!(checked_confidence(f64::NAN).is_err());
    }

    #[test]
    fn test_result_serializes_latency_in_millis() {
        let result = BackendResult::timeout("slow", Duration::from_millis(200), "deadline");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["latency_ms"], json!(200));
        assert_eq!(value["status"], json!("timeout"));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(BackendError::Unavailable(String::new()).kind(), "backend_unavailable");
        assert_eq!(BackendError::Timeout(Duration::ZERO).kind(), "backend_timeout");
        assert_eq!(
            BackendError::MalformedResponse(String::new()).kind(),
            "backend_malformed_response"
        );
    }
}
