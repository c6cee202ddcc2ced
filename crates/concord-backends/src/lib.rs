//! Backend adapters for Concord.
//!
//! This crate provides concrete implementations of the `Backend` and
//! `Analyzer` traits, plus [`invoke`], the timeout-bounded wrapper that turns
//! any adapter call into exactly one `BackendResult`.
//!
//! # Supported Adapters
//!
//! - **Http**: JSON over HTTP (`POST {endpoint}{path}`)
//! - **Mock**: In-process stand-in for local runs and tests

pub mod analyst;
pub mod factory;
pub mod http;

use async_trait::async_trait;
use concord_abstraction::{
    AnalysisInput, Analyzer, Backend, BackendError, BackendReply, BackendResult, Payload,
    PredictionRequest, checked_confidence,
};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub use analyst::HttpAnalyzer;
pub use factory::{AnalyzerConfig, BackendConfig, BackendFactory, BackendKind, MockSettings};
pub use http::HttpBackend;

/// Invokes one backend under a time bound and classifies the outcome.
///
/// Never fails: transport errors, invalid replies and exceeded bounds all
/// come back as a `BackendResult` with `Error` or `Timeout` status.
pub async fn invoke(
    backend: &dyn Backend,
    request: &PredictionRequest,
    timeout: Duration,
) -> BackendResult {
    let started = Instant::now();
    let outcome = tokio::time::timeout(timeout, backend.predict(request)).await;
    let latency = started.elapsed();

    let reply = match outcome {
        Ok(Ok(reply)) => reply,
        Ok(Err(err)) => {
            warn!(backend_id = %backend.id(), error = %err, kind = err.kind(), "Backend call failed");
            return BackendResult::failure(backend.id(), &err, latency);
        }
        Err(_) => {
            warn!(backend_id = %backend.id(), timeout_ms = timeout.as_millis() as u64, "Backend call timed out");
            return BackendResult::failure(backend.id(), &BackendError::Timeout(timeout), latency);
        }
    };

    if let Some(confidence) = reply.confidence {
        if let Err(err) = checked_confidence(confidence) {
            warn!(backend_id = %backend.id(), error = %err, "Backend reported invalid confidence");
            return BackendResult::failure(backend.id(), &err, latency);
        }
    }

    debug!(
        backend_id = %backend.id(),
        latency_ms = latency.as_millis() as u64,
        confidence = ?reply.confidence,
        "Backend call succeeded"
    );
    BackendResult::success(backend.id(), reply, latency)
}

/// A mock implementation of the `Backend` trait for testing and local runs.
#[derive(Debug)]
pub struct MockBackend {
    id: String,
    timeout: Duration,
    confidence: Option<f64>,
    delay: Duration,
    failure: Option<BackendError>,
    payload: Payload,
    calls: AtomicUsize,
}

impl MockBackend {
    /// Creates a new `MockBackend` that answers immediately with no confidence.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            timeout: Duration::from_secs(30),
            confidence: None,
            delay: Duration::ZERO,
            failure: None,
            payload: Payload::new(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Creates a mock backend from configuration.
    #[must_use]
    pub fn from_config(config: &BackendConfig) -> Self {
        let settings = config.mock.clone().unwrap_or_default();
        let mut backend = Self::new(config.id.clone())
            .with_timeout(config.timeout())
            .with_delay(Duration::from_millis(settings.delay_ms))
            .with_payload(config.params.clone());
        backend.confidence = settings.confidence;
        backend.failure = settings.fail_with.map(BackendError::Unavailable);
        backend
    }

    /// Sets the confidence reported on every reply.
    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Sets an artificial latency before replying.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the backend's own time bound.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Makes every call fail with the given error.
    #[must_use]
    pub fn failing_with(mut self, error: BackendError) -> Self {
        self.failure = Some(error);
        self
    }

    /// Sets extra fields included in every reply.
    #[must_use]
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Number of `predict` calls received so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn predict(&self, request: &PredictionRequest) -> Result<BackendReply, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        debug!(backend_id = %self.id, fingerprint = %request.fingerprint, "MockBackend predicting");

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(ref err) = self.failure {
            return Err(err.clone());
        }

        let mut payload = self.payload.clone();
        payload.insert("backend".to_string(), Value::String(self.id.clone()));
        payload.insert("fingerprint".to_string(), Value::String(request.fingerprint.clone()));
        Ok(BackendReply { payload, confidence: self.confidence })
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        match self.failure {
            Some(ref err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// A mock implementation of the `Analyzer` trait.
#[derive(Debug)]
pub struct MockAnalyzer {
    id: String,
    failure: Option<BackendError>,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockAnalyzer {
    /// Creates an analyzer that summarizes the scores it was given.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), failure: None, delay: Duration::ZERO, calls: AtomicUsize::new(0) }
    }

    /// Makes every analysis fail with the given error.
    #[must_use]
    pub fn failing_with(mut self, error: BackendError) -> Self {
        self.failure = Some(error);
        self
    }

    /// Sets an artificial latency before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of `analyze` calls received so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Analyzer for MockAnalyzer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn analyze(&self, input: &AnalysisInput<'_>) -> Result<Payload, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(ref err) = self.failure {
            return Err(err.clone());
        }

        let succeeded = input.results.iter().filter(|r| r.is_success()).count();
        let mut analysis = Payload::new();
        analysis.insert("analyzer".to_string(), Value::String(self.id.clone()));
        analysis.insert("backends_succeeded".to_string(), Value::from(succeeded));
        analysis.insert("coordination_score".to_string(), Value::from(input.coordination_score));
        analysis.insert("coherence_score".to_string(), Value::from(input.coherence_score));
        Ok(analysis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_abstraction::BackendStatus;
    use std::collections::BTreeMap;

    fn request() -> PredictionRequest {
        PredictionRequest {
            fingerprint: "abc".to_string(),
            payload: Payload::new(),
            context: Payload::new(),
            backend_weights: BTreeMap::new(),
            deadline: Duration::from_secs(1),
            skip_secondary: false,
        }
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let backend = MockBackend::new("a").with_confidence(0.9);
        let result = invoke(&backend, &request(), Duration::from_secs(1)).await;
        assert_eq!(result.status, BackendStatus::Success);
        assert_eq!(result.confidence, Some(0.9));
        assert_eq!(result.payload.unwrap()["backend"], Value::String("a".to_string()));
    }

    #[tokio::test]
    async fn test_invoke_classifies_error() {
        let backend =
            MockBackend::new("a").failing_with(BackendError::Unavailable("refused".to_string()));
        let result = invoke(&backend, &request(), Duration::from_secs(1)).await;
        assert_eq!(result.status, BackendStatus::Error);
        assert_eq!(result.error_detail.as_deref(), Some("Backend unavailable: refused"));
    }

    #[tokio::test]
    async fn test_invoke_enforces_timeout() {
        let backend = MockBackend::new("slow").with_delay(Duration::from_secs(10));
        let started = Instant::now();
        let result = invoke(&backend, &request(), Duration::from_millis(50)).await;
        assert_eq!(result.status, BackendStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_invoke_rejects_invalid_confidence() {
        let backend = MockBackend::new("a").with_confidence(3.0);
        let result = invoke(&backend, &request(), Duration::from_secs(1)).await;
        assert_eq!(result.status, BackendStatus::Error);
        assert!(result.confidence.is_none());
    }

    #[tokio::test]
    async fn test_mock_counts_calls() {
        let backend = MockBackend::new("a");
        let _ = backend.predict(&request()).await;
        let _ = backend.predict(&request()).await;
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_from_config() {
        let config = BackendConfig::mock(
            "m",
            MockSettings { confidence: Some(0.5), delay_ms: 0, fail_with: None },
        );
        let backend = MockBackend::from_config(&config);
        let reply = backend.predict(&request()).await.unwrap();
        assert_eq!(reply.confidence, Some(0.5));
        assert!(backend.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_analyzer_summarizes() {
        let req = request();
        let results = vec![BackendResult::success("a", BackendReply::default(), Duration::ZERO)];
        let input = AnalysisInput {
            request: &req,
            results: &results,
            coordination_score: 1.0,
            coherence_score: 0.5,
        };
        let analyzer = MockAnalyzer::new("secondary");
        let analysis = analyzer.analyze(&input).await.unwrap();
        assert_eq!(analysis["backends_succeeded"], Value::from(1));
        assert_eq!(analyzer.call_count(), 1);
    }
}
