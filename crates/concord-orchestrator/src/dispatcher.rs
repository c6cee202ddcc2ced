//! Fan-out dispatcher.
//!
//! Sends one request to every configured backend at once and collects exactly
//! one `BackendResult` per backend, in configuration order. No single failure
//! aborts the batch; the overall deadline cuts off whatever is still running.

use crate::circuit_breaker::CircuitBreaker;
use crate::health::HealthRegistry;
use concord_abstraction::{Backend, BackendResult, PredictionRequest};
use concord_backends::invoke;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Detail recorded for backends skipped by an open circuit.
pub const CIRCUIT_OPEN_DETAIL: &str = "circuit open";

/// Detail recorded for backends cut off by the overall deadline.
pub const DEADLINE_DETAIL: &str = "overall deadline exceeded";

/// Dispatches requests to all backends concurrently.
#[derive(Debug, Clone)]
pub struct FanOutDispatcher {
    breaker: Arc<CircuitBreaker>,
    health: Arc<HealthRegistry>,
}

impl FanOutDispatcher {
    /// Creates a dispatcher that consults `breaker` and reports to `health`.
    #[must_use]
    pub fn new(breaker: Arc<CircuitBreaker>, health: Arc<HealthRegistry>) -> Self {
        Self { breaker, health }
    }

    /// Invokes every backend and waits for all of them, up to `deadline`.
    ///
    /// Each call is bounded by the smaller of the backend's own timeout and
    /// the time left until `deadline`. Calls still running at the deadline
    /// are aborted and recorded as `Timeout`; a call whose task panics is
    /// recorded as `Error`. Backends behind an open circuit are not called
    /// and come back as `Error` with detail `circuit open`.
    pub async fn dispatch(
        &self,
        request: &Arc<PredictionRequest>,
        backends: &[Arc<dyn Backend>],
        deadline: Instant,
    ) -> Vec<BackendResult> {
        let started = Instant::now();
        debug!(
            fingerprint = %request.fingerprint,
            backend_count = backends.len(),
            budget_ms = deadline.saturating_duration_since(started).as_millis() as u64,
            "Starting fan-out"
        );

        let calls: Vec<Option<JoinHandle<BackendResult>>> = backends
            .iter()
            .map(|backend| {
                if self.breaker.should_skip(backend.id()) {
                    warn!(backend_id = %backend.id(), "Skipping backend with open circuit");
                    return None;
                }
                let bound =
                    backend.timeout().min(deadline.saturating_duration_since(Instant::now()));
                let backend = Arc::clone(backend);
                let request = Arc::clone(request);
                Some(tokio::spawn(async move { invoke(backend.as_ref(), &request, bound).await }))
            })
            .collect();

        let mut results = Vec::with_capacity(backends.len());
        for (backend, call) in backends.iter().zip(calls) {
            let Some(mut handle) = call else {
                results.push(BackendResult::error(backend.id(), Duration::ZERO, CIRCUIT_OPEN_DETAIL));
                continue;
            };

            let result = match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) => {
                    error!(backend_id = %backend.id(), error = %join_error, "Backend task failed");
                    BackendResult::error(
                        backend.id(),
                        started.elapsed(),
                        format!("backend task failed: {join_error}"),
                    )
                }
                Err(_) => {
                    handle.abort();
                    warn!(backend_id = %backend.id(), "Backend cut off by overall deadline");
                    BackendResult::timeout(backend.id(), started.elapsed(), DEADLINE_DETAIL)
                }
            };
            self.observe(&result);
            results.push(result);
        }

        debug!(
            fingerprint = %request.fingerprint,
            succeeded = results.iter().filter(|r| r.is_success()).count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fan-out complete"
        );
        results
    }

    /// Records a `Timeout` for every backend without calling any of them.
    pub fn time_out_all(
        &self,
        backends: &[Arc<dyn Backend>],
        waited: Duration,
        detail: &str,
    ) -> Vec<BackendResult> {
        backends.iter().map(|backend| BackendResult::timeout(backend.id(), waited, detail)).collect()
    }

    fn observe(&self, result: &BackendResult) {
        if result.is_success() {
            self.breaker.record_success(&result.backend_id);
        } else {
            self.breaker.record_failure(&result.backend_id);
        }
        self.health.record_result(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use concord_abstraction::{BackendError, BackendReply, BackendStatus, Payload};
    use concord_backends::MockBackend;
    use std::collections::BTreeMap;

    /// Backend whose task panics mid-call.
    struct PanickingBackend;

    #[async_trait]
    impl Backend for PanickingBackend {
        fn id(&self) -> &str {
            "panics"
        }

        fn timeout(&self) -> Duration {
            Duration::from_secs(1)
        }

        async fn predict(&self, _request: &PredictionRequest) -> Result<BackendReply, BackendError> {
            panic!("backend blew up")
        }
    }

    fn request(deadline: Duration) -> Arc<PredictionRequest> {
        Arc::new(PredictionRequest {
            fingerprint: "fp".to_string(),
            payload: Payload::new(),
            context: Payload::new(),
            backend_weights: BTreeMap::new(),
            deadline,
            skip_secondary: false,
        })
    }

    fn dispatcher() -> (FanOutDispatcher, Arc<CircuitBreaker>, Arc<HealthRegistry>) {
        let breaker = Arc::new(CircuitBreaker::with_settings(
            0.5,
            Duration::from_secs(300),
            Duration::from_secs(60),
            2,
        ));
        let health = Arc::new(HealthRegistry::new(["a", "b", "c", "panics"]));
        (FanOutDispatcher::new(Arc::clone(&breaker), Arc::clone(&health)), breaker, health)
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_follow_configuration_order() {
        let (dispatcher, _, _) = dispatcher();
        let backends: Vec<Arc<dyn Backend>> = vec![
            Arc::new(MockBackend::new("a").with_delay(Duration::from_millis(30))),
            Arc::new(MockBackend::new("b").with_delay(Duration::from_millis(10))),
            Arc::new(
                MockBackend::new("c").failing_with(BackendError::Unavailable("down".to_string())),
            ),
        ];
        let deadline = Instant::now() + Duration::from_secs(1);

        let results = dispatcher.dispatch(&request(Duration::from_secs(1)), &backends, deadline).await;

        let ids: Vec<_> = results.iter().map(|r| r.backend_id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(results[0].status, BackendStatus::Success);
        assert_eq!(results[2].status, BackendStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cuts_off_slow_backend() {
        let (dispatcher, _, health) = dispatcher();
        let backends: Vec<Arc<dyn Backend>> = vec![
            Arc::new(MockBackend::new("a").with_confidence(0.8)),
            Arc::new(MockBackend::new("b").with_delay(Duration::from_secs(10))),
        ];
        let started = Instant::now();
        let deadline = started + Duration::from_millis(200);

        let results = dispatcher.dispatch(&request(Duration::from_millis(200)), &backends, deadline).await;

        assert_eq!(results[0].status, BackendStatus::Success);
        assert_eq!(results[1].status, BackendStatus::Timeout);
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(health.get("b").unwrap().reachable, Some(false));
    }

    #[tokio::test]
    async fn test_panicking_backend_is_error() {
        let (dispatcher, _, _) = dispatcher();
        let backends: Vec<Arc<dyn Backend>> =
            vec![Arc::new(PanickingBackend), Arc::new(MockBackend::new("a"))];
        let deadline = Instant::now() + Duration::from_secs(1);

        let results = dispatcher.dispatch(&request(Duration::from_secs(1)), &backends, deadline).await;

        assert_eq!(results[0].status, BackendStatus::Error);
        assert!(results[0].error_detail.as_deref().unwrap().contains("backend task failed"));
        assert!(results[1].is_success());
    }

    #[tokio::test]
    async fn test_open_circuit_skips_backend() {
        let (dispatcher, breaker, _) = dispatcher();
        breaker.record_failure("a");
        breaker.record_failure("a");
        let backend = Arc::new(MockBackend::new("a"));
        let backends: Vec<Arc<dyn Backend>> = vec![backend.clone() as Arc<dyn Backend>];
        let deadline = Instant::now() + Duration::from_secs(1);

        let results = dispatcher.dispatch(&request(Duration::from_secs(1)), &backends, deadline).await;

        assert_eq!(results[0].status, BackendStatus::Error);
        assert_eq!(results[0].error_detail.as_deref(), Some(CIRCUIT_OPEN_DETAIL));
        assert_eq!(backend.call_count(), 0);
    }

    #[test]
    fn test_time_out_all() {
        let (dispatcher, _, _) = dispatcher();
        let backends: Vec<Arc<dyn Backend>> =
            vec![Arc::new(MockBackend::new("a")), Arc::new(MockBackend::new("b"))];
        let results = dispatcher.time_out_all(&backends, Duration::from_millis(5), "no permit");
        assert!(results.iter().all(|r| r.status == BackendStatus::Timeout));
        assert_eq!(results[1].error_detail.as_deref(), Some("no permit"));
    }
}
