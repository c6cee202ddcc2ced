//! The coordinator: one entry point for normalized, cached, fanned-out predictions.

use crate::aggregator::ScoreAggregator;
use crate::cache::FingerprintCache;
use crate::circuit_breaker::CircuitBreaker;
use crate::composer::{ComposedResponse, PipelineState, ResponseComposer};
use crate::config::{ConfigError, CoordinatorConfig};
use crate::dispatcher::FanOutDispatcher;
use crate::error::Result;
use crate::health::HealthRegistry;
use crate::normalizer::Normalizer;
use crate::secondary::{SecondaryOutcome, SecondaryStage};
use crate::status::{BackendReport, CoordinatorStatus};
use concord_abstraction::{Analyzer, Backend, BackendError, BackendResult, PredictionRequest};
use concord_backends::{AnalyzerConfig, BackendFactory};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Secondary stage bound when an analyzer is injected without configuration.
const DEFAULT_SECONDARY_TIMEOUT: Duration = Duration::from_secs(30);

/// Detail recorded when no fan-out slot frees up before the deadline.
const NO_SLOT_DETAIL: &str = "no fan-out slot before deadline";

/// The fan-out pipeline run once per cache miss.
struct Pipeline {
    backends: Vec<Arc<dyn Backend>>,
    dispatcher: FanOutDispatcher,
    aggregator: ScoreAggregator,
    secondary: SecondaryStage,
    fanouts: Semaphore,
    max_fanouts: usize,
}

impl Pipeline {
    async fn run(self: Arc<Self>, request: Arc<PredictionRequest>) -> Result<Arc<ComposedResponse>> {
        let started = Instant::now();
        let deadline = started + request.deadline;
        let mut composer = ResponseComposer::new(request.fingerprint.clone());

        composer.advance(PipelineState::Dispatching);
        let results = self.dispatch_within_limit(&request, started, deadline).await;

        composer.advance(PipelineState::Aggregating);
        if !results.iter().any(BackendResult::is_success) {
            error!(
                fingerprint = %request.fingerprint,
                attempted = results.len(),
                "No backend succeeded"
            );
            return Err(composer.fail(results.len()));
        }
        let scores = self.aggregator.aggregate(&results, &request.backend_weights);

        let secondary = if self.secondary.should_run(&request, &results) {
            composer.advance(PipelineState::SecondaryAnalysis);
            self.secondary.run(&request, &results, scores).await
        } else {
            SecondaryOutcome::Skipped
        };

        let response = composer.compose(results, scores, secondary)?;
        info!(
            fingerprint = %response.fingerprint,
            succeeded = response.succeeded(),
            attempted = response.backend_results.len(),
            coordination_score = response.coordination_score,
            coherence_score = response.coherence_score,
            degraded = response.degraded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Prediction composed"
        );
        Ok(Arc::new(response))
    }

    /// Waits for a fan-out slot (counted against the deadline), then dispatches.
    async fn dispatch_within_limit(
        &self,
        request: &Arc<PredictionRequest>,
        started: Instant,
        deadline: Instant,
    ) -> Vec<BackendResult> {
        match tokio::time::timeout_at(deadline, self.fanouts.acquire()).await {
            Ok(Ok(permit)) => {
                let results = self.dispatcher.dispatch(request, &self.backends, deadline).await;
                drop(permit);
                results
            }
            Ok(Err(closed)) => {
                error!(fingerprint = %request.fingerprint, error = %closed, "Fan-out limiter closed");
                self.dispatcher.time_out_all(&self.backends, started.elapsed(), NO_SLOT_DETAIL)
            }
            Err(_) => {
                warn!(
                    fingerprint = %request.fingerprint,
                    max_fanouts = self.max_fanouts,
                    "Deadline passed while waiting for a fan-out slot"
                );
                self.dispatcher.time_out_all(&self.backends, started.elapsed(), NO_SLOT_DETAIL)
            }
        }
    }

    fn active_fanouts(&self) -> usize {
        self.max_fanouts.saturating_sub(self.fanouts.available_permits())
    }
}

/// Accepts prediction requests and coordinates the backends behind them.
///
/// Constructed with injected configuration and adapters; there is no global
/// instance. Cheap operations (`status`, `is_ready`, `clear_cache`) never
/// touch a backend.
pub struct Coordinator {
    config: CoordinatorConfig,
    normalizer: Normalizer,
    cache: FingerprintCache,
    pipeline: Arc<Pipeline>,
    health: Arc<HealthRegistry>,
    breaker: Arc<CircuitBreaker>,
    weights: HashMap<String, f64>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("backends", &self.backend_ids())
            .field("secondary", &self.pipeline.secondary)
            .field("cache", &self.cache.config())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Creates a coordinator over the given adapters.
    ///
    /// Configured weights are matched to backends by ID.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the configuration is invalid, no backend is
    /// given, or two backends share an ID.
    pub fn new(
        config: CoordinatorConfig,
        backends: Vec<Arc<dyn Backend>>,
        analyzer: Option<Arc<dyn Analyzer>>,
    ) -> Result<Self> {
        config.validate()?;
        if backends.is_empty() {
            return Err(ConfigError::Validation("no backends configured".to_string()).into());
        }
        let mut seen = HashSet::new();
        if let Some(duplicate) = backends.iter().find(|b| !seen.insert(b.id().to_string())) {
            return Err(ConfigError::Validation(format!("duplicate backend id '{}'", duplicate.id())).into());
        }

        let weights: HashMap<String, f64> = config
            .backends
            .iter()
            .filter_map(|b| b.weight.map(|w| (b.id.clone(), w)))
            .collect();
        let secondary_timeout =
            config.secondary.as_ref().map_or(DEFAULT_SECONDARY_TIMEOUT, AnalyzerConfig::timeout);

        let health = Arc::new(HealthRegistry::new(backends.iter().map(|b| b.id().to_string())));
        let breaker = Arc::new(CircuitBreaker::from_config(&config.circuit_breaker));
        let cache = FingerprintCache::new(config.cache.clone()).map_err(ConfigError::from)?;

        let pipeline = Arc::new(Pipeline {
            dispatcher: FanOutDispatcher::new(Arc::clone(&breaker), Arc::clone(&health)),
            aggregator: ScoreAggregator::new(weights.clone(), config.coherence_normalization),
            secondary: SecondaryStage::new(analyzer, secondary_timeout),
            fanouts: Semaphore::new(config.max_concurrent_fanouts),
            max_fanouts: config.max_concurrent_fanouts,
            backends,
        });

        info!(
            backends = pipeline.backends.len(),
            secondary = pipeline.secondary.is_configured(),
            deadline_ms = config.deadline_ms,
            max_concurrent_fanouts = config.max_concurrent_fanouts,
            "Coordinator initialized"
        );

        Ok(Self {
            normalizer: Normalizer::new(config.deadline()),
            config,
            cache,
            pipeline,
            health,
            breaker,
            weights,
        })
    }

    /// Builds adapters from configuration and creates a coordinator.
    ///
    /// # Errors
    /// Returns an error if any adapter cannot be built or the configuration
    /// is invalid.
    pub fn from_config(config: CoordinatorConfig) -> Result<Self> {
        let backends = BackendFactory::create_all(&config.backends)?;
        let analyzer = config.secondary.as_ref().map(BackendFactory::create_analyzer).transpose()?;
        Self::new(config, backends, analyzer)
    }

    /// Normalizes raw input and predicts.
    ///
    /// # Errors
    /// Returns `AggregationFailed` when no backend succeeded, or
    /// `ComputationAborted` if the shared computation died.
    pub async fn predict(&self, raw: Value) -> Result<Arc<ComposedResponse>> {
        let request = self.normalizer.normalize(raw);
        self.predict_request(request).await
    }

    /// Predicts for an already normalized request.
    ///
    /// Identical fingerprints share one computation and one cached response.
    /// Requests that opt out of a configured secondary stage are cached apart
    /// from those that run it. Per-request weight overrides are applied to
    /// the shared backend results, so the coordination score always reflects
    /// this caller's weights. A caller joining a computation already in
    /// flight waits at most its own deadline.
    ///
    /// # Errors
    /// Same as [`Coordinator::predict`], plus `DeadlineExceeded` when a joined
    /// computation outlives this caller's deadline.
    pub async fn predict_request(&self, request: PredictionRequest) -> Result<Arc<ComposedResponse>> {
        let fingerprint = request.fingerprint.clone();
        let key = self.cache_key(&request);
        let deadline = request.deadline;
        let overrides = request.backend_weights.clone();
        debug!(fingerprint = %fingerprint, deadline_ms = deadline.as_millis() as u64, "Prediction requested");

        let pipeline = Arc::clone(&self.pipeline);
        let request = Arc::new(request);
        let result = self
            .cache
            .get_or_compute_within(&key, deadline, move || pipeline.run(request))
            .await
            .map(|response| self.rescore(response, &overrides));

        if let Err(ref err) = result {
            warn!(fingerprint = %fingerprint, error_kind = err.error_kind(), error = %err, "Prediction failed");
        }
        result
    }

    /// Cache and in-flight key for a request.
    fn cache_key(&self, request: &PredictionRequest) -> String {
        if request.skip_secondary && self.pipeline.secondary.is_configured() {
            format!("{}/no-secondary", request.fingerprint)
        } else {
            request.fingerprint.clone()
        }
    }

    /// Recomputes the coordination score under `overrides` when it differs
    /// from the one the shared response was composed with.
    fn rescore(
        &self,
        response: Arc<ComposedResponse>,
        overrides: &BTreeMap<String, f64>,
    ) -> Arc<ComposedResponse> {
        let scores = self.pipeline.aggregator.aggregate(&response.backend_results, overrides);
        if (scores.coordination - response.coordination_score).abs() <= f64::EPSILON {
            return response;
        }
        debug!(
            fingerprint = %response.fingerprint,
            shared = response.coordination_score,
            coordination_score = scores.coordination,
            "Rescored shared response for request weights"
        );
        let mut rescored = ComposedResponse::clone(&response);
        rescored.coordination_score = scores.coordination;
        Arc::new(rescored)
    }

    /// Normalizes raw input without predicting.
    pub fn normalize(&self, raw: Value) -> PredictionRequest {
        self.normalizer.normalize(raw)
    }

    /// Point-in-time view of backends, cache and load.
    pub fn status(&self) -> CoordinatorStatus {
        let health = self.health.snapshot();
        let backends = self
            .pipeline
            .backends
            .iter()
            .map(|backend| {
                let id = backend.id();
                let known = health.get(id).cloned().unwrap_or_default();
                BackendReport {
                    id: id.to_string(),
                    weight: self.weights.get(id).copied(),
                    reachable: known.reachable,
                    circuit: self.breaker.state(id).label(),
                    last_status: known.last_status,
                    last_latency_ms: known.last_latency_ms,
                    last_error: known.last_error,
                    last_checked: known.last_checked,
                    consecutive_failures: known.consecutive_failures,
                }
            })
            .collect();

        let cache = self.cache.stats();
        CoordinatorStatus {
            ready: self.is_ready(),
            backends,
            in_flight: cache.in_flight,
            cache,
            active_fanouts: self.pipeline.active_fanouts(),
            max_concurrent_fanouts: self.pipeline.max_fanouts,
            secondary_configured: self.pipeline.secondary.is_configured(),
        }
    }

    /// `true` when at least one backend is not known to be unreachable.
    pub fn is_ready(&self) -> bool {
        self.health.any_available()
    }

    /// Drops every cached response.
    ///
    /// # Returns
    /// The number of removed entries.
    pub fn clear_cache(&self) -> usize {
        self.cache.clear()
    }

    /// Probes every backend once, concurrently.
    pub async fn probe_backends(&self) {
        probe_all(&self.pipeline.backends, &self.health).await;
    }

    /// Spawns a task probing every backend each `health_check_interval_secs`.
    ///
    /// The task runs until the returned handle is aborted.
    pub fn spawn_health_monitor(&self) -> JoinHandle<()> {
        let backends = self.pipeline.backends.clone();
        let health = Arc::clone(&self.health);
        let period = self.config.health_check_interval();
        info!(interval_secs = period.as_secs(), "Starting health monitor");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                probe_all(&backends, &health).await;
            }
        })
    }

    /// Spawns the periodic sweep of expired cache entries.
    pub fn spawn_cache_sweeper(&self) -> JoinHandle<()> {
        self.cache.spawn_sweeper()
    }

    /// The configuration this coordinator was built with.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// The response cache.
    pub fn cache(&self) -> &FingerprintCache {
        &self.cache
    }

    /// Backend IDs in dispatch order.
    pub fn backend_ids(&self) -> Vec<&str> {
        self.pipeline.backends.iter().map(|b| b.id()).collect()
    }
}

async fn probe_all(backends: &[Arc<dyn Backend>], health: &HealthRegistry) {
    let probes = backends.iter().map(|backend| async move {
        let started = std::time::Instant::now();
        let outcome = match tokio::time::timeout(backend.timeout(), backend.health_check()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BackendError::Timeout(backend.timeout())),
        };
        health.record_probe(backend.id(), outcome.as_ref().map(|()| ()), started.elapsed());
    });
    futures::future::join_all(probes).await;
}
