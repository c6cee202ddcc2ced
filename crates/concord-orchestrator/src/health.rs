//! Last-known backend health.
//!
//! Fed by every dispatch outcome and by the periodic health probe.

use chrono::{DateTime, Utc};
use concord_abstraction::{BackendError, BackendResult, BackendStatus};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What is known about one backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackendHealth {
    /// `None` until the backend has been called or probed.
    pub reachable: Option<bool>,
    /// Status of the most recent call.
    pub last_status: Option<BackendStatus>,
    /// Latency of the most recent call or probe.
    pub last_latency_ms: Option<u64>,
    /// Error of the most recent failed call or probe.
    pub last_error: Option<String>,
    /// When the backend was last called or probed.
    pub last_checked: Option<DateTime<Utc>>,
    /// Failed calls or probes since the last success.
    pub consecutive_failures: u32,
}

impl BackendHealth {
    fn mark(&mut self, backend_id: &str, reachable: bool, latency: Duration, error: Option<String>) {
        let was = self.reachable;
        self.reachable = Some(reachable);
        self.last_latency_ms = Some(latency.as_millis() as u64);
        self.last_checked = Some(Utc::now());
        if reachable {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.last_error = error;
        }
        if was == Some(!reachable) {
            info!(backend_id, reachable, "Backend reachability changed");
        }
    }
}

/// Registry of backend health keyed by backend ID.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    backends: RwLock<BTreeMap<String, BackendHealth>>,
}

impl HealthRegistry {
    /// Creates a registry with an unknown entry for every backend.
    #[must_use]
    pub fn new<I, S>(backend_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let backends =
            backend_ids.into_iter().map(|id| (id.into(), BackendHealth::default())).collect();
        Self { backends: RwLock::new(backends) }
    }

    /// Records the outcome of a dispatched call.
    pub fn record_result(&self, result: &BackendResult) {
        let mut backends = self.backends.write().unwrap_or_else(PoisonError::into_inner);
        let health = backends.entry(result.backend_id.clone()).or_default();
        health.last_status = Some(result.status);
        health.mark(&result.backend_id, result.is_success(), result.latency, result.error_detail.clone());
    }

    /// Records the outcome of a health probe.
    pub fn record_probe(&self, backend_id: &str, outcome: Result<(), &BackendError>, latency: Duration) {
        let mut backends = self.backends.write().unwrap_or_else(PoisonError::into_inner);
        let health = backends.entry(backend_id.to_string()).or_default();
        match outcome {
            Ok(()) => {
                debug!(backend_id, latency_ms = latency.as_millis() as u64, "Health probe succeeded");
                health.mark(backend_id, true, latency, None);
            }
            Err(err) => {
                warn!(backend_id, error = %err, "Health probe failed");
                health.mark(backend_id, false, latency, Some(err.to_string()));
            }
        }
    }

    /// Health of one backend, if it is known to the registry.
    pub fn get(&self, backend_id: &str) -> Option<BackendHealth> {
        let backends = self.backends.read().unwrap_or_else(PoisonError::into_inner);
        backends.get(backend_id).cloned()
    }

    /// Copy of every entry.
    pub fn snapshot(&self) -> BTreeMap<String, BackendHealth> {
        self.backends.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// `true` when at least one backend is not known to be unreachable.
    pub fn any_available(&self) -> bool {
        let backends = self.backends.read().unwrap_or_else(PoisonError::into_inner);
        backends.values().any(|health| health.reachable != Some(false))
    }
}
