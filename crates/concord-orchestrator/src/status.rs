//! Introspection snapshots.

use crate::cache::CacheStats;
use chrono::{DateTime, Utc};
use concord_abstraction::BackendStatus;
use serde::Serialize;

/// Everything known about one backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendReport {
    /// Backend ID.
    pub id: String,
    /// Configured weight, if any.
    pub weight: Option<f64>,
    /// Last-known reachability; `None` until called or probed.
    pub reachable: Option<bool>,
    /// Circuit state: `closed`, `open` or `half_open`.
    pub circuit: &'static str,
    /// Status of the most recent call.
    pub last_status: Option<BackendStatus>,
    /// Latency of the most recent call or probe.
    pub last_latency_ms: Option<u64>,
    /// Error of the most recent failure.
    pub last_error: Option<String>,
    /// When the backend was last called or probed.
    pub last_checked: Option<DateTime<Utc>>,
    /// Failures since the last success.
    pub consecutive_failures: u32,
}

/// Coordinator-wide snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorStatus {
    /// At least one backend is not known to be unreachable.
    pub ready: bool,
    /// Per-backend reports, in dispatch order.
    pub backends: Vec<BackendReport>,
    /// Response cache counters.
    pub cache: CacheStats,
    /// Computations currently in flight.
    pub in_flight: usize,
    /// Fan-outs currently holding a slot.
    pub active_fanouts: usize,
    /// Maximum concurrent fan-outs.
    pub max_concurrent_fanouts: usize,
    /// Whether a secondary analyzer is configured.
    pub secondary_configured: bool,
}
