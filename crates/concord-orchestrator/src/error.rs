// Error types for coordination

use crate::config::ConfigError;
use concord_abstraction::BackendError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for coordination operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Coordination errors
///
/// Cloneable so a single failed computation can be handed to every caller
/// waiting on the same fingerprint.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoordinatorError {
    /// No backend produced a usable result
    #[error("Aggregation failed: none of {attempted} backends succeeded")]
    AggregationFailed {
        /// Number of backends that were attempted
        attempted: usize,
    },

    /// The cache state could not be used
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    /// The secondary analysis stage failed
    #[error("Secondary analysis failed: {0}")]
    SecondaryAnalysisFailed(String),

    /// Configuration was rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A shared computation ended without producing a result
    #[error("Computation aborted: {0}")]
    ComputationAborted(String),

    /// The caller's deadline passed while waiting on a shared computation
    #[error("Deadline exceeded after {deadline_ms}ms waiting for an in-flight prediction")]
    DeadlineExceeded {
        /// The caller's deadline in milliseconds
        deadline_ms: u64,
    },

    /// A backend adapter could not be created
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

impl CoordinatorError {
    /// Machine-readable error kind.
    #[must_use]
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AggregationFailed { .. } => "aggregation_failed",
            Self::CacheUnavailable(_) => "cache_unavailable",
            Self::SecondaryAnalysisFailed(_) => "secondary_analysis_failed",
            Self::InvalidConfig(_) => "invalid_config",
            Self::ComputationAborted(_) => "computation_aborted",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::Backend(err) => err.kind(),
        }
    }

    /// Serializable report of this error.
    #[must_use]
    pub fn report(&self) -> ErrorReport {
        ErrorReport::from(self)
    }
}

impl From<ConfigError> for CoordinatorError {
    fn from(err: ConfigError) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}

/// Wire form of a `CoordinatorError`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Machine-readable kind, e.g. `aggregation_failed`.
    pub error_kind: String,
    /// Human-readable message.
    pub message: String,
}

impl From<&CoordinatorError> for ErrorReport {
    fn from(err: &CoordinatorError) -> Self {
        Self { error_kind: err.error_kind().to_string(), message: err.to_string() }
    }
}
