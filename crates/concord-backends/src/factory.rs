//! Backend factory for creating adapter instances from configuration.
//!
//! Adapters differ only in configuration (endpoint, weight, timeout, static
//! parameters); the factory maps a `BackendConfig` onto the matching adapter.

use crate::{HttpAnalyzer, HttpBackend, MockAnalyzer, MockBackend};
use concord_abstraction::{Analyzer, Backend, BackendError, Payload};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Adapter kind enumeration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// JSON over HTTP.
    #[default]
    Http,
    /// In-process stand-in for local runs and tests.
    Mock,
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" | "https" => Ok(Self::Http),
            "mock" => Ok(Self::Mock),
            other => Err(BackendError::Configuration(format!("unknown backend kind '{other}'"))),
        }
    }
}

/// Settings for a mock adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MockSettings {
    /// Confidence reported on every reply.
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Artificial latency before replying.
    #[serde(default)]
    pub delay_ms: u64,
    /// When set, every call fails as unavailable with this message.
    #[serde(default)]
    pub fail_with: Option<String>,
}

/// Configuration of one prediction backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique backend ID.
    pub id: String,
    /// Adapter kind (default: http).
    #[serde(default)]
    pub kind: BackendKind,
    /// Base URL, required for HTTP backends.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Prediction path appended to the endpoint (default: "/predict").
    #[serde(default = "default_path")]
    pub path: String,
    /// Health probe path appended to the endpoint (default: "/health").
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Per-backend time bound in milliseconds (default: 30000).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Relative importance in `[0, 1]` for the coordination score.
    #[serde(default)]
    pub weight: Option<f64>,
    /// Static fields merged into every request body.
    #[serde(default)]
    pub params: Payload,
    /// JSON pointers tried in order to find the confidence in a reply.
    #[serde(default = "default_confidence_paths")]
    pub confidence_paths: Vec<String>,
    /// Mock adapter settings (only used for the mock kind).
    #[serde(default)]
    pub mock: Option<MockSettings>,
}

fn default_path() -> String {
    "/predict".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_confidence_paths() -> Vec<String> {
    vec!["/confidence".to_string(), "/prediction/confidence".to_string()]
}

impl BackendConfig {
    /// Creates an HTTP backend configuration with defaults.
    #[must_use]
    pub fn http(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: BackendKind::Http,
            endpoint: Some(endpoint.into()),
            path: default_path(),
            health_path: default_health_path(),
            timeout_ms: default_timeout_ms(),
            weight: None,
            params: Payload::new(),
            confidence_paths: default_confidence_paths(),
            mock: None,
        }
    }

    /// Creates a mock backend configuration.
    #[must_use]
    pub fn mock(id: impl Into<String>, settings: MockSettings) -> Self {
        Self {
            kind: BackendKind::Mock,
            endpoint: None,
            mock: Some(settings),
            ..Self::http(id, String::new())
        }
    }

    /// Sets the relative weight.
    #[must_use]
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Sets the time bound in milliseconds.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Returns the time bound as a Duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Validate the backend configuration.
    ///
    /// # Errors
    /// Returns `BackendError::Configuration` if any value is invalid.
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.id.trim().is_empty() {
            return Err(BackendError::Configuration("backend id must not be empty".to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(BackendError::Configuration(format!(
                "backend '{}': timeout_ms must be greater than 0",
                self.id
            )));
        }
        if let Some(weight) = self.weight {
            if !weight.is_finite() || !(0.0..=1.0).contains(&weight) {
                return Err(BackendError::Configuration(format!(
                    "backend '{}': weight {weight} is outside [0, 1]",
                    self.id
                )));
            }
        }
        if let Some(path) = self.confidence_paths.iter().find(|p| !p.is_empty() && !p.starts_with('/')) {
            return Err(BackendError::Configuration(format!(
                "backend '{}': confidence path '{path}' must start with '/'",
                self.id
            )));
        }
        if self.kind == BackendKind::Http {
            match self.endpoint.as_deref() {
                Some(url) if url.starts_with("http://") || url.starts_with("https://") => {}
                Some(url) => {
                    return Err(BackendError::Configuration(format!(
                        "backend '{}': endpoint '{url}' must be an http(s) URL",
                        self.id
                    )));
                }
                None => {
                    return Err(BackendError::Configuration(format!(
                        "backend '{}': http backends require an endpoint",
                        self.id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Configuration of the secondary analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Analyzer ID used in logs (default: "secondary").
    #[serde(default = "default_analyzer_id")]
    pub id: String,
    /// Adapter kind (default: http).
    #[serde(default)]
    pub kind: BackendKind,
    /// Full analysis URL, required for HTTP analyzers.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Time bound in milliseconds (default: 30000).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_analyzer_id() -> String {
    "secondary".to_string()
}

impl AnalyzerConfig {
    /// Returns the time bound as a Duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Validate the analyzer configuration.
    ///
    /// # Errors
    /// Returns `BackendError::Configuration` if any value is invalid.
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.timeout_ms == 0 {
            return Err(BackendError::Configuration(
                "secondary analyzer timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.kind == BackendKind::Http && self.endpoint.is_none() {
            return Err(BackendError::Configuration(
                "http secondary analyzer requires an endpoint".to_string(),
            ));
        }
        Ok(())
    }
}

/// Factory for creating backend and analyzer instances.
pub struct BackendFactory;

impl BackendFactory {
    /// Creates a backend from configuration.
    ///
    /// # Errors
    /// Returns `BackendError::Configuration` if the configuration is invalid.
    pub fn create(config: &BackendConfig) -> Result<Arc<dyn Backend>, BackendError> {
        config.validate()?;
        debug!(backend_id = %config.id, kind = ?config.kind, "Creating backend adapter");

        match config.kind {
            BackendKind::Http => Ok(Arc::new(HttpBackend::from_config(config)?)),
            BackendKind::Mock => Ok(Arc::new(MockBackend::from_config(config))),
        }
    }

    /// Creates every configured backend, failing on the first invalid one.
    ///
    /// # Errors
    /// Returns `BackendError::Configuration` if any configuration is invalid.
    pub fn create_all(configs: &[BackendConfig]) -> Result<Vec<Arc<dyn Backend>>, BackendError> {
        configs.iter().map(Self::create).collect()
    }

    /// Creates a secondary analyzer from configuration.
    ///
    /// # Errors
    /// Returns `BackendError::Configuration` if the configuration is invalid.
    pub fn create_analyzer(config: &AnalyzerConfig) -> Result<Arc<dyn Analyzer>, BackendError> {
        config.validate()?;
        debug!(analyzer_id = %config.id, kind = ?config.kind, "Creating secondary analyzer");

        match config.kind {
            BackendKind::Http => Ok(Arc::new(HttpAnalyzer::from_config(config)?)),
            BackendKind::Mock => Ok(Arc::new(MockAnalyzer::new(config.id.clone()))),
        }
    }
}
