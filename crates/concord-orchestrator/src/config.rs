//! Coordinator configuration.
//!
//! Loaded from a TOML file, then overridden from `CONCORD_*` environment
//! variables, then validated.
//!
//! ```toml
//! deadline_ms = 30000
//! max_concurrent_fanouts = 10
//!
//! [cache]
//! ttl_ms = 300000
//!
//! [[backends]]
//! id = "forecast"
//! endpoint = "http://forecast.internal:8080"
//! weight = 0.4
//!
//! [secondary]
//! endpoint = "http://reasoner.internal:8090/analyze"
//! ```

use crate::cache::{CacheConfig, CacheConfigError};
use crate::circuit_breaker::CircuitBreakerConfig;
use concord_abstraction::BackendError;
use concord_backends::{AnalyzerConfig, BackendConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;

/// Environment variable overriding `deadline_ms`.
pub const ENV_DEADLINE_MS: &str = "CONCORD_DEADLINE_MS";
/// Environment variable overriding `cache.ttl_ms`.
pub const ENV_CACHE_TTL_MS: &str = "CONCORD_CACHE_TTL_MS";
/// Environment variable overriding `max_concurrent_fanouts`.
pub const ENV_MAX_CONCURRENT_FANOUTS: &str = "CONCORD_MAX_CONCURRENT_FANOUTS";
/// Environment variable overriding `coherence_normalization`.
pub const ENV_COHERENCE_NORMALIZATION: &str = "CONCORD_COHERENCE_NORMALIZATION";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("IO error reading {}: {source}", path.display())]
    Io {
        /// File that could not be read
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// An environment override did not parse
    #[error("Invalid value '{value}' for {var}")]
    Env {
        /// Environment variable name
        var: &'static str,
        /// Rejected value
        value: String,
    },

    /// The cache section is invalid
    #[error("Cache configuration error: {0}")]
    Cache(#[from] CacheConfigError),

    /// A backend or analyzer entry is invalid
    #[error("Backend configuration error: {0}")]
    Backend(#[from] BackendError),

    /// A value failed validation
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Top-level coordinator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Default overall deadline per request in milliseconds (default: 30000).
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,

    /// Fan-outs allowed to run at once (default: 10).
    #[serde(default = "default_max_concurrent_fanouts")]
    pub max_concurrent_fanouts: usize,

    /// Confidence standard deviation at which coherence reaches 0 (default: 0.5).
    #[serde(default = "default_coherence_normalization")]
    pub coherence_normalization: f64,

    /// Seconds between background health probes (default: 30).
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Response cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Circuit breaker settings.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Prediction backends, in dispatch order.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    /// Optional secondary analyzer.
    #[serde(default)]
    pub secondary: Option<AnalyzerConfig>,
}

fn default_deadline_ms() -> u64 {
    30_000
}

fn default_max_concurrent_fanouts() -> usize {
    10
}

fn default_coherence_normalization() -> f64 {
    0.5
}

fn default_health_check_interval_secs() -> u64 {
    30
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            deadline_ms: default_deadline_ms(),
            max_concurrent_fanouts: default_max_concurrent_fanouts(),
            coherence_normalization: default_coherence_normalization(),
            health_check_interval_secs: default_health_check_interval_secs(),
            cache: CacheConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            backends: Vec::new(),
            secondary: None,
        }
    }
}

impl CoordinatorConfig {
    /// Loads configuration from a TOML file, applies environment overrides
    /// and validates the result.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read or parsed, an
    /// override is malformed, or validation fails.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        debug!(path = %path.display(), backends = config.backends.len(), "Loaded configuration");
        Ok(config)
    }

    /// Parses configuration from TOML without overrides or validation.
    ///
    /// # Errors
    /// Returns `ConfigError::Toml` on malformed input.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Applies overrides from the process environment.
    ///
    /// # Errors
    /// Returns `ConfigError::Env` if a set variable does not parse.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_env_overrides_from(|var| std::env::var(var).ok())
    }

    /// Applies overrides read through `lookup`.
    ///
    /// # Errors
    /// Returns `ConfigError::Env` if a present value does not parse.
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_DEADLINE_MS) {
            self.deadline_ms = parse_env(ENV_DEADLINE_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_CACHE_TTL_MS) {
            self.cache.ttl_ms = parse_env(ENV_CACHE_TTL_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_CONCURRENT_FANOUTS) {
            self.max_concurrent_fanouts = parse_env(ENV_MAX_CONCURRENT_FANOUTS, &value)?;
        }
        if let Some(value) = lookup(ENV_COHERENCE_NORMALIZATION) {
            self.coherence_normalization = parse_env(ENV_COHERENCE_NORMALIZATION, &value)?;
        }
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// An empty backend list is valid here; building a coordinator from
    /// configuration rejects it.
    ///
    /// # Errors
    /// Returns `ConfigError` describing the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.deadline_ms == 0 {
            return Err(ConfigError::Validation("deadline_ms must be greater than 0".to_string()));
        }
        if self.max_concurrent_fanouts == 0 || self.max_concurrent_fanouts > Semaphore::MAX_PERMITS {
            return Err(ConfigError::Validation(format!(
                "max_concurrent_fanouts must be within [1, {}]",
                Semaphore::MAX_PERMITS
            )));
        }
        if !self.coherence_normalization.is_finite() || self.coherence_normalization <= 0.0 {
            return Err(ConfigError::Validation(
                "coherence_normalization must be a positive number".to_string(),
            ));
        }
        if self.health_check_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "health_check_interval_secs must be greater than 0".to_string(),
            ));
        }

        let breaker = &self.circuit_breaker;
        if !(0.0..=1.0).contains(&breaker.failure_threshold) {
            return Err(ConfigError::Validation(
                "circuit_breaker.failure_threshold must be within [0, 1]".to_string(),
            ));
        }
        if breaker.window_secs == 0 || breaker.cooldown_secs == 0 {
            return Err(ConfigError::Validation(
                "circuit_breaker window_secs and cooldown_secs must be greater than 0".to_string(),
            ));
        }

        self.cache.validate()?;

        let mut seen = HashSet::new();
        for backend in &self.backends {
            backend.validate()?;
            if !seen.insert(backend.id.as_str()) {
                return Err(ConfigError::Validation(format!("duplicate backend id '{}'", backend.id)));
            }
        }
        if let Some(secondary) = &self.secondary {
            secondary.validate()?;
        }
        Ok(())
    }

    /// Default overall deadline as a Duration.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    /// Interval between health probes as a Duration.
    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// Renders the configuration back to TOML.
    ///
    /// # Errors
    /// Returns `ConfigError::Validation` if a value cannot be represented.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Validation(e.to_string()))
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env { var, value: value.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_backends::{BackendKind, MockSettings};
    use std::collections::HashMap;
    use std::io::Write;

    const SAMPLE: &str = r#"
deadline_ms = 5000
max_concurrent_fanouts = 4

[cache]
ttl_ms = 1000

[circuit_breaker]
cooldown_secs = 10

[[backends]]
id = "forecast"
endpoint = "http://forecast.local"
weight = 0.4

[backends.params]
priority = 0.8

[[backends]]
id = "local"
kind = "mock"

[backends.mock]
confidence = 0.6

[secondary]
endpoint = "http://reasoner.local/analyze"
timeout_ms = 2000
"#;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.deadline(), Duration::from_secs(30));
        assert_eq!(config.max_concurrent_fanouts, 10);
        assert!((config.coherence_normalization - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.cache.ttl_ms, 300_000);
        assert!(config.backends.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_sample() {
        let config = CoordinatorConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.deadline_ms, 5000);
        assert_eq!(config.cache.ttl_ms, 1000);
        assert_eq!(config.cache.max_entries, 1024);
        assert_eq!(config.circuit_breaker.cooldown_secs, 10);
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].weight, Some(0.4));
        assert_eq!(config.backends[1].kind, BackendKind::Mock);
        assert_eq!(config.backends[1].mock.as_ref().unwrap().confidence, Some(0.6));
        assert_eq!(config.secondary.as_ref().unwrap().id, "secondary");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = CoordinatorConfig::load(file.path()).unwrap();
        assert_eq!(config.backends[0].id, "forecast");
    }

    #[test]
    fn test_load_missing_file() {
        let err = CoordinatorConfig::load(Path::new("/nonexistent/concord.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let vars = HashMap::from([
            (ENV_DEADLINE_MS, "250"),
            (ENV_CACHE_TTL_MS, "100"),
            (ENV_MAX_CONCURRENT_FANOUTS, "2"),
            (ENV_COHERENCE_NORMALIZATION, "0.25"),
        ]);
        let mut config = CoordinatorConfig::default();
        config.apply_env_overrides_from(|var| vars.get(var).map(ToString::to_string)).unwrap();

        assert_eq!(config.deadline_ms, 250);
        assert_eq!(config.cache.ttl_ms, 100);
        assert_eq!(config.max_concurrent_fanouts, 2);
        assert!((config.coherence_normalization - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = CoordinatorConfig::default();
        let err = config
            .apply_env_overrides_from(|var| (var == ENV_DEADLINE_MS).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: ENV_DEADLINE_MS, .. }));
    }

    #[test]
    fn test_fanout_limit_above_semaphore_capacity_rejected() {
        let huge = usize::MAX.to_string();
        let mut config = CoordinatorConfig::default();
        config
            .apply_env_overrides_from(|var| (var == ENV_MAX_CONCURRENT_FANOUTS).then(|| huge.clone()))
            .unwrap();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_concurrent_fanouts"));

        config.max_concurrent_fanouts = Semaphore::MAX_PERMITS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        let zero_deadline = CoordinatorConfig { deadline_ms: 0, ..CoordinatorConfig::default() };
        assert!(matches!(zero_deadline.validate(), Err(ConfigError::Validation(_))));

        let bad_norm =
            CoordinatorConfig { coherence_normalization: 0.0, ..CoordinatorConfig::default() };
        assert!(bad_norm.validate().is_err());

        let mut bad_cache = CoordinatorConfig::default();
        bad_cache.cache.ttl_ms = 0;
        assert!(matches!(bad_cache.validate(), Err(ConfigError::Cache(CacheConfigError::InvalidTtl))));

        let mut duplicate = CoordinatorConfig::default();
        duplicate.backends = vec![
            BackendConfig::mock("a", MockSettings::default()),
            BackendConfig::mock("a", MockSettings::default()),
        ];
        assert!(duplicate.validate().unwrap_err().to_string().contains("duplicate"));

        let mut bad_backend = CoordinatorConfig::default();
        bad_backend.backends = vec![BackendConfig::http("a", "http://a.local").with_weight(2.0)];
        assert!(matches!(bad_backend.validate(), Err(ConfigError::Backend(_))));
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = CoordinatorConfig::from_toml_str(SAMPLE).unwrap();
        let rendered = config.to_toml_string().unwrap();
        assert_eq!(CoordinatorConfig::from_toml_str(&rendered).unwrap(), config);
    }
}
