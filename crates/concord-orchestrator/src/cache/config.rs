//! Configuration for the fingerprint cache.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration for the fingerprint cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Whether composed responses are stored. In-flight deduplication
    /// applies either way.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Milliseconds a composed response stays fresh (default: 300000 = 5 minutes).
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,

    /// Maximum number of stored responses (default: 1024).
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// How often the sweep task drops expired entries, in milliseconds
    /// (default: 60000 = 1 minute).
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_ttl_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_max_entries() -> usize {
    1024
}

fn default_sweep_interval_ms() -> u64 {
    60_000 // 1 minute
}

/// Errors that can occur during cache configuration validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheConfigError {
    /// Invalid TTL (must be > 0).
    #[error("Invalid cache TTL: must be greater than 0")]
    InvalidTtl,

    /// Invalid max entries (must be > 0).
    #[error("Invalid cache max entries: must be greater than 0")]
    InvalidMaxEntries,

    /// Invalid sweep interval (must be > 0).
    #[error("Invalid cache sweep interval: must be greater than 0")]
    InvalidSweepInterval,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            ttl_ms: default_ttl_ms(),
            max_entries: default_max_entries(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl CacheConfig {
    /// Validate the cache configuration.
    ///
    /// # Errors
    /// Returns `CacheConfigError` if any configuration value is invalid.
    pub fn validate(&self) -> Result<(), CacheConfigError> {
        if self.ttl_ms == 0 {
            return Err(CacheConfigError::InvalidTtl);
        }

        if self.max_entries == 0 {
            return Err(CacheConfigError::InvalidMaxEntries);
        }

        if self.sweep_interval_ms == 0 {
            return Err(CacheConfigError::InvalidSweepInterval);
        }

        Ok(())
    }

    /// Get the TTL as a Duration.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Get the sweep interval as a Duration.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
