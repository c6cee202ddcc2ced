//! Core data types for the fingerprint cache.

use crate::composer::ComposedResponse;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A stored composed response with its expiry metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Fingerprint the response was computed for.
    pub fingerprint: String,
    /// The shared response handed to every reader.
    pub response: Arc<ComposedResponse>,
    /// When the entry was stored.
    pub inserted_at: Instant,
    /// How long the entry stays fresh.
    pub ttl: Duration,
}

impl CacheEntry {
    /// Create a new entry stored at `now`.
    pub fn new(fingerprint: String, response: Arc<ComposedResponse>, ttl: Duration, now: Instant) -> Self {
        Self { fingerprint, response, inserted_at: now, ttl }
    }

    /// Whether the entry has outlived its TTL at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) > self.ttl
    }
}

/// Cache statistics for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups answered by a fresh entry.
    pub hits: u64,
    /// Lookups that started a new computation.
    pub misses: u64,
    /// Lookups that joined a computation already in flight.
    pub coalesced: u64,
    /// Entries dropped to respect the capacity bound.
    pub evictions: u64,
    /// Entries dropped because their TTL passed.
    pub expirations: u64,
    /// Current number of stored entries.
    pub entries: usize,
    /// Current number of computations in flight.
    pub in_flight: usize,
}

/// How a `get_or_compute` call was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    /// Served from a fresh entry.
    Hit,
    /// Joined a computation started by another caller.
    Coalesced,
    /// Ran the computation.
    Computed,
    /// Cache state was unusable; computed without deduplication.
    Bypassed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_entry_expiry_is_strict() {
        let now = Instant::now();
        let response = Arc::new(ComposedResponse::for_tests("fp", Utc::now()));
        let entry = CacheEntry::new("fp".to_string(), response, Duration::from_millis(100), now);

        assert!(!entry.is_expired(now));
        assert!(!entry.is_expired(now + Duration::from_millis(100)));
        assert!(entry.is_expired(now + Duration::from_millis(101)));
    }

    #[test]
    fn test_cache_stats_default() {
        let stats = CacheStats::default();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.in_flight, 0);
    }
}
