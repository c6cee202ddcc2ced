//! FingerprintCache implementation with TTL expiry and in-flight deduplication.

use crate::composer::ComposedResponse;
use crate::error::{CoordinatorError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::{CacheConfig, CacheConfigError};
use super::types::{CacheEntry, CacheLookup, CacheStats};

type SharedResult = Result<Arc<ComposedResponse>>;
type ResultSlot = watch::Receiver<Option<SharedResult>>;

/// A computation currently running for one fingerprint.
#[derive(Debug)]
struct InFlight {
    /// Distinguishes successive computations for the same fingerprint.
    id: u64,
    /// Receives the result once the computation finishes.
    receiver: ResultSlot,
}

/// Everything guarded by the cache mutex.
#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    in_flight: HashMap<String, InFlight>,
    next_flight_id: u64,
    stats: CacheStats,
}

/// Outcome of the locked lookup step.
enum Claim {
    Hit(Arc<ComposedResponse>),
    Wait(ResultSlot),
    Lead { id: u64, sender: watch::Sender<Option<SharedResult>>, receiver: ResultSlot },
}

impl CacheState {
    fn claim(&mut self, fingerprint: &str, now: Instant) -> Claim {
        let fresh = self
            .entries
            .get(fingerprint)
            .map(|entry| (entry.is_expired(now), Arc::clone(&entry.response)));
        match fresh {
            Some((false, response)) => {
                self.stats.hits += 1;
                return Claim::Hit(response);
            }
            Some((true, _)) => {
                self.entries.remove(fingerprint);
                self.stats.expirations += 1;
            }
            None => {}
        }

        if let Some(flight) = self.in_flight.get(fingerprint) {
            self.stats.coalesced += 1;
            return Claim::Wait(flight.receiver.clone());
        }

        self.stats.misses += 1;
        let id = self.next_flight_id;
        self.next_flight_id += 1;
        let (sender, receiver) = watch::channel(None);
        self.in_flight.insert(fingerprint.to_string(), InFlight { id, receiver: receiver.clone() });
        Claim::Lead { id, sender, receiver }
    }

    fn release(&mut self, fingerprint: &str, id: u64) {
        if self.in_flight.get(fingerprint).is_some_and(|flight| flight.id == id) {
            self.in_flight.remove(fingerprint);
        }
    }

    fn store(&mut self, entry: CacheEntry, max_entries: usize) {
        if !self.entries.contains_key(&entry.fingerprint) && self.entries.len() >= max_entries {
            if let Some(oldest) = Self::find_oldest_key(&self.entries) {
                self.entries.remove(&oldest);
                self.stats.evictions += 1;
                info!(fingerprint = %oldest, "Evicted oldest response from cache");
            }
        }
        self.entries.insert(entry.fingerprint.clone(), entry);
    }

    /// Find the key of the entry stored first.
    fn find_oldest_key(entries: &HashMap<String, CacheEntry>) -> Option<String> {
        entries
            .iter()
            .min_by_key(|(_, entry)| entry.inserted_at)
            .map(|(key, _)| key.clone())
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let swept = before - self.entries.len();
        self.stats.expirations += swept as u64;
        swept
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            in_flight: self.in_flight.len(),
            ..self.stats.clone()
        }
    }
}

/// Removes the in-flight registration when the computation task ends,
/// including when it panics or is dropped by a shutting-down runtime.
struct InFlightGuard {
    state: Weak<Mutex<CacheState>>,
    fingerprint: String,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            if let Ok(mut state) = state.lock() {
                state.release(&self.fingerprint, self.id);
            }
        }
    }
}

/// Content-addressed store of composed responses.
///
/// Fresh entries are served directly. A miss registers one computation per
/// fingerprint; concurrent callers for the same fingerprint wait on it and
/// receive the same `Arc` (or an equal error). The computation runs on its
/// own task so a caller that gives up does not cancel it for the others.
#[derive(Debug, Clone)]
pub struct FingerprintCache {
    /// Entries, in-flight registry and counters under one lock.
    state: Arc<Mutex<CacheState>>,
    /// Cache configuration.
    config: CacheConfig,
}

impl FingerprintCache {
    /// Create a new cache with the given configuration.
    ///
    /// # Errors
    /// Returns `CacheConfigError` if the configuration is invalid.
    pub fn new(config: CacheConfig) -> std::result::Result<Self, CacheConfigError> {
        config.validate()?;

        Ok(Self { state: Arc::new(Mutex::new(CacheState::default())), config })
    }

    /// Returns the cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| CoordinatorError::CacheUnavailable("cache state lock poisoned".to_string()))
    }

    /// Get a fresh response or compute it exactly once per fingerprint.
    ///
    /// If the cache state is unusable the computation runs directly, without
    /// deduplication or storage.
    ///
    /// # Errors
    /// Returns the computation's error, or `ComputationAborted` if it ended
    /// without producing a result.
    pub async fn get_or_compute<F, Fut>(&self, fingerprint: &str, compute: F) -> SharedResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SharedResult> + Send + 'static,
    {
        self.resolve(fingerprint, None, compute).await
    }

    /// Like [`FingerprintCache::get_or_compute`], but a caller that joins a
    /// computation already in flight waits at most `max_wait` for it.
    ///
    /// The shared computation keeps running when a joined caller gives up.
    ///
    /// # Errors
    /// Returns `DeadlineExceeded` if a joined computation outlives
    /// `max_wait`, otherwise the same errors as `get_or_compute`.
    pub async fn get_or_compute_within<F, Fut>(
        &self,
        fingerprint: &str,
        max_wait: Duration,
        compute: F,
    ) -> SharedResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SharedResult> + Send + 'static,
    {
        self.resolve(fingerprint, Some(max_wait), compute).await
    }

    async fn resolve<F, Fut>(&self, fingerprint: &str, max_wait: Option<Duration>, compute: F) -> SharedResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SharedResult> + Send + 'static,
    {
        let claim = match self.lock() {
            Ok(mut state) => Some(state.claim(fingerprint, Instant::now())),
            Err(err) => {
                warn!(fingerprint, error = %err, lookup = ?CacheLookup::Bypassed, "Computing without cache");
                None
            }
        };
        let Some(claim) = claim else {
            return compute().await;
        };

        match claim {
            Claim::Hit(response) => {
                debug!(fingerprint, lookup = ?CacheLookup::Hit, "Cache hit");
                Ok(response)
            }
            Claim::Wait(receiver) => {
                debug!(fingerprint, lookup = ?CacheLookup::Coalesced, "Joining in-flight computation");
                let Some(limit) = max_wait else {
                    return wait_for(receiver).await;
                };
                match tokio::time::timeout(limit, wait_for(receiver)).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(fingerprint, waited_ms = limit.as_millis() as u64, "Gave up on in-flight computation");
                        Err(CoordinatorError::DeadlineExceeded { deadline_ms: limit.as_millis() as u64 })
                    }
                }
            }
            Claim::Lead { id, sender, receiver } => {
                debug!(fingerprint, lookup = ?CacheLookup::Computed, "Cache miss, computing");
                let guard = InFlightGuard {
                    state: Arc::downgrade(&self.state),
                    fingerprint: fingerprint.to_string(),
                    id,
                };
                let cache = self.clone();
                let computation = compute();

                tokio::spawn(async move {
                    let result = computation.await;
                    cache.complete(&guard.fingerprint, guard.id, &result);
                    drop(guard);
                    let _ = sender.send(Some(result));
                });

                wait_for(receiver).await
            }
        }
    }

    /// Stores a successful result and retires the in-flight entry in one step.
    fn complete(&self, fingerprint: &str, id: u64, result: &SharedResult) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        if let Ok(response) = result {
            if self.config.enabled {
                let entry = CacheEntry::new(
                    fingerprint.to_string(),
                    Arc::clone(response),
                    self.config.ttl(),
                    Instant::now(),
                );
                state.store(entry, self.config.max_entries);
            }
        }
        state.release(fingerprint, id);
    }

    /// Returns a fresh response without computing anything.
    pub fn get(&self, fingerprint: &str) -> Option<Arc<ComposedResponse>> {
        let mut state = self.lock().ok()?;
        let (expired, response) = state
            .entries
            .get(fingerprint)
            .map(|entry| (entry.is_expired(Instant::now()), Arc::clone(&entry.response)))?;
        if expired {
            state.entries.remove(fingerprint);
            state.stats.expirations += 1;
            return None;
        }
        Some(response)
    }

    /// Stores a response directly, evicting the oldest entry when full.
    pub fn insert(&self, fingerprint: &str, response: Arc<ComposedResponse>) {
        if !self.config.enabled {
            return;
        }
        if let Ok(mut state) = self.lock() {
            let entry =
                CacheEntry::new(fingerprint.to_string(), response, self.config.ttl(), Instant::now());
            state.store(entry, self.config.max_entries);
        }
    }

    /// Remove a specific response from the cache.
    ///
    /// # Returns
    /// `true` if the response was removed, `false` if it was not found.
    pub fn remove(&self, fingerprint: &str) -> bool {
        self.lock().is_ok_and(|mut state| state.entries.remove(fingerprint).is_some())
    }

    /// Clear all stored responses. Computations in flight are unaffected.
    ///
    /// # Returns
    /// The number of removed entries.
    pub fn clear(&self) -> usize {
        let Ok(mut state) = self.lock() else {
            return 0;
        };
        let cleared_count = state.entries.len();
        state.entries.clear();
        info!(cleared_count, "Cleared response cache");
        cleared_count
    }

    /// Drops every expired entry.
    ///
    /// # Returns
    /// The number of dropped entries.
    pub fn sweep_expired(&self) -> usize {
        let swept = self.lock().map(|mut state| state.sweep(Instant::now())).unwrap_or(0);
        if swept > 0 {
            debug!(swept, "Swept expired cache entries");
        }
        swept
    }

    /// Spawns a task that sweeps expired entries every `sweep_interval`.
    ///
    /// The task ends on its own once every handle to the cache is dropped.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let state = Arc::downgrade(&self.state);
        let period = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(state) = state.upgrade() else {
                    debug!("Cache dropped, stopping sweeper");
                    break;
                };
                let swept = state.lock().map(|mut state| state.sweep(Instant::now())).unwrap_or(0);
                if swept > 0 {
                    debug!(swept, "Swept expired cache entries");
                }
            }
        })
    }

    /// Get current cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.lock().map(|state| state.snapshot()).unwrap_or_default()
    }

    /// Number of stored entries, fresh or not yet swept.
    pub fn len(&self) -> usize {
        self.lock().map(|state| state.entries.len()).unwrap_or(0)
    }

    /// Whether no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of computations currently in flight.
    pub fn in_flight_len(&self) -> usize {
        self.lock().map(|state| state.in_flight.len()).unwrap_or(0)
    }
}

/// Waits until the computation behind `receiver` publishes its result.
async fn wait_for(mut receiver: ResultSlot) -> SharedResult {
    loop {
        let current = receiver.borrow_and_update().clone();
        if let Some(result) = current {
            return result;
        }
        if receiver.changed().await.is_err() {
            let last = receiver.borrow().clone();
            return last.unwrap_or_else(|| {
                Err(CoordinatorError::ComputationAborted(
                    "computation ended without a result".to_string(),
                ))
            });
        }
    }
}
