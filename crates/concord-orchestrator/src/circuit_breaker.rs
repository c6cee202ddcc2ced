//! Circuit breaker pattern for backend failure detection.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failure rate above which the circuit opens (default: 0.5).
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,
    /// Sliding window for the failure rate in seconds (default: 300).
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Seconds an open circuit skips its backend (default: 60).
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Samples required in the window before the circuit may open (default: 8).
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

fn default_failure_threshold() -> f64 {
    0.5
}

fn default_window_secs() -> u64 {
    300 // 5 minutes
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_min_samples() -> usize {
    8
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_secs: default_window_secs(),
            cooldown_secs: default_cooldown_secs(),
            min_samples: default_min_samples(),
        }
    }
}

/// Circuit breaker state for a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed - normal operation.
    Closed,
    /// Circuit is open - skipping backend until cooldown expires.
    Open(Instant),
    /// Circuit is half-open - testing recovery with one request.
    HalfOpen,
}

impl CircuitState {
    /// Checks if the circuit should skip this backend.
    pub fn should_skip(&self, cooldown: Duration) -> bool {
        match self {
            Self::Closed | Self::HalfOpen => false,
            Self::Open(opened_at) => opened_at.elapsed() < cooldown,
        }
    }

    /// Transitions to half-open if cooldown expired.
    pub fn transition_if_cooldown_expired(&self, cooldown: Duration) -> Self {
        match self {
            Self::Open(opened_at) if opened_at.elapsed() >= cooldown => Self::HalfOpen,
            _ => *self,
        }
    }

    /// Short lowercase name for reports.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open(_) => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Sliding-window outcome history for one backend.
#[derive(Debug, Clone)]
struct BackendWindow {
    successes: VecDeque<Instant>,
    failures: VecDeque<Instant>,
    window: Duration,
}

impl BackendWindow {
    fn new(window: Duration) -> Self {
        Self { successes: VecDeque::new(), failures: VecDeque::new(), window }
    }

    fn record(&mut self, success: bool) {
        let now = Instant::now();
        if success {
            self.successes.push_back(now);
        } else {
            self.failures.push_back(now);
        }
        Self::prune(&mut self.successes, now, self.window);
        Self::prune(&mut self.failures, now, self.window);
    }

    fn samples(&self) -> usize {
        self.successes.len() + self.failures.len()
    }

    fn failure_rate(&self) -> f64 {
        let total = self.samples();
        if total == 0 {
            return 0.0;
        }
        self.failures.len() as f64 / total as f64
    }

    fn prune(entries: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while entries.front().is_some_and(|oldest| now.duration_since(*oldest) > window) {
            entries.pop_front();
        }
    }
}

/// Tracks backend outcomes and skips backends that keep failing.
///
/// A backend whose failure rate over the window exceeds the threshold, once
/// at least `min_samples` outcomes are known, is skipped for the cooldown.
/// After the cooldown one trial request decides between closing and
/// reopening the circuit.
#[derive(Debug)]
pub struct CircuitBreaker {
    states: RwLock<HashMap<String, CircuitState>>,
    windows: RwLock<HashMap<String, BackendWindow>>,
    failure_threshold: f64,
    window: Duration,
    cooldown: Duration,
    min_samples: usize,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::from_config(&CircuitBreakerConfig::default())
    }

    /// Creates a circuit breaker from configuration.
    #[must_use]
    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::with_settings(
            config.failure_threshold,
            Duration::from_secs(config.window_secs),
            Duration::from_secs(config.cooldown_secs),
            config.min_samples,
        )
    }

    /// Creates a new circuit breaker with custom settings.
    #[must_use]
    pub fn with_settings(
        failure_threshold: f64,
        window: Duration,
        cooldown: Duration,
        min_samples: usize,
    ) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            windows: RwLock::new(HashMap::new()),
            failure_threshold,
            window,
            cooldown,
            min_samples,
        }
    }

    fn maybe_open_circuit(&self, backend_id: &str) {
        let (failure_rate, total_samples) = {
            let windows = self.windows.read().unwrap_or_else(PoisonError::into_inner);
            windows.get(backend_id).map_or((0.0, 0), |w| (w.failure_rate(), w.samples()))
        };

        if total_samples < self.min_samples || failure_rate <= self.failure_threshold {
            return;
        }

        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(backend_id.to_string()).or_insert(CircuitState::Closed);
        if *state == CircuitState::Closed {
            *state = CircuitState::Open(Instant::now());
            warn!(
                backend_id,
                failure_rate,
                threshold = self.failure_threshold,
                total_samples,
                "Circuit breaker: Closed -> Open (failure rate exceeded threshold)"
            );
        }
    }

    fn record_outcome(&self, backend_id: &str, success: bool) {
        {
            let mut windows = self.windows.write().unwrap_or_else(PoisonError::into_inner);
            windows
                .entry(backend_id.to_string())
                .or_insert_with(|| BackendWindow::new(self.window))
                .record(success);
        }

        let mut recovered = false;
        {
            let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
            let state = states.entry(backend_id.to_string()).or_insert(CircuitState::Closed);
            if *state == CircuitState::HalfOpen {
                if success {
                    *state = CircuitState::Closed;
                    recovered = true;
                    debug!(backend_id, "Circuit breaker: HalfOpen -> Closed (recovery successful)");
                } else {
                    *state = CircuitState::Open(Instant::now());
                    warn!(backend_id, "Circuit breaker: HalfOpen -> Open (recovery failed)");
                }
            }
        }

        if recovered {
            // Failures from before the outage must not reopen the circuit right away.
            let mut windows = self.windows.write().unwrap_or_else(PoisonError::into_inner);
            windows.insert(backend_id.to_string(), BackendWindow::new(self.window));
            return;
        }

        self.maybe_open_circuit(backend_id);
    }

    /// Records a successful call to a backend.
    pub fn record_success(&self, backend_id: &str) {
        self.record_outcome(backend_id, true);
    }

    /// Records a failed or timed-out call to a backend.
    pub fn record_failure(&self, backend_id: &str) {
        self.record_outcome(backend_id, false);
    }

    /// Checks if a backend should be skipped.
    ///
    /// Moves an open circuit whose cooldown has passed to half-open, which
    /// lets the next request through.
    pub fn should_skip(&self, backend_id: &str) -> bool {
        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(backend_id.to_string()).or_insert(CircuitState::Closed);
        *state = state.transition_if_cooldown_expired(self.cooldown);
        state.should_skip(self.cooldown)
    }

    /// Failure rate (0.0-1.0) of a backend in the current window.
    pub fn failure_rate(&self, backend_id: &str) -> f64 {
        let windows = self.windows.read().unwrap_or_else(PoisonError::into_inner);
        windows.get(backend_id).map_or(0.0, BackendWindow::failure_rate)
    }

    /// Gets the current circuit state for a backend.
    pub fn state(&self, backend_id: &str) -> CircuitState {
        let states = self.states.read().unwrap_or_else(PoisonError::into_inner);
        states.get(backend_id).copied().unwrap_or(CircuitState::Closed)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn breaker(cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::with_settings(0.5, Duration::from_secs(300), cooldown, 8)
    }

    #[test]
    fn test_circuit_breaker_defaults() {
        let breaker = CircuitBreaker::new();
        assert!((breaker.failure_threshold - 0.5).abs() < f64::EPSILON);
        assert_eq!(breaker.window, Duration::from_secs(300));
        assert_eq!(breaker.cooldown, Duration::from_secs(60));
        assert_eq!(breaker.min_samples, 8);
    }

    #[test]
    fn test_circuit_opens_after_high_failure_rate() {
        let breaker = breaker(Duration::from_secs(60));

        // 6 failures and 2 successes: 75% failure rate
        for _ in 0..6 {
            breaker.record_failure("forecast");
        }
        for _ in 0..2 {
            breaker.record_success("forecast");
        }

        assert!(breaker.should_skip("forecast"));
        assert!(matches!(breaker.state("forecast"), CircuitState::Open(_)));
        assert_eq!(breaker.state("forecast").label(), "open");
    }

    #[test]
    fn test_circuit_needs_min_samples() {
        let breaker = breaker(Duration::from_secs(60));
        for _ in 0..7 {
            breaker.record_failure("forecast");
        }
        assert!(!breaker.should_skip("forecast"));
        breaker.record_failure("forecast");
        assert!(breaker.should_skip("forecast"));
    }

    #[test]
    fn test_circuit_remains_closed_with_acceptable_failure_rate() {
        let breaker = breaker(Duration::from_secs(60));

        // 3 failures and 7 successes: 30% failure rate
        for _ in 0..3 {
            breaker.record_failure("forecast");
        }
        for _ in 0..7 {
            breaker.record_success("forecast");
        }

        assert!(!breaker.should_skip("forecast"));
        assert_eq!(breaker.state("forecast"), CircuitState::Closed);
    }

    #[test]
    fn test_circuit_transitions_to_half_open_after_cooldown() {
        let breaker = breaker(Duration::from_millis(100));
        for _ in 0..8 {
            breaker.record_failure("forecast");
        }
        assert!(breaker.should_skip("forecast"));

        thread::sleep(Duration::from_millis(150));

        assert!(!breaker.should_skip("forecast"));
        assert_eq!(breaker.state("forecast"), CircuitState::HalfOpen);
    }

    #[test]
    fn test_circuit_closes_after_success_in_half_open() {
        let breaker = breaker(Duration::from_millis(100));
        for _ in 0..8 {
            breaker.record_failure("forecast");
        }
        thread::sleep(Duration::from_millis(150));
        breaker.should_skip("forecast");

        breaker.record_success("forecast");

        assert_eq!(breaker.state("forecast"), CircuitState::Closed);
        assert!(breaker.failure_rate("forecast").abs() < f64::EPSILON);
    }

    #[test]
    fn test_circuit_reopens_after_failure_in_half_open() {
        let breaker = breaker(Duration::from_millis(100));
        for _ in 0..8 {
            breaker.record_failure("forecast");
        }
        thread::sleep(Duration::from_millis(150));
        breaker.should_skip("forecast");

        breaker.record_failure("forecast");

        assert!(matches!(breaker.state("forecast"), CircuitState::Open(_)));
    }

    #[test]
    fn test_failure_rate_calculation() {
        let breaker = CircuitBreaker::new();
        for _ in 0..2 {
            breaker.record_failure("forecast");
        }
        for _ in 0..3 {
            breaker.record_success("forecast");
        }
        assert!((breaker.failure_rate("forecast") - 0.4).abs() < 0.01);
        assert!(breaker.failure_rate("unknown").abs() < f64::EPSILON);
    }

    #[test]
    fn test_config_from_toml() {
        let config: CircuitBreakerConfig = toml::from_str("cooldown_secs = 5").unwrap();
        assert_eq!(config.cooldown_secs, 5);
        assert_eq!(config.min_samples, 8);
        let breaker = CircuitBreaker::from_config(&config);
        assert_eq!(breaker.cooldown, Duration::from_secs(5));
    }
}
