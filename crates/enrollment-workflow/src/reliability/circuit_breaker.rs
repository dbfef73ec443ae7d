//! Circuit breaker keyed per downstream destination

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{elapsed_between, Clock};
use crate::config::ConfigError;
use crate::serde_duration::duration_millis;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure rate exceeded - all calls rejected
    Open,

    /// Reset timeout elapsed - exactly one trial call allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// ```text
/// ┌─────────┐  failure rate >= threshold  ┌─────────┐  reset timeout  ┌──────────┐
/// │ Closed  │ ──────────────────────────► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘                             └─────────┘                 └──────────┘
///      ▲                                       ▲      trial failed         │
///      │                                       └───────────────────────────┤
///      │                          trial succeeded                          │
///      └───────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failure rate (0.0-1.0) over the sliding window that opens the circuit
    pub failure_rate_threshold: f64,

    /// Calls required in the window before the rate is evaluated
    pub minimum_calls: u32,

    /// Number of most recent calls kept in the sliding window
    pub window_size: u32,

    /// Time to stay open before allowing a trial call
    #[serde(rename = "reset_timeout_ms", with = "duration_millis")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            minimum_calls: 3,
            window_size: 100,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_rate_threshold(mut self, threshold: f64) -> Self {
        self.failure_rate_threshold = threshold;
        self
    }

    pub fn with_minimum_calls(mut self, calls: u32) -> Self {
        self.minimum_calls = calls;
        self
    }

    pub fn with_window_size(mut self, size: u32) -> Self {
        self.window_size = size;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 1.0) {
            return Err(ConfigError::Invalid {
                field: "circuit_breaker.failure_rate_threshold",
                reason: format!("must be within (0, 1], got {}", self.failure_rate_threshold),
            });
        }
        if self.minimum_calls == 0 || self.window_size < self.minimum_calls {
            return Err(ConfigError::Invalid {
                field: "circuit_breaker.window_size",
                reason: "window_size must be >= minimum_calls >= 1".into(),
            });
        }
        Ok(())
    }
}

/// Point-in-time counters for one breaker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BreakerMetrics {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    /// Calls refused while open or while the half-open trial was taken
    pub rejections: u64,
    pub state_changes: u64,
}

#[derive(Default)]
struct Counters {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
    state_changes: AtomicU64,
}

struct BreakerInner {
    state: CircuitState,
    /// `true` for a failed call, most recent last
    window: VecDeque<bool>,
    opened_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

/// Returned by [`CircuitBreaker::acquire`] while the circuit refuses calls
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker {name} is open")]
pub struct CircuitOpen {
    pub name: String,
}

/// Failure-rate circuit breaker over a count-based sliding window
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
    counters: Counters,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
            }),
            counters: Counters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, reporting `HalfOpen` once the reset timeout has elapsed
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open if self.reset_elapsed(&inner) => CircuitState::HalfOpen,
            state => state,
        }
    }

    pub fn metrics(&self) -> BreakerMetrics {
        BreakerMetrics {
            calls: self.counters.calls.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            rejections: self.counters.rejections.load(Ordering::Relaxed),
            state_changes: self.counters.state_changes.load(Ordering::Relaxed),
        }
    }

    /// Ask permission for one call
    ///
    /// The permit must be resolved with [`CircuitBreakerPermit::success`] or
    /// [`CircuitBreakerPermit::failure`]; dropping it unresolved records nothing
    /// and frees the half-open trial slot.
    pub fn acquire(&self) -> Result<CircuitBreakerPermit<'_>, CircuitOpen> {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open && self.reset_elapsed(&inner) {
            self.transition(&mut inner, CircuitState::HalfOpen);
        }

        let state = inner.state;
        let trial = match state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                self.counters.rejections.fetch_add(1, Ordering::Relaxed);
                debug!(breaker = %self.name, %state, "call rejected by circuit breaker");
                return Err(CircuitOpen {
                    name: self.name.clone(),
                });
            }
        };

        self.counters.calls.fetch_add(1, Ordering::Relaxed);
        Ok(CircuitBreakerPermit {
            breaker: self,
            trial,
            resolved: false,
        })
    }

    fn reset_elapsed(&self, inner: &BreakerInner) -> bool {
        inner.opened_at.is_some_and(|opened_at| {
            elapsed_between(opened_at, self.clock.now()) >= self.config.reset_timeout
        })
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(self.clock.now());
                inner.trial_in_flight = false;
            }
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.trial_in_flight = false;
                inner.window.clear();
            }
        }
        self.counters.state_changes.fetch_add(1, Ordering::Relaxed);

        if to == CircuitState::Open {
            warn!(breaker = %self.name, %from, %to, "circuit breaker state changed");
        } else {
            info!(breaker = %self.name, %from, %to, "circuit breaker state changed");
        }
    }

    fn record(&self, trial: bool, failed: bool) {
        if failed {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.successes.fetch_add(1, Ordering::Relaxed);
        }

        let mut inner = self.inner.lock();

        if trial {
            inner.trial_in_flight = false;
            if inner.state == CircuitState::HalfOpen {
                let next = if failed {
                    CircuitState::Open
                } else {
                    CircuitState::Closed
                };
                self.transition(&mut inner, next);
            }
            return;
        }

        // Calls that started before the circuit opened do not move the window
        if inner.state != CircuitState::Closed {
            return;
        }

        inner.window.push_back(failed);
        while inner.window.len() > self.config.window_size as usize {
            inner.window.pop_front();
        }

        let total = inner.window.len();
        if total < self.config.minimum_calls as usize {
            return;
        }
        let failures = inner.window.iter().filter(|failed| **failed).count();
        let rate = failures as f64 / total as f64;
        if rate >= self.config.failure_rate_threshold {
            self.transition(&mut inner, CircuitState::Open);
        }
    }

    fn release_trial(&self) {
        self.inner.lock().trial_in_flight = false;
    }
}

/// Permission for a single call through a [`CircuitBreaker`]
#[must_use = "resolve the permit with success() or failure()"]
pub struct CircuitBreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl CircuitBreakerPermit<'_> {
    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record(self.trial, false);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.record(self.trial, true);
    }
}

impl Drop for CircuitBreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.release_trial();
        }
    }
}

/// Lazily created breakers sharing one configuration, keyed by destination
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for `key`, created closed on first use
    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(key) {
            return breaker.clone();
        }
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    key,
                    self.config.clone(),
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    /// State and counters of every breaker created so far, sorted by key
    pub fn snapshot(&self) -> Vec<(String, CircuitState, BreakerMetrics)> {
        let mut entries: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.state(), entry.metrics()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker(clock: &Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::new("email", CircuitBreakerConfig::default(), clock.clone())
    }

    fn fail(breaker: &CircuitBreaker, times: usize) {
        for _ in 0..times {
            breaker.acquire().expect("should allow call").failure();
        }
    }

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_rate_threshold, 0.5);
        assert_eq!(config.minimum_calls, 3);
        assert_eq!(config.window_size, 100);
        assert_eq!(config.reset_timeout, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }

    #[test]
    fn test_stays_closed_below_minimum_calls() {
        let clock = Arc::new(ManualClock::default());
        let breaker = breaker(&clock);

        fail(&breaker, 2);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_opens_when_failure_rate_reached() {
        let clock = Arc::new(ManualClock::default());
        let breaker = breaker(&clock);

        breaker.acquire().unwrap().success();
        breaker.acquire().unwrap().success();
        fail(&breaker, 1);
        assert_eq!(breaker.state(), CircuitState::Closed);

        fail(&breaker, 1);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.acquire().is_err());
        assert_eq!(breaker.metrics().rejections, 1);
    }

    #[test]
    fn test_half_open_allows_exactly_one_trial() {
        let clock = Arc::new(ManualClock::default());
        let breaker = breaker(&clock);
        fail(&breaker, 3);

        clock.advance(Duration::from_secs(59));
        assert!(breaker.acquire().is_err());

        clock.advance(Duration::from_secs(1));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let trial = breaker.acquire().expect("should allow trial");
        assert!(breaker.acquire().is_err());

        trial.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.acquire().is_ok());
    }

    #[test]
    fn test_failed_trial_restarts_reset_timer() {
        let clock = Arc::new(ManualClock::default());
        let breaker = breaker(&clock);
        fail(&breaker, 3);

        clock.advance(Duration::from_secs(60));
        breaker.acquire().expect("should allow trial").failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(30));
        assert!(breaker.acquire().is_err());

        clock.advance(Duration::from_secs(30));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_dropped_trial_frees_slot() {
        let clock = Arc::new(ManualClock::default());
        let breaker = breaker(&clock);
        fail(&breaker, 3);
        clock.advance(Duration::from_secs(60));

        drop(breaker.acquire().expect("should allow trial"));
        assert!(breaker.acquire().is_ok());
    }

    #[test]
    fn test_window_slides() {
        let clock = Arc::new(ManualClock::default());
        let config = CircuitBreakerConfig::default()
            .with_window_size(4)
            .with_minimum_calls(4);
        let breaker = CircuitBreaker::new("sms", config, clock.clone());

        fail(&breaker, 1);
        for _ in 0..4 {
            breaker.acquire().unwrap().success();
        }
        // Oldest failure has slid out: 1 failure in the last 4
        fail(&breaker, 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker, 1);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_registry_keys_breakers_independently() {
        let clock = Arc::new(ManualClock::default());
        let registry = BreakerRegistry::new(CircuitBreakerConfig::default(), clock.clone());

        fail(&registry.get("email"), 3);
        assert_eq!(registry.get("email").state(), CircuitState::Open);
        assert_eq!(registry.get("sms").state(), CircuitState::Closed);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].0, "email");
        assert_eq!(snapshot[0].2.failures, 3);
        assert_eq!(snapshot[0].2.state_changes, 1);
    }
}
