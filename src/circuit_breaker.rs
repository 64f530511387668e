//! Circuit breaker: per-provider failure isolation
//!
//! Prevents cascading calls to a failing upstream provider. Three states:
//! - Closed: normal operation, calls pass through
//! - Open: provider is unhealthy, calls are rejected immediately
//! - HalfOpen: probing whether the provider has recovered
//!
//! The Open→HalfOpen transition is evaluated lazily at the top of every
//! public method that reads or uses state — there is no background timer,
//! which keeps the state machine deterministic and wall-clock-free to test.
//!
//! # Example
//!
//! ```
//! use beacon_core_resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::new("gemini", CircuitBreakerConfig::default());
//! assert!(breaker.can_execute());
//!
//! breaker.record_failure();
//! breaker.record_failure();
//! breaker.record_failure(); // default threshold — circuit opens
//! assert!(!breaker.can_execute());
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ResilienceError;

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, calls pass through normally
    Closed,
    /// Circuit is open, calls are rejected immediately.
    /// `next_probe` is when a half-open probe becomes eligible.
    Open { next_probe: Instant },
    /// Circuit is half-open, probing provider recovery
    HalfOpen,
}

impl CircuitState {
    /// Stable string name, used in outward snapshots.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open { .. } => "open",
            Self::HalfOpen => "half_open",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    pub fn is_half_open(&self) -> bool {
        matches!(self, Self::HalfOpen)
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed before the circuit opens
    pub failure_threshold: u32,
    /// Consecutive successes in HalfOpen before the circuit closes
    pub success_threshold: u32,
    /// How long an open circuit waits before allowing a half-open probe
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Internal mutable state, guarded by the breaker's mutex
#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_at: Option<Instant>,
    last_success_at: Option<Instant>,
    total_requests: u64,
    total_failures: u64,
    total_successes: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_at: None,
            last_success_at: None,
            total_requests: 0,
            total_failures: 0,
            total_successes: 0,
        }
    }

    /// Lazy Open→HalfOpen evaluation. Called at the top of every public
    /// method that reads or uses state.
    fn evaluate(&mut self, provider: &str) {
        if let CircuitState::Open { next_probe } = self.state {
            if Instant::now() >= next_probe {
                self.state = CircuitState::HalfOpen;
                self.consecutive_successes = 0;
                debug!(provider, "circuit half-open, probing recovery");
            }
        }
    }
}

/// Read-only snapshot of a breaker's counters and state.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub provider: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure_at: Option<Instant>,
    pub last_success_at: Option<Instant>,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_successes: u64,
}

/// Per-provider circuit breaker.
///
/// Thread-safe; the critical sections are short timestamp comparisons and
/// counter updates, so a plain mutex is sufficient and nothing suspends
/// while holding it.
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a new breaker for `provider` with the given configuration
    pub fn new(provider: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    /// Provider id this breaker protects
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Get the configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether a call is currently permitted. Side-effect-free except for
    /// the lazy Open→HalfOpen transition.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock().expect("CircuitBreaker lock poisoned");
        inner.evaluate(&self.provider);
        !inner.state.is_open()
    }

    /// Current state, after the same lazy evaluation as [`can_execute`].
    ///
    /// [`can_execute`]: CircuitBreaker::can_execute
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().expect("CircuitBreaker lock poisoned");
        inner.evaluate(&self.provider);
        inner.state
    }

    /// Time remaining until a half-open probe is eligible, floored at zero.
    /// `None` when the circuit is not open.
    pub fn retry_after(&self) -> Option<Duration> {
        let mut inner = self.inner.lock().expect("CircuitBreaker lock poisoned");
        inner.evaluate(&self.provider);
        match inner.state {
            CircuitState::Open { next_probe } => {
                Some(next_probe.saturating_duration_since(Instant::now()))
            }
            _ => None,
        }
    }

    /// Record a successful call, possibly transitioning state
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("CircuitBreaker lock poisoned");
        inner.evaluate(&self.provider);
        inner.total_requests += 1;
        inner.total_successes += 1;
        inner.last_success_at = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    debug!(provider = %self.provider, "circuit closed after successful probes");
                }
            }
            CircuitState::Open { .. } => {
                // A success while open means a caller bypassed can_execute.
                // Treat it as recovery evidence and close.
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.consecutive_successes = 0;
            }
        }
    }

    /// Record a failed call, possibly transitioning state
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("CircuitBreaker lock poisoned");
        inner.evaluate(&self.provider);
        let now = Instant::now();
        inner.total_requests += 1;
        inner.total_failures += 1;
        inner.last_failure_at = Some(now);

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open {
                        next_probe: now + self.config.timeout,
                    };
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    debug!(provider = %self.provider, "circuit opened after repeated failures");
                }
            }
            CircuitState::HalfOpen => {
                // Any failure during probing reopens immediately
                inner.state = CircuitState::Open {
                    next_probe: now + self.config.timeout,
                };
                inner.consecutive_successes = 0;
                debug!(provider = %self.provider, "probe failed, circuit reopened");
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Execute an operation with circuit breaker protection.
    ///
    /// Rejects with [`ResilienceError::CircuitOpen`] when the circuit is
    /// open. Otherwise runs `op`, records the outcome, and propagates any
    /// error after recording. Admission rejections returned by `op` itself
    /// are not recorded as failures.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ResilienceError>>,
    {
        if !self.can_execute() {
            return Err(ResilienceError::CircuitOpen {
                provider: self.provider.clone(),
                retry_after: self.retry_after().unwrap_or(Duration::ZERO),
            });
        }

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                if e.should_trip_breaker() {
                    self.record_failure();
                }
                Err(e)
            }
        }
    }

    /// Force the circuit closed and zero the working counters. Cumulative
    /// totals are preserved.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("CircuitBreaker lock poisoned");
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
    }

    /// Force the circuit open as if a failure had just occurred
    pub fn force_open(&self) {
        let mut inner = self.inner.lock().expect("CircuitBreaker lock poisoned");
        let now = Instant::now();
        inner.state = CircuitState::Open {
            next_probe: now + self.config.timeout,
        };
        inner.last_failure_at = Some(now);
        inner.consecutive_successes = 0;
    }

    /// Snapshot counters and state. Triggers the lazy Open→HalfOpen
    /// evaluation first so the reported state is current.
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock().expect("CircuitBreaker lock poisoned");
        inner.evaluate(&self.provider);
        CircuitBreakerStats {
            provider: self.provider.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            last_failure_at: inner.last_failure_at,
            last_success_at: inner.last_success_at,
            total_requests: inner.total_requests,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
        }
    }
}

/// Registry of per-provider breakers, created on demand and kept for the
/// process lifetime. Acceptable for a bounded provider set — entries are
/// never evicted.
#[derive(Debug, Clone)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Arc<RwLock<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry; new breakers inherit `config`
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Fetch the breaker for `provider`, creating it on first reference
    pub fn get_or_create(&self, provider: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().expect("registry lock poisoned");
            if let Some(breaker) = breakers.get(provider) {
                return Arc::clone(breaker);
            }
        }
        let mut breakers = self.breakers.write().expect("registry lock poisoned");
        Arc::clone(
            breakers
                .entry(provider.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(provider, self.config.clone()))),
        )
    }

    /// Fetch the breaker for `provider` without creating one
    pub fn get(&self, provider: &str) -> Option<Arc<CircuitBreaker>> {
        let breakers = self.breakers.read().expect("registry lock poisoned");
        breakers.get(provider).cloned()
    }

    /// Ids of every provider that has a breaker
    pub fn provider_ids(&self) -> Vec<String> {
        let breakers = self.breakers.read().expect("registry lock poisoned");
        breakers.keys().cloned().collect()
    }

    /// Snapshot stats for every breaker
    pub fn all_stats(&self) -> Vec<CircuitBreakerStats> {
        let breakers = self.breakers.read().expect("registry lock poisoned");
        breakers.values().map(|b| b.stats()).collect()
    }

    /// Force every breaker closed (admin tooling)
    pub fn reset_all(&self) {
        let breakers = self.breakers.read().expect("registry lock poisoned");
        for breaker in breakers.values() {
            breaker.reset();
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
