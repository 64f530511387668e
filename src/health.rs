//! Provider health tracking
//!
//! Maintains a rolling quality signal per provider — recent successful-call
//! latencies plus cumulative success/failure counters — and derives a
//! health score the fallback orchestrator uses to rank candidates. The
//! circuit breaker remains the authority on availability: an open circuit
//! means `down` and a zero score no matter what the metrics say.
//!
//! # Example
//!
//! ```
//! use beacon_core_resilience::circuit_breaker::CircuitBreakerRegistry;
//! use beacon_core_resilience::health::{HealthConfig, ProviderHealthTracker};
//! use std::time::Duration;
//!
//! let tracker = ProviderHealthTracker::new(
//!     HealthConfig::default(),
//!     CircuitBreakerRegistry::default(),
//! );
//!
//! tracker.record_success("gemini", Duration::from_millis(800));
//! tracker.record_failure("ollama");
//!
//! let ranked = tracker.providers_by_health();
//! assert_eq!(ranked.first().map(String::as_str), Some("gemini"));
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitState};

/// Thresholds for deriving a provider's status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// How many recent successful-call latencies to keep per provider
    pub latency_window: usize,
    /// Success rate at or above which a provider is healthy
    pub healthy_success_rate: f64,
    /// Success rate at or above which a provider is merely degraded;
    /// below it, the provider is down
    pub degraded_success_rate: f64,
    /// Average latency below which a provider can be healthy
    pub healthy_latency: Duration,
    /// Average latency below which a provider is at worst degraded
    pub degraded_latency: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            latency_window: 20,
            healthy_success_rate: 0.9,
            degraded_success_rate: 0.5,
            healthy_latency: Duration::from_millis(2000),
            degraded_latency: Duration::from_millis(5000),
        }
    }
}

/// Rolling metrics for one provider
#[derive(Debug)]
struct ProviderMetrics {
    /// Most recent successful-call latencies, oldest dropped on overflow.
    /// Failures record no latency.
    latencies: VecDeque<Duration>,
    successes: u64,
    failures: u64,
    last_updated: Instant,
}

impl ProviderMetrics {
    fn new() -> Self {
        Self {
            latencies: VecDeque::new(),
            successes: 0,
            failures: 0,
            last_updated: Instant::now(),
        }
    }

    fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            // Optimistic cold start: untried providers rank ahead of
            // degraded ones
            1.0
        } else {
            self.successes as f64 / total as f64
        }
    }

    fn average_latency_ms(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        let total_ms: f64 = self
            .latencies
            .iter()
            .map(|d| d.as_secs_f64() * 1000.0)
            .sum();
        total_ms / self.latencies.len() as f64
    }
}

/// Derived status of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Healthy,
    Degraded,
    Down,
}

/// Outward health snapshot for one provider, consumed by dashboards and
/// admin tooling as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub status: ProviderStatus,
    pub average_latency_ms: f64,
    pub success_rate: f64,
    pub circuit_state: String,
    pub request_count: u64,
    pub error_count: u64,
    pub health_score: f64,
}

/// Tracks rolling per-provider quality and feeds the fallback ordering.
///
/// Shares the breaker registry with the orchestrator, so recording an
/// outcome here updates the breaker for the same call exactly once.
#[derive(Debug)]
pub struct ProviderHealthTracker {
    config: HealthConfig,
    breakers: CircuitBreakerRegistry,
    metrics: Mutex<HashMap<String, ProviderMetrics>>,
}

impl ProviderHealthTracker {
    pub fn new(config: HealthConfig, breakers: CircuitBreakerRegistry) -> Self {
        Self {
            config,
            breakers,
            metrics: Mutex::new(HashMap::new()),
        }
    }

    /// The breaker registry this tracker records into
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Record a successful call and its latency
    pub fn record_success(&self, provider: &str, latency: Duration) {
        {
            let mut metrics = self.metrics.lock().expect("health tracker lock poisoned");
            let entry = metrics
                .entry(provider.to_string())
                .or_insert_with(ProviderMetrics::new);
            entry.latencies.push_back(latency);
            while entry.latencies.len() > self.config.latency_window {
                entry.latencies.pop_front();
            }
            entry.successes += 1;
            entry.last_updated = Instant::now();
        }
        self.breakers.get_or_create(provider).record_success();
    }

    /// Record a failed call. No latency is recorded for failures.
    pub fn record_failure(&self, provider: &str) {
        {
            let mut metrics = self.metrics.lock().expect("health tracker lock poisoned");
            let entry = metrics
                .entry(provider.to_string())
                .or_insert_with(ProviderMetrics::new);
            entry.failures += 1;
            entry.last_updated = Instant::now();
        }
        self.breakers.get_or_create(provider).record_failure();
    }

    /// Health snapshot for one provider. Providers never seen report
    /// optimistic defaults with a closed circuit.
    pub fn health_of(&self, provider: &str) -> ProviderHealth {
        let metrics = self.metrics.lock().expect("health tracker lock poisoned");
        let circuit_state = self
            .breakers
            .get(provider)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed);
        self.snapshot(provider, metrics.get(provider), circuit_state)
    }

    fn snapshot(
        &self,
        provider: &str,
        metrics: Option<&ProviderMetrics>,
        circuit_state: CircuitState,
    ) -> ProviderHealth {
        let (success_rate, average_latency_ms, successes, failures) = match metrics {
            Some(m) => (m.success_rate(), m.average_latency_ms(), m.successes, m.failures),
            None => (1.0, 0.0, 0, 0),
        };

        // Circuit state takes precedence over the metric thresholds
        let status = match circuit_state {
            CircuitState::Open { .. } => ProviderStatus::Down,
            CircuitState::HalfOpen => ProviderStatus::Degraded,
            CircuitState::Closed => {
                if success_rate < self.config.degraded_success_rate {
                    ProviderStatus::Down
                } else if success_rate >= self.config.healthy_success_rate
                    && average_latency_ms < self.config.healthy_latency.as_secs_f64() * 1000.0
                {
                    ProviderStatus::Healthy
                } else {
                    ProviderStatus::Degraded
                }
            }
        };

        let state_penalty = match circuit_state {
            CircuitState::Open { .. } => 0.0,
            CircuitState::HalfOpen => 0.5,
            CircuitState::Closed => 1.0,
        };
        // Floor at 100ms so near-zero latencies don't blow the score up
        let normalized_latency = average_latency_ms.max(100.0) / 1000.0;
        let health_score = round4(success_rate * (1.0 / normalized_latency) * state_penalty);

        ProviderHealth {
            provider: provider.to_string(),
            status,
            average_latency_ms,
            success_rate,
            circuit_state: circuit_state.name().to_string(),
            request_count: successes + failures,
            error_count: failures,
            health_score,
        }
    }

    /// Snapshot every known provider — anything with recorded traffic or a
    /// breaker — sorted by health score descending, provider id ascending
    /// on ties.
    pub fn all_provider_health(&self) -> Vec<ProviderHealth> {
        let metrics = self.metrics.lock().expect("health tracker lock poisoned");
        let mut providers: HashSet<String> = metrics.keys().cloned().collect();
        providers.extend(self.breakers.provider_ids());

        let mut snapshots: Vec<ProviderHealth> = providers
            .iter()
            .map(|provider| {
                let circuit_state = self
                    .breakers
                    .get(provider)
                    .map(|b| b.state())
                    .unwrap_or(CircuitState::Closed);
                self.snapshot(provider, metrics.get(provider), circuit_state)
            })
            .collect();

        snapshots.sort_by(|a, b| {
            b.health_score
                .partial_cmp(&a.health_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.provider.cmp(&b.provider))
        });
        snapshots
    }

    /// Provider ids in fallback order: open circuits excluded, the rest by
    /// descending health score. The half-open penalty already ranks probing
    /// providers below fully closed ones of equal quality.
    pub fn providers_by_health(&self) -> Vec<String> {
        self.all_provider_health()
            .into_iter()
            .filter(|h| h.circuit_state != "open")
            .map(|h| h.provider)
            .collect()
    }

    /// Drop the rolling metrics for one provider. Its breaker is untouched.
    pub fn reset(&self, provider: &str) {
        let mut metrics = self.metrics.lock().expect("health tracker lock poisoned");
        if metrics.remove(provider).is_some() {
            debug!(provider, "reset provider metrics");
        }
    }

    /// Drop all rolling metrics
    pub fn reset_all(&self) {
        let mut metrics = self.metrics.lock().expect("health tracker lock poisoned");
        metrics.clear();
    }
}

/// Round to 4 decimal places for stable comparisons
fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;

    fn tracker() -> ProviderHealthTracker {
        ProviderHealthTracker::new(HealthConfig::default(), CircuitBreakerRegistry::default())
    }

    fn tracker_with_fast_breakers() -> ProviderHealthTracker {
        ProviderHealthTracker::new(
            HealthConfig::default(),
            CircuitBreakerRegistry::new(CircuitBreakerConfig {
                failure_threshold: 3,
                success_threshold: 2,
                timeout: Duration::from_millis(50),
            }),
        )
    }

    #[test]
    fn fast_successful_provider_is_healthy() {
        let tracker = tracker();
        for _ in 0..10 {
            tracker.record_success("p", Duration::from_millis(500));
        }
        let health = tracker.health_of("p");
        assert_eq!(health.status, ProviderStatus::Healthy);
        assert_eq!(health.success_rate, 1.0);
        assert_eq!(health.request_count, 10);
        assert!((health.average_latency_ms - 500.0).abs() < 1.0);
        // 1.0 * (1 / 0.5) * 1.0
        assert!((health.health_score - 2.0).abs() < 0.001);
    }

    #[test]
    fn slow_provider_is_degraded() {
        let tracker = tracker();
        for _ in 0..10 {
            tracker.record_success("p", Duration::from_millis(3000));
        }
        assert_eq!(tracker.health_of("p").status, ProviderStatus::Degraded);
    }

    #[test]
    fn low_success_rate_is_down() {
        let tracker = tracker();
        tracker.record_success("p", Duration::from_millis(100));
        tracker.record_failure("p");
        tracker.record_failure("p");
        // 1/3 success rate, breaker still closed (threshold 3 not reached
        // consecutively... two consecutive failures < default threshold)
        let health = tracker.health_of("p");
        assert_eq!(health.status, ProviderStatus::Down);
        assert_eq!(health.error_count, 2);
    }

    #[test]
    fn open_circuit_zeroes_the_score_and_reports_down() {
        let tracker = tracker();
        // Plenty of good history, then the breaker trips
        for _ in 0..20 {
            tracker.record_success("p", Duration::from_millis(200));
        }
        for _ in 0..3 {
            tracker.record_failure("p");
        }
        let health = tracker.health_of("p");
        assert_eq!(health.circuit_state, "open");
        assert_eq!(health.status, ProviderStatus::Down);
        assert_eq!(health.health_score, 0.0);
    }

    #[tokio::test]
    async fn half_open_halves_the_penalty_and_reports_degraded() {
        let tracker = tracker_with_fast_breakers();
        for _ in 0..20 {
            tracker.record_success("p", Duration::from_millis(100));
        }
        for _ in 0..3 {
            tracker.record_failure("p");
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let health = tracker.health_of("p");
        assert_eq!(health.circuit_state, "half_open");
        assert_eq!(health.status, ProviderStatus::Degraded);
        assert!(health.health_score > 0.0);

        // Same metrics with a closed circuit would score exactly double
        let success_rate = health.success_rate;
        let normalized = (health.average_latency_ms.max(100.0)) / 1000.0;
        let closed_score = (success_rate * (1.0 / normalized) * 10_000.0).round() / 10_000.0;
        assert!((health.health_score * 2.0 - closed_score).abs() < 0.001);
    }

    #[test]
    fn lower_latency_never_lowers_the_score() {
        let fast = tracker();
        let slow = tracker();
        for _ in 0..10 {
            fast.record_success("p", Duration::from_millis(300));
            slow.record_success("p", Duration::from_millis(2500));
        }
        assert!(fast.health_of("p").health_score >= slow.health_of("p").health_score);
    }

    #[test]
    fn higher_success_rate_never_lowers_the_score() {
        let better = tracker();
        let worse = tracker();
        for _ in 0..9 {
            better.record_success("p", Duration::from_millis(1000));
            worse.record_success("p", Duration::from_millis(1000));
        }
        better.record_success("p", Duration::from_millis(1000));
        worse.record_failure("p");
        assert!(better.health_of("p").health_score >= worse.health_of("p").health_score);
    }

    #[test]
    fn latency_window_drops_oldest_samples() {
        let tracker = tracker();
        // 20 slow samples, then 20 fast ones push them all out
        for _ in 0..20 {
            tracker.record_success("p", Duration::from_millis(4000));
        }
        for _ in 0..20 {
            tracker.record_success("p", Duration::from_millis(200));
        }
        let health = tracker.health_of("p");
        assert!((health.average_latency_ms - 200.0).abs() < 1.0);
    }

    #[test]
    fn unknown_provider_reports_optimistic_defaults() {
        let tracker = tracker();
        let health = tracker.health_of("never-seen");
        assert_eq!(health.status, ProviderStatus::Healthy);
        assert_eq!(health.success_rate, 1.0);
        assert_eq!(health.request_count, 0);
        assert_eq!(health.circuit_state, "closed");
        // 1.0 * (1 / 0.1) * 1.0 — the 100ms floor in action
        assert!((health.health_score - 10.0).abs() < 0.001);
    }

    #[test]
    fn all_provider_health_includes_breaker_only_providers() {
        let tracker = tracker();
        tracker.record_success("seen", Duration::from_millis(500));
        // A provider with a breaker but no recorded traffic still appears
        tracker.breakers().get_or_create("configured-only");

        let all = tracker.all_provider_health();
        let ids: Vec<&str> = all.iter().map(|h| h.provider.as_str()).collect();
        assert!(ids.contains(&"seen"));
        assert!(ids.contains(&"configured-only"));
    }

    #[test]
    fn ranking_sorts_by_score_then_id() {
        let tracker = tracker();
        for _ in 0..10 {
            tracker.record_success("fast", Duration::from_millis(200));
            tracker.record_success("slow", Duration::from_millis(3000));
        }
        // Two untried providers tie at the cold-start score; id breaks it
        tracker.breakers().get_or_create("bravo");
        tracker.breakers().get_or_create("alpha");

        let ranked = tracker.providers_by_health();
        assert_eq!(ranked[0], "alpha");
        assert_eq!(ranked[1], "bravo");
        let fast_pos = ranked.iter().position(|p| p == "fast").unwrap();
        let slow_pos = ranked.iter().position(|p| p == "slow").unwrap();
        assert!(fast_pos < slow_pos);
    }

    #[test]
    fn open_circuits_are_excluded_from_the_ranking() {
        let tracker = tracker();
        tracker.record_success("up", Duration::from_millis(300));
        tracker.breakers().get_or_create("tripped").force_open();

        let ranked = tracker.providers_by_health();
        assert!(ranked.contains(&"up".to_string()));
        assert!(!ranked.contains(&"tripped".to_string()));
    }

    #[test]
    fn reset_clears_metrics_but_not_the_breaker() {
        let tracker = tracker();
        for _ in 0..3 {
            tracker.record_failure("p");
        }
        assert!(tracker.breakers().get("p").unwrap().state().is_open());

        tracker.reset("p");
        let health = tracker.health_of("p");
        assert_eq!(health.request_count, 0);
        // Circuit state survives a metrics reset
        assert_eq!(health.circuit_state, "open");
    }
}
