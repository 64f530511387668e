//! Sliding-window rate limiting for admission control
//!
//! Tracks the exact timestamps of accepted requests per key, so the window
//! is precise rather than bucketed: a request admitted at t is forgotten at
//! exactly t + window. Keys are free-form (`ip:<addr>`, `user:<id>`,
//! `provider:<id>`); per-key state is created lazily and pruned on access.
//!
//! # Example
//!
//! ```
//! use beacon_core_resilience::rate_limiter::{RateLimitConfig, SlidingWindowLimiter};
//! use std::time::Duration;
//!
//! let limiter = SlidingWindowLimiter::new(RateLimitConfig {
//!     max_requests: 2,
//!     window: Duration::from_secs(60),
//! });
//!
//! assert!(limiter.consume("ip:1.2.3.4").allowed);
//! assert!(limiter.consume("ip:1.2.3.4").allowed);
//!
//! let rejected = limiter.consume("ip:1.2.3.4");
//! assert!(!rejected.allowed);
//! assert!(rejected.retry_after.is_some());
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ResilienceError;

/// Configuration for one sliding-window limiter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests admitted per window
    pub max_requests: u32,
    /// Window length
    pub window: Duration,
}

impl RateLimitConfig {
    /// `n` requests per minute
    pub fn per_minute(n: u32) -> Self {
        Self {
            max_requests: n,
            window: Duration::from_secs(60),
        }
    }

    /// `n` requests per hour
    pub fn per_hour(n: u32) -> Self {
        Self {
            max_requests: n,
            window: Duration::from_secs(3600),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::per_minute(60)
    }
}

/// The outcome of a rate-limit check or consume.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Configured window limit
    pub limit: u32,
    /// Requests remaining in the current window (including this one,
    /// for a successful consume)
    pub remaining: u32,
    /// Time until the window fully resets, measured from the oldest
    /// surviving timestamp
    pub reset_after: Duration,
    /// Time until the oldest request exits the window; only set when the
    /// request was rejected
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    /// Render the HTTP header contract the embedding layer attaches to
    /// responses. `Retry-After` is present only on rejections.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            (
                "X-RateLimit-Reset",
                ceil_secs(self.reset_after).to_string(),
            ),
        ];
        if let Some(retry_after) = self.retry_after {
            headers.push(("Retry-After", ceil_secs(retry_after).to_string()));
        }
        headers
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

/// Current usage of one key, for observability.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitUsage {
    pub key: String,
    pub count: u32,
    pub limit: u32,
    pub window_secs: u64,
}

/// Precise sliding-window rate limiter.
///
/// Thread-safe; every operation prunes the key's timestamps to the live
/// window before acting, so stored state never refers to anything older
/// than `now - window`.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    /// Create a limiter with the given configuration
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Preview the decision for `key` without consuming a slot
    pub fn check(&self, key: &str) -> RateLimitDecision {
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        let count = match windows.get_mut(key) {
            Some(window) => {
                prune(window, now, self.config.window);
                window.len() as u32
            }
            None => 0,
        };
        self.decision(windows.get(key), count, count < self.config.max_requests, now)
    }

    /// Consume one slot for `key` if the window allows it. A rejected
    /// consume never mutates stored state.
    pub fn consume(&self, key: &str) -> RateLimitDecision {
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        let window = windows.entry(key.to_string()).or_default();
        prune(window, now, self.config.window);

        let allowed = (window.len() as u32) < self.config.max_requests;
        if allowed {
            window.push_back(now);
        }
        let count = window.len() as u32;
        self.decision(windows.get(key), count, allowed, now)
    }

    fn decision(
        &self,
        window: Option<&VecDeque<Instant>>,
        count: u32,
        allowed: bool,
        now: Instant,
    ) -> RateLimitDecision {
        let oldest = window.and_then(|w| w.front().copied());
        let reset_after = match oldest {
            Some(t) => (t + self.config.window).saturating_duration_since(now),
            None => self.config.window,
        };
        let retry_after = if allowed {
            None
        } else {
            Some(match oldest {
                Some(t) => (t + self.config.window).saturating_duration_since(now),
                None => self.config.window,
            })
        };
        RateLimitDecision {
            allowed,
            limit: self.config.max_requests,
            remaining: self.config.max_requests.saturating_sub(count),
            reset_after,
            retry_after,
        }
    }

    /// Drop all stored timestamps for `key`
    pub fn reset(&self, key: &str) {
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");
        windows.remove(key);
    }

    /// Current in-window count for `key`, for observability
    pub fn usage(&self, key: &str) -> RateLimitUsage {
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        let count = match windows.get_mut(key) {
            Some(window) => {
                prune(window, now, self.config.window);
                window.len() as u32
            }
            None => 0,
        };
        RateLimitUsage {
            key: key.to_string(),
            count,
            limit: self.config.max_requests,
            window_secs: self.config.window.as_secs(),
        }
    }

    /// Prune every key and delete the ones left empty. Returns the number
    /// of keys removed. Run this periodically to bound memory under
    /// sustained traffic from many distinct keys.
    pub fn sweep(&self) -> usize {
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        let before = windows.len();
        windows.retain(|_, window| {
            prune(window, now, self.config.window);
            !window.is_empty()
        });
        let removed = before - windows.len();
        if removed > 0 {
            debug!(removed, "swept idle rate-limit keys");
        }
        removed
    }

    /// Number of keys currently tracked
    pub fn key_count(&self) -> usize {
        let windows = self.windows.lock().expect("rate limiter lock poisoned");
        windows.len()
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, width: Duration) {
    let window_start = now.checked_sub(width);
    if let Some(start) = window_start {
        while window.front().is_some_and(|&t| t <= start) {
            window.pop_front();
        }
    }
}

/// Who is asking: an IP for anonymous traffic, plus a user id once
/// authenticated.
#[derive(Debug, Clone)]
pub struct RequestIdentity {
    pub ip: String,
    pub user: Option<String>,
}

impl RequestIdentity {
    pub fn anonymous(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user: None,
        }
    }

    pub fn authenticated(ip: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user: Some(user.into()),
        }
    }

    /// The rate-limit key for the identity tier: the user limiter once
    /// authenticated, the (stricter) ip limiter otherwise.
    pub fn tier_key(&self) -> String {
        match &self.user {
            Some(user) => format!("user:{user}"),
            None => format!("ip:{}", self.ip),
        }
    }
}

/// Limits for the three independent tiers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieredRateLimitConfig {
    /// Anonymous traffic, keyed by address — the strictest tier
    pub ip: RateLimitConfig,
    /// Authenticated traffic, keyed by user id
    pub user: RateLimitConfig,
    /// Aggregate protection for each upstream provider, regardless of caller
    pub provider: RateLimitConfig,
}

impl Default for TieredRateLimitConfig {
    fn default() -> Self {
        Self {
            ip: RateLimitConfig::per_minute(20),
            user: RateLimitConfig::per_minute(60),
            provider: RateLimitConfig::per_minute(600),
        }
    }
}

/// The three limiter tiers composed at the orchestration layer.
///
/// Exactly one identity tier (ip or user) is consumed at admission; the
/// provider tier is consumed by the fallback orchestrator immediately
/// before dispatching to a specific provider.
#[derive(Debug)]
pub struct TieredRateLimiter {
    ip: SlidingWindowLimiter,
    user: SlidingWindowLimiter,
    provider: SlidingWindowLimiter,
}

impl TieredRateLimiter {
    pub fn new(config: TieredRateLimitConfig) -> Self {
        Self {
            ip: SlidingWindowLimiter::new(config.ip),
            user: SlidingWindowLimiter::new(config.user),
            provider: SlidingWindowLimiter::new(config.provider),
        }
    }

    /// Admit or reject a request for `identity`, consuming a slot from the
    /// appropriate identity tier on success.
    pub fn admit(&self, identity: &RequestIdentity) -> Result<RateLimitDecision, ResilienceError> {
        let limiter = match identity.user {
            Some(_) => &self.user,
            None => &self.ip,
        };
        let key = identity.tier_key();
        let decision = limiter.consume(&key);
        if decision.allowed {
            Ok(decision)
        } else {
            Err(ResilienceError::RateLimitExceeded {
                key,
                limit: decision.limit,
                retry_after: decision.retry_after.unwrap_or(Duration::ZERO),
            })
        }
    }

    /// Consume a slot from the provider tier for `provider_id`
    pub fn consume_provider(&self, provider_id: &str) -> RateLimitDecision {
        self.provider.consume(&format!("provider:{provider_id}"))
    }

    /// The ip-tier limiter
    pub fn ip_tier(&self) -> &SlidingWindowLimiter {
        &self.ip
    }

    /// The user-tier limiter
    pub fn user_tier(&self) -> &SlidingWindowLimiter {
        &self.user
    }

    /// The provider-tier limiter
    pub fn provider_tier(&self) -> &SlidingWindowLimiter {
        &self.provider
    }

    /// Sweep all three tiers; returns total keys removed
    pub fn sweep_all(&self) -> usize {
        self.ip.sweep() + self.user.sweep() + self.provider.sweep()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32, window: Duration) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(RateLimitConfig {
            max_requests: max,
            window,
        })
    }

    #[test]
    fn exactly_n_requests_fit_in_the_window() {
        let limiter = limiter(20, Duration::from_secs(60));
        for _ in 0..20 {
            assert!(limiter.consume("ip:1.2.3.4").allowed);
        }

        let rejected = limiter.consume("ip:1.2.3.4");
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert!(rejected.retry_after.unwrap() > Duration::ZERO);
    }

    #[test]
    fn check_does_not_consume() {
        let limiter = limiter(2, Duration::from_secs(60));
        for _ in 0..10 {
            assert!(limiter.check("k").allowed);
        }
        assert_eq!(limiter.usage("k").count, 0);

        limiter.consume("k");
        assert_eq!(limiter.usage("k").count, 1);
    }

    #[test]
    fn rejected_consume_does_not_mutate_state() {
        let limiter = limiter(1, Duration::from_secs(60));
        assert!(limiter.consume("k").allowed);
        for _ in 0..5 {
            assert!(!limiter.consume("k").allowed);
        }
        assert_eq!(limiter.usage("k").count, 1);
    }

    #[test]
    fn remaining_counts_down_including_the_consumed_request() {
        let limiter = limiter(3, Duration::from_secs(60));
        assert_eq!(limiter.consume("k").remaining, 2);
        assert_eq!(limiter.consume("k").remaining, 1);
        assert_eq!(limiter.consume("k").remaining, 0);
    }

    #[tokio::test]
    async fn window_expiry_readmits() {
        let limiter = limiter(2, Duration::from_millis(50));
        assert!(limiter.consume("k").allowed);
        assert!(limiter.consume("k").allowed);
        assert!(!limiter.consume("k").allowed);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.consume("k").allowed);
    }

    #[test]
    fn reset_clears_a_key() {
        let limiter = limiter(1, Duration::from_secs(60));
        assert!(limiter.consume("k").allowed);
        assert!(!limiter.consume("k").allowed);
        limiter.reset("k");
        assert!(limiter.consume("k").allowed);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = limiter(1, Duration::from_secs(60));
        assert!(limiter.consume("ip:a").allowed);
        assert!(limiter.consume("ip:b").allowed);
        assert!(!limiter.consume("ip:a").allowed);
    }

    #[test]
    fn headers_render_the_contract() {
        let limiter = limiter(1, Duration::from_secs(60));
        let ok = limiter.consume("k");
        let headers = ok.headers();
        assert!(headers.iter().any(|(name, v)| *name == "X-RateLimit-Limit" && v == "1"));
        assert!(headers.iter().any(|(name, v)| *name == "X-RateLimit-Remaining" && v == "0"));
        assert!(headers.iter().all(|(name, _)| *name != "Retry-After"));

        let rejected = limiter.consume("k");
        let headers = rejected.headers();
        assert!(headers.iter().any(|(name, _)| *name == "Retry-After"));
    }

    #[tokio::test]
    async fn sweep_removes_idle_keys() {
        let limiter = limiter(5, Duration::from_millis(30));
        limiter.consume("a");
        limiter.consume("b");
        assert_eq!(limiter.key_count(), 2);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let removed = limiter.sweep();
        assert_eq!(removed, 2);
        assert_eq!(limiter.key_count(), 0);
    }

    #[test]
    fn tiered_admission_picks_the_identity_tier() {
        let limiter = TieredRateLimiter::new(TieredRateLimitConfig {
            ip: RateLimitConfig {
                max_requests: 1,
                window: Duration::from_secs(60),
            },
            user: RateLimitConfig {
                max_requests: 2,
                window: Duration::from_secs(60),
            },
            provider: RateLimitConfig::default(),
        });

        let anon = RequestIdentity::anonymous("1.2.3.4");
        assert!(limiter.admit(&anon).is_ok());
        let err = limiter.admit(&anon).unwrap_err();
        match err {
            ResilienceError::RateLimitExceeded { key, limit, .. } => {
                assert_eq!(key, "ip:1.2.3.4");
                assert_eq!(limit, 1);
            }
            other => panic!("expected RateLimitExceeded, got {other:?}"),
        }

        // The same person authenticated uses the roomier user tier
        let user = RequestIdentity::authenticated("1.2.3.4", "u1");
        assert!(limiter.admit(&user).is_ok());
        assert!(limiter.admit(&user).is_ok());
        assert!(limiter.admit(&user).is_err());
    }

    #[test]
    fn provider_tier_is_keyed_per_provider() {
        let limiter = TieredRateLimiter::new(TieredRateLimitConfig {
            provider: RateLimitConfig {
                max_requests: 1,
                window: Duration::from_secs(60),
            },
            ..Default::default()
        });
        assert!(limiter.consume_provider("gemini").allowed);
        assert!(!limiter.consume_provider("gemini").allowed);
        assert!(limiter.consume_provider("ollama").allowed);
    }
}
