//! Error types for the resilience core
//!
//! The taxonomy separates admission rejections (circuit open, rate limit
//! exceeded) from genuine provider failures. Admission rejections must never
//! be recorded against a provider's health — they say nothing about whether
//! the provider would have succeeded.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ResilienceError>;

/// Classification of a provider call failure, tagged at the failure site.
///
/// Callers constructing a [`ResilienceError::Provider`] choose the kind from
/// the vendor response they actually observed (HTTP status, transport error)
/// instead of inferring it later from message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// HTTP 429 from the vendor.
    RateLimited,
    /// HTTP 401/403 — bad key or insufficient permissions.
    Auth,
    /// HTTP 5xx or an "overloaded" response.
    Server,
    /// Transport-level failure (DNS, connect, reset).
    Network,
    /// The vendor call exceeded its own deadline.
    Timeout,
    /// The vendor responded but the payload could not be used.
    InvalidResponse,
    /// Anything else.
    Other,
}

/// Errors produced by the resilience core.
#[derive(Debug, Clone, Error)]
pub enum ResilienceError {
    /// The provider's circuit is open; the call was rejected without being
    /// attempted. `retry_after` is the time remaining until the breaker is
    /// eligible for a half-open probe, floored at zero.
    #[error("circuit open for provider '{provider}', retry in {}ms", retry_after.as_millis())]
    CircuitOpen {
        provider: String,
        retry_after: Duration,
    },

    /// The sliding-window rate limit for `key` is exhausted.
    #[error("rate limit exceeded for '{key}' ({limit} per window), retry in {}s", retry_after.as_secs())]
    RateLimitExceeded {
        key: String,
        limit: u32,
        retry_after: Duration,
    },

    /// The provider was called and genuinely failed.
    #[error("provider '{provider}' failed ({kind:?}): {message}")]
    Provider {
        provider: String,
        kind: ProviderErrorKind,
        message: String,
    },

    /// The provider call exceeded its deadline.
    #[error("provider '{provider}' timed out after {}ms", elapsed.as_millis())]
    Timeout {
        provider: String,
        elapsed: Duration,
    },

    /// Every configured candidate failed or was unavailable. Terminal for
    /// the request; the caller surfaces this to the end user.
    #[error("all providers failed or unavailable ({attempted} attempted)")]
    AllProvidersExhausted { attempted: usize },

    /// This caller stopped waiting on a coalesced request. The shared unit
    /// of work keeps running and other subscribers still see its result.
    #[error("deduplicated request '{key}' timed out after {}ms", waited.as_millis())]
    DedupTimeout { key: String, waited: Duration },

    /// A coalesced unit of work was dropped before settling (task panic).
    #[error("internal error: {0}")]
    Internal(String),
}

impl ResilienceError {
    /// Convenience constructor for a provider failure.
    pub fn provider(
        provider: impl Into<String>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            kind,
            message: message.into(),
        }
    }

    /// Whether this is an admission-control rejection rather than evidence
    /// that a provider actually failed.
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::RateLimitExceeded { .. }
        )
    }

    /// Whether this failure should count against the provider's circuit
    /// breaker and health metrics.
    pub fn should_trip_breaker(&self) -> bool {
        matches!(self, Self::Provider { .. } | Self::Timeout { .. })
    }

    /// Suggested wait before retrying, for rejections that carry one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } | Self::RateLimitExceeded { retry_after, .. } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }
}
