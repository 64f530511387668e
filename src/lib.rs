//! Beacon Core Resilience: Pure-logic provider fault tolerance for LLM gateways
//!
//! # Overview
//!
//! This crate provides the building blocks a chat gateway needs to survive
//! flaky upstream LLM providers. It includes:
//!
//! - **Circuit Breaker**: Fails fast per provider after repeated failures, with timed recovery probing
//! - **Rate Limiter**: Precise sliding-window limits with per-IP, per-user, and per-provider tiers
//! - **Response Cache**: Bounded LRU cache with TTL expiry for identical completions
//! - **Request Deduplicator**: Coalesces identical in-flight requests onto one provider call
//! - **Health Tracker**: Scores providers from success rate, latency, and circuit state
//! - **Fallback Orchestrator**: Walks providers best-first until one answers
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - HTTP frameworks or transport
//! - Specific provider SDKs or wire formats
//! - Credential storage
//!
//! Callers plug in their own provider clients through the [`ProviderClient`]
//! trait; everything here composes around that seam.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Your Gateway Handler            │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Request Deduplicator              │  ← Coalesce identical requests
//! │  (fingerprint, share in-flight result)  │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Response Cache                    │  ← Skip providers entirely
//! │  (bounded LRU + TTL)                    │
//! └─────────────┬───────────────────────────┘
//!               │ miss
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Rate Limiter                      │  ← Admission control
//! │  (sliding window, per-identity tiers)   │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Fallback Orchestrator             │  ← Best provider first
//! │  (health-ranked candidates)             │
//! └─────────────┬───────────────────────────┘
//!               │ per candidate
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail-fast protection
//! │  (per-provider, lazy recovery probe)    │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!         LLM Provider APIs
//!
//!  Fed by every call:
//!   Health Tracker → success rate, latency window, composite score
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use beacon_core_resilience::prelude::*;
//! use std::sync::Arc;
//!
//! # struct Env;
//! # impl CredentialCheck for Env {
//! #     fn is_configured(&self, _provider: &str) -> bool { true }
//! # }
//! # struct Gemini;
//! # #[async_trait::async_trait]
//! # impl ProviderClient for Gemini {
//! #     async fn complete(&self, _p: &str, _c: &str, _m: &str) -> Result<String, ResilienceError> {
//! #         Ok(String::new())
//! #     }
//! # }
//! # async fn example() -> Result<(), ResilienceError> {
//! let pipeline = GatewayPipeline::builder(PipelineConfig::default(), Arc::new(Env))
//!     .provider("gemini", Arc::new(Gemini))
//!     .candidate("gemini", "gemini-1.5-flash")
//!     .build();
//!
//! let response = pipeline
//!     .handle(
//!         RequestIdentity::anonymous("203.0.113.7"),
//!         CompletionRequest::new("What is a monotonic clock?"),
//!     )
//!     .await?;
//! println!("{} answered via {}", response.provider, response.model);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod circuit_breaker;
pub mod dedup;
pub mod error;
pub mod fallback;
pub mod health;
pub mod pipeline;
pub mod rate_limiter;

// Re-export main types for convenience
pub use cache::{BoundedCache, CacheConfig, CacheStats};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats, CircuitState,
};
pub use dedup::{request_fingerprint, RequestDeduplicator, SharedResult};
pub use error::{ProviderErrorKind, ResilienceError};
pub use fallback::{
    CompletionRequest, CredentialCheck, FallbackOrchestrator, FallbackOutcome, ProviderCandidate,
    ProviderClient,
};
pub use health::{HealthConfig, ProviderHealth, ProviderHealthTracker, ProviderStatus};
pub use pipeline::{CompletionResponse, GatewayPipeline, GatewayPipelineBuilder, PipelineConfig};
pub use rate_limiter::{
    RateLimitConfig, RateLimitDecision, RequestIdentity, SlidingWindowLimiter,
    TieredRateLimitConfig, TieredRateLimiter,
};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use beacon_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::cache::{BoundedCache, CacheConfig};
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry};
    pub use super::dedup::{request_fingerprint, RequestDeduplicator};
    pub use super::error::{ProviderErrorKind, ResilienceError};
    pub use super::fallback::{
        CompletionRequest, CredentialCheck, FallbackOrchestrator, ProviderCandidate, ProviderClient,
    };
    pub use super::health::{HealthConfig, ProviderHealthTracker, ProviderStatus};
    pub use super::pipeline::{CompletionResponse, GatewayPipeline, PipelineConfig};
    pub use super::rate_limiter::{RequestIdentity, TieredRateLimitConfig, TieredRateLimiter};
}
