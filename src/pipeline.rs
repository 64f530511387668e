//! End-to-end request pipeline
//!
//! Wires the individual primitives into the order an inbound completion
//! request flows through them:
//!
//! ```text
//! request ──► deduplicator ──► cache ──► rate limiter ──► fallback ──► cache
//!             (coalesce)       (hit?)    (admission)      (providers)  (store)
//! ```
//!
//! Identical in-flight requests collapse onto one execution before any
//! other stage runs, a cache hit short-circuits admission entirely, and
//! only requests that will actually reach a provider consume rate-limit
//! budget.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::{BoundedCache, CacheConfig, CacheStats};
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::dedup::{request_fingerprint, RequestDeduplicator};
use crate::error::ResilienceError;
use crate::fallback::{
    CompletionRequest, CredentialCheck, FallbackOrchestrator, ProviderCandidate, ProviderClient,
};
use crate::health::{HealthConfig, ProviderHealth, ProviderHealthTracker};
use crate::rate_limiter::{RequestIdentity, TieredRateLimitConfig, TieredRateLimiter};

/// Tuning for every stage of the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Completed responses, keyed by request fingerprint
    pub cache: CacheConfig,
    /// Grounding search results, independent of the response cache
    pub search_cache: CacheConfig,
    pub rate_limits: TieredRateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub health: HealthConfig,
    /// Stale deduplication entries older than this are purged
    pub dedup_max_age: Duration,
    /// Cadence of the background sweep spawned by
    /// [`GatewayPipeline::spawn_maintenance`]
    pub maintenance_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            search_cache: CacheConfig {
                max_entries: 200,
                ttl: Duration::from_secs(600),
            },
            rate_limits: TieredRateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            health: HealthConfig::default(),
            dedup_max_age: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(300),
        }
    }
}

/// The pipeline's answer to a completion request
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
    pub provider: String,
    pub model: String,
    /// Served from the response cache without touching a provider
    pub cached: bool,
    /// Provider calls made to produce this response (0 when cached)
    pub attempts: u32,
}

/// Assembles a [`GatewayPipeline`]: register providers and candidates,
/// then [`build`](Self::build).
pub struct GatewayPipelineBuilder {
    config: PipelineConfig,
    credentials: Arc<dyn CredentialCheck>,
    providers: Vec<(String, Arc<dyn ProviderClient>)>,
    candidates: Vec<ProviderCandidate>,
}

impl GatewayPipelineBuilder {
    pub fn new(config: PipelineConfig, credentials: Arc<dyn CredentialCheck>) -> Self {
        Self {
            config,
            credentials,
            providers: Vec::new(),
            candidates: Vec::new(),
        }
    }

    pub fn provider(mut self, name: &str, client: Arc<dyn ProviderClient>) -> Self {
        self.providers.push((name.to_string(), client));
        self
    }

    pub fn candidate(mut self, provider: &str, model: &str) -> Self {
        self.candidates.push(ProviderCandidate::new(provider, model));
        self
    }

    pub fn build(self) -> Arc<GatewayPipeline> {
        let breakers = CircuitBreakerRegistry::new(self.config.circuit_breaker.clone());
        let health = Arc::new(ProviderHealthTracker::new(
            self.config.health.clone(),
            breakers,
        ));
        let limits = Arc::new(TieredRateLimiter::new(self.config.rate_limits.clone()));

        let mut orchestrator =
            FallbackOrchestrator::new(self.credentials, Arc::clone(&health))
                .with_rate_limits(Arc::clone(&limits));
        for (name, client) in self.providers {
            orchestrator.register_provider(&name, client);
        }
        for candidate in self.candidates {
            orchestrator.add_candidate(candidate);
        }

        info!(
            candidates = orchestrator.candidates().len(),
            cache_entries = self.config.cache.max_entries,
            "gateway pipeline assembled"
        );

        Arc::new(GatewayPipeline {
            cache: Arc::new(BoundedCache::new(self.config.cache)),
            search_cache: Arc::new(BoundedCache::new(self.config.search_cache)),
            dedup: RequestDeduplicator::with_max_age(self.config.dedup_max_age),
            limits,
            health,
            orchestrator: Arc::new(orchestrator),
            maintenance_interval: self.config.maintenance_interval,
        })
    }
}

/// The full resilience layer as a single entry point
pub struct GatewayPipeline {
    cache: Arc<BoundedCache<CompletionResponse>>,
    search_cache: Arc<BoundedCache<String>>,
    dedup: RequestDeduplicator<CompletionResponse>,
    limits: Arc<TieredRateLimiter>,
    health: Arc<ProviderHealthTracker>,
    orchestrator: Arc<FallbackOrchestrator>,
    maintenance_interval: Duration,
}

impl GatewayPipeline {
    pub fn builder(
        config: PipelineConfig,
        credentials: Arc<dyn CredentialCheck>,
    ) -> GatewayPipelineBuilder {
        GatewayPipelineBuilder::new(config, credentials)
    }

    /// Run one request through the whole pipeline.
    ///
    /// Concurrent callers with the same fingerprint join the in-flight
    /// execution and consume a single admission between them.
    pub async fn handle(
        &self,
        identity: RequestIdentity,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ResilienceError> {
        let key = request_fingerprint(
            &request.prompt,
            request.model.as_deref().unwrap_or(""),
            request.grounding,
        );

        let cache = Arc::clone(&self.cache);
        let limits = Arc::clone(&self.limits);
        let orchestrator = Arc::clone(&self.orchestrator);
        let work_key = key.clone();

        self.dedup
            .dedup(&key, move || async move {
                if let Some(mut hit) = cache.get(&work_key) {
                    debug!(key = %work_key, "served from response cache");
                    hit.cached = true;
                    return Ok(hit);
                }

                limits.admit(&identity)?;

                let outcome = orchestrator.execute(&request).await?;
                let response = CompletionResponse {
                    text: outcome.text,
                    provider: outcome.provider,
                    model: outcome.model,
                    cached: false,
                    attempts: outcome.attempts,
                };
                cache.insert(&work_key, response.clone());
                Ok(response)
            })
            .await
            .map_err(|e| (*e).clone())
    }

    /// Like [`handle`](Self::handle) but gives up waiting after `wait`.
    /// The underlying execution keeps running for other subscribers.
    pub async fn handle_with_timeout(
        &self,
        identity: RequestIdentity,
        request: CompletionRequest,
        wait: Duration,
    ) -> Result<CompletionResponse, ResilienceError> {
        let key = request_fingerprint(
            &request.prompt,
            request.model.as_deref().unwrap_or(""),
            request.grounding,
        );

        let cache = Arc::clone(&self.cache);
        let limits = Arc::clone(&self.limits);
        let orchestrator = Arc::clone(&self.orchestrator);
        let work_key = key.clone();

        self.dedup
            .dedup_with_timeout(
                &key,
                move || async move {
                    if let Some(mut hit) = cache.get(&work_key) {
                        hit.cached = true;
                        return Ok(hit);
                    }
                    limits.admit(&identity)?;
                    let outcome = orchestrator.execute(&request).await?;
                    let response = CompletionResponse {
                        text: outcome.text,
                        provider: outcome.provider,
                        model: outcome.model,
                        cached: false,
                        attempts: outcome.attempts,
                    };
                    cache.insert(&work_key, response.clone());
                    Ok(response)
                },
                wait,
            )
            .await
            .map_err(|e| (*e).clone())
    }

    /// Fetch grounding search context for `query`, consulting the search
    /// cache first. `fetch` runs only on a miss; its result is cached under
    /// the normalized query.
    pub async fn search_context<F, Fut>(
        &self,
        query: &str,
        fetch: F,
    ) -> Result<String, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<String, ResilienceError>>,
    {
        let key = request_fingerprint(query, "search", false);
        if let Some(hit) = self.search_cache.get(&key) {
            debug!(query, "served grounding context from search cache");
            return Ok(hit);
        }
        let context = fetch().await?;
        self.search_cache.insert(&key, context.clone());
        Ok(context)
    }

    /// Spawn the periodic maintenance task: sweeps empty rate-limit keys
    /// and purges expired cache entries on the configured interval.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pipeline.maintenance_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let swept = pipeline.limits.sweep_all();
                let purged =
                    pipeline.cache.purge_expired() + pipeline.search_cache.purge_expired();
                if swept > 0 || purged > 0 {
                    debug!(swept, purged, "pipeline maintenance pass");
                }
            }
        })
    }

    /// Health snapshot for every known provider, best first
    pub fn provider_health(&self) -> Vec<ProviderHealth> {
        self.health.all_provider_health()
    }

    pub fn health(&self) -> &Arc<ProviderHealthTracker> {
        &self.health
    }

    pub fn rate_limits(&self) -> &Arc<TieredRateLimiter> {
        &self.limits
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn search_cache_stats(&self) -> CacheStats {
        self.search_cache.stats()
    }

    /// In-flight deduplicated executions
    pub fn pending_requests(&self) -> usize {
        self.dedup.pending_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderErrorKind;
    use crate::rate_limiter::RateLimitConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AllConfigured;
    impl CredentialCheck for AllConfigured {
        fn is_configured(&self, _provider: &str) -> bool {
            true
        }
    }

    struct CountingClient {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingClient {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl ProviderClient for CountingClient {
        async fn complete(
            &self,
            prompt: &str,
            _context: &str,
            _model: &str,
        ) -> Result<String, ResilienceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ResilienceError::provider(
                    "test",
                    ProviderErrorKind::Server,
                    "boom",
                ))
            } else {
                Ok(format!("echo: {prompt}"))
            }
        }
    }

    fn pipeline_with(client: Arc<CountingClient>) -> Arc<GatewayPipeline> {
        GatewayPipeline::builder(PipelineConfig::default(), Arc::new(AllConfigured))
            .provider("test", client)
            .candidate("test", "test-model")
            .build()
    }

    #[tokio::test]
    async fn second_identical_request_is_served_from_cache() {
        let client = CountingClient::new(false);
        let pipeline = pipeline_with(client.clone());

        let first = pipeline
            .handle(RequestIdentity::anonymous("1.1.1.1"), CompletionRequest::new("hi"))
            .await
            .unwrap();
        assert!(!first.cached);

        let second = pipeline
            .handle(RequestIdentity::anonymous("1.1.1.1"), CompletionRequest::new("hi"))
            .await
            .unwrap();
        assert!(second.cached);
        assert_eq!(second.text, first.text);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_hit_does_not_consume_rate_limit_budget() {
        let config = PipelineConfig {
            rate_limits: TieredRateLimitConfig {
                ip: RateLimitConfig {
                    max_requests: 1,
                    window: Duration::from_secs(60),
                },
                ..Default::default()
            },
            ..Default::default()
        };
        let pipeline = GatewayPipeline::builder(config, Arc::new(AllConfigured))
            .provider("test", CountingClient::new(false))
            .candidate("test", "test-model")
            .build();
        let identity = RequestIdentity::anonymous("1.1.1.1");

        pipeline
            .handle(identity.clone(), CompletionRequest::new("hi"))
            .await
            .unwrap();

        // Budget is spent, but the cached answer is still reachable
        let cached = pipeline
            .handle(identity.clone(), CompletionRequest::new("hi"))
            .await
            .unwrap();
        assert!(cached.cached);

        // A different prompt now hits the exhausted limiter
        let err = pipeline
            .handle(identity, CompletionRequest::new("other"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::RateLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn rate_limit_rejection_surfaces_with_retry_after() {
        let config = PipelineConfig {
            rate_limits: TieredRateLimitConfig {
                ip: RateLimitConfig {
                    max_requests: 1,
                    window: Duration::from_secs(60),
                },
                ..Default::default()
            },
            ..Default::default()
        };
        let pipeline = GatewayPipeline::builder(config, Arc::new(AllConfigured))
            .provider("test", CountingClient::new(false))
            .candidate("test", "test-model")
            .build();
        let identity = RequestIdentity::anonymous("2.2.2.2");

        pipeline
            .handle(identity.clone(), CompletionRequest::new("a"))
            .await
            .unwrap();
        let err = pipeline
            .handle(identity, CompletionRequest::new("b"))
            .await
            .unwrap_err();
        assert!(err.is_admission_rejection());
        assert!(err.retry_after().is_some());
    }

    #[tokio::test]
    async fn concurrent_identical_requests_share_one_execution() {
        let client = CountingClient::new(false);
        let pipeline = pipeline_with(client.clone());

        let mut handles = Vec::new();
        for i in 0..6 {
            let p = Arc::clone(&pipeline);
            handles.push(tokio::spawn(async move {
                p.handle(
                    RequestIdentity::anonymous(format!("10.0.0.{i}")),
                    CompletionRequest::new("same prompt"),
                )
                .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn provider_failure_surfaces_as_exhaustion() {
        let client = CountingClient::new(true);
        let pipeline = pipeline_with(client);

        let err = pipeline
            .handle(RequestIdentity::anonymous("1.1.1.1"), CompletionRequest::new("hi"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResilienceError::AllProvidersExhausted { .. }
        ));

        // Failed responses are never cached
        assert_eq!(pipeline.cache_stats().entries, 0);
    }

    #[tokio::test]
    async fn search_context_is_fetched_once_per_query() {
        let pipeline = pipeline_with(CountingClient::new(false));
        let fetches = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let fetches = Arc::clone(&fetches);
            let context = pipeline
                .search_context("rust borrow checker", move || async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok("search results".to_string())
                })
                .await
                .unwrap();
            assert_eq!(context, "search results");
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.search_cache_stats().hits, 2);
    }

    #[tokio::test]
    async fn health_snapshot_reflects_traffic() {
        let pipeline = pipeline_with(CountingClient::new(false));
        pipeline
            .handle(RequestIdentity::anonymous("1.1.1.1"), CompletionRequest::new("hi"))
            .await
            .unwrap();

        let snapshot = pipeline.provider_health();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].provider, "test");
        assert_eq!(snapshot[0].request_count, 1);
    }
}
