//! Fallback orchestration: choosing and executing a provider call
//!
//! Builds an ordering over the configured provider/model candidates —
//! preferred model first, then closed circuits before half-open ones, then
//! health score — and walks it until a call succeeds. Individual candidate
//! failures are absorbed (logged, recorded against the provider, next
//! candidate tried); only total exhaustion is raised to the caller.
//!
//! Admission rejections (open circuit, provider rate limit) skip a
//! candidate without recording a failure: the provider was never actually
//! asked, so they are not evidence it would have failed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::error::ResilienceError;
use crate::health::ProviderHealthTracker;
use crate::rate_limiter::TieredRateLimiter;

/// A vendor call, opaque to the core. The core only cares whether it
/// fails and how long it takes.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        context: &str,
        model: &str,
    ) -> Result<String, ResilienceError>;
}

/// Credential presence check, owned by the embedding gateway. Candidates
/// whose provider is not configured are never attempted.
pub trait CredentialCheck: Send + Sync {
    fn is_configured(&self, provider: &str) -> bool;
}

/// One provider/model pair eligible for fallback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCandidate {
    pub provider: String,
    pub model: String,
}

impl ProviderCandidate {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

/// An inbound completion request
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub context: String,
    /// Preferred model id; attempted first when its circuit allows it
    pub model: Option<String>,
    /// Whether search grounding was performed for this request
    pub grounding: bool,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            context: String::new(),
            model: None,
            grounding: false,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_grounding(mut self, grounding: bool) -> Self {
        self.grounding = grounding;
        self
    }
}

/// A successful fallback execution: the text plus which candidate served it
#[derive(Debug, Clone)]
pub struct FallbackOutcome {
    pub text: String,
    pub provider: String,
    pub model: String,
    /// Candidates actually called (not merely considered)
    pub attempts: u32,
}

/// Selects a provider ordering and executes with protection.
pub struct FallbackOrchestrator {
    candidates: Vec<ProviderCandidate>,
    clients: HashMap<String, Arc<dyn ProviderClient>>,
    credentials: Arc<dyn CredentialCheck>,
    health: Arc<ProviderHealthTracker>,
    /// When present, the provider tier is consumed immediately before each
    /// dispatch; a rejection skips the candidate without recording a failure
    limits: Option<Arc<TieredRateLimiter>>,
}

impl FallbackOrchestrator {
    pub fn new(credentials: Arc<dyn CredentialCheck>, health: Arc<ProviderHealthTracker>) -> Self {
        Self {
            candidates: Vec::new(),
            clients: HashMap::new(),
            credentials,
            health,
            limits: None,
        }
    }

    /// Attach the tiered limiter whose provider tier gates dispatches
    pub fn with_rate_limits(mut self, limits: Arc<TieredRateLimiter>) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Register the call client for `provider`
    pub fn register_provider(&mut self, provider: &str, client: Arc<dyn ProviderClient>) {
        self.clients.insert(provider.to_string(), client);
    }

    /// Add a provider/model pair to the candidate set
    pub fn add_candidate(&mut self, candidate: ProviderCandidate) {
        self.candidates.push(candidate);
    }

    /// The configured candidate set
    pub fn candidates(&self) -> &[ProviderCandidate] {
        &self.candidates
    }

    fn breakers(&self) -> &CircuitBreakerRegistry {
        self.health.breakers()
    }

    /// Build the candidate ordering for one request: configured only, open
    /// circuits excluded, preferred model first (at most once), then closed
    /// circuits before half-open, then health score descending, provider id
    /// and model as the deterministic tie-break.
    fn ordered_candidates(&self, preferred_model: Option<&str>) -> Vec<ProviderCandidate> {
        let configured: Vec<&ProviderCandidate> = self
            .candidates
            .iter()
            .filter(|c| self.credentials.is_configured(&c.provider))
            .collect();

        let mut preferred: Option<ProviderCandidate> = None;
        if let Some(model) = preferred_model {
            preferred = configured
                .iter()
                .find(|c| c.model == model)
                .filter(|c| !self.breakers().get_or_create(&c.provider).state().is_open())
                .map(|c| (*c).clone());
        }

        let mut rest: Vec<(u8, f64, ProviderCandidate)> = configured
            .iter()
            .filter_map(|c| {
                let state = self.breakers().get_or_create(&c.provider).state();
                if state.is_open() {
                    return None;
                }
                let tier = u8::from(state.is_half_open());
                let score = self.health.health_of(&c.provider).health_score;
                Some((tier, score, (*c).clone()))
            })
            .collect();

        rest.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| (&a.2.provider, &a.2.model).cmp(&(&b.2.provider, &b.2.model)))
        });

        let mut ordered: Vec<ProviderCandidate> = Vec::with_capacity(rest.len() + 1);
        if let Some(p) = preferred {
            ordered.push(p);
        }
        for (_, _, candidate) in rest {
            if !ordered.contains(&candidate) {
                ordered.push(candidate);
            }
        }
        ordered
    }

    /// Execute `request` against the best available candidate, falling back
    /// through the ordering on failure. Raises only on total exhaustion.
    pub async fn execute(
        &self,
        request: &CompletionRequest,
    ) -> Result<FallbackOutcome, ResilienceError> {
        let ordered = self.ordered_candidates(request.model.as_deref());
        let mut attempts: u32 = 0;

        for candidate in &ordered {
            // Re-check availability immediately before the call; state may
            // have changed since ranking
            let breaker = self.breakers().get_or_create(&candidate.provider);
            if !breaker.can_execute() {
                debug!(provider = %candidate.provider, "circuit opened since ranking, skipping");
                continue;
            }

            if let Some(limits) = &self.limits {
                let decision = limits.consume_provider(&candidate.provider);
                if !decision.allowed {
                    debug!(
                        provider = %candidate.provider,
                        "provider rate limit reached, skipping candidate"
                    );
                    continue;
                }
            }

            let Some(client) = self.clients.get(&candidate.provider) else {
                warn!(provider = %candidate.provider, "no client registered for candidate");
                continue;
            };

            attempts += 1;
            let started = Instant::now();
            match client
                .complete(&request.prompt, &request.context, &candidate.model)
                .await
            {
                Ok(text) => {
                    self.health
                        .record_success(&candidate.provider, started.elapsed());
                    debug!(
                        provider = %candidate.provider,
                        model = %candidate.model,
                        latency_ms = started.elapsed().as_millis() as u64,
                        "provider call succeeded"
                    );
                    return Ok(FallbackOutcome {
                        text,
                        provider: candidate.provider.clone(),
                        model: candidate.model.clone(),
                        attempts,
                    });
                }
                Err(e) if e.is_admission_rejection() => {
                    // The provider was never actually asked; not a failure
                    debug!(provider = %candidate.provider, error = %e, "candidate rejected at admission");
                }
                Err(e) => {
                    self.health.record_failure(&candidate.provider);
                    warn!(
                        provider = %candidate.provider,
                        model = %candidate.model,
                        error = %e,
                        "provider call failed, trying next candidate"
                    );
                }
            }
        }

        Err(ResilienceError::AllProvidersExhausted {
            attempted: attempts as usize,
        })
    }
}
