//! # Multi-Provider Router with Failover
//!
//! Resolves a canonical model id to an ordered list of provider candidates
//! (registry policy: health via circuit breakers, then cost, then observed
//! latency, with optional explicit preference) and walks the list until one
//! succeeds.
//!
//! Transient failures - timeouts, 5xx, rate limits - advance to the next
//! candidate; auth failures and other 4xx abort immediately. When the
//! registry has no working candidate, or the model is not registered at
//! all, the request falls back to the default aggregator (OpenRouter) with
//! the original model id.
//!
//! Streaming selects only the primary candidate with the same policy:
//! a stream cannot fail over mid-flight without losing already-emitted
//! tokens.

use crate::catalog::{ModelRegistry, SelectionPolicy};
use crate::circuit_breaker::{ProviderCircuitBreaker, RetryAfterMap};
use crate::error::{ClientError, ProviderError};
use crate::models::{ChatRequest, ChatResponse};
use crate::providers::Provider;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;

/// Result of a successful failover execution.
#[derive(Debug)]
pub struct FailoverOutcome {
    /// Provider that served the request
    pub provider: String,
    /// Model id as the serving provider knows it
    pub provider_model_id: String,
    pub response: ChatResponse,
    /// Providers attempted, including the successful one
    pub attempts: u32,
}

/// Primary selection for streaming requests.
#[derive(Debug, Clone)]
pub struct PrimarySelection {
    pub provider: String,
    pub provider_model_id: String,
}

pub struct ProviderRouter {
    registry: Arc<ModelRegistry>,
    breaker: Arc<ProviderCircuitBreaker>,
    retry_after: Arc<RetryAfterMap>,
    providers: DashMap<String, Arc<dyn Provider>>,
    default_provider: String,
    policy: SelectionPolicy,
}

impl ProviderRouter {
    pub fn new(
        registry: Arc<ModelRegistry>,
        breaker: Arc<ProviderCircuitBreaker>,
        retry_after: Arc<RetryAfterMap>,
        default_provider: impl Into<String>,
        policy: SelectionPolicy,
    ) -> Self {
        Self {
            registry,
            breaker,
            retry_after,
            providers: DashMap::new(),
            default_provider: default_provider.into(),
            policy,
        }
    }

    pub fn register_provider(&self, provider: Arc<dyn Provider>) {
        self.providers
            .insert(provider.name().to_string(), provider);
    }

    pub fn provider(&self, slug: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(slug).map(|p| Arc::clone(&p))
    }

    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    /// Whether the model resolves through the multi-provider registry.
    pub fn in_registry(&self, model: &str) -> bool {
        self.registry.get_model(model).is_some()
    }

    /// Ordered, currently-usable candidates for a model.
    fn candidates(&self, model: &str, preferred: Option<&str>) -> Vec<PrimarySelection> {
        self.registry
            .providers_for(model, self.policy, preferred)
            .into_iter()
            .filter(|p| {
                if !self.providers.contains_key(&p.provider_slug) {
                    return false;
                }
                if self.breaker.should_skip(&p.provider_slug) {
                    tracing::debug!(
                        provider = %p.provider_slug,
                        model = %model,
                        "skipping provider, circuit open"
                    );
                    return false;
                }
                if let Some(remaining) = self.retry_after.remaining(&p.provider_slug) {
                    tracing::debug!(
                        provider = %p.provider_slug,
                        remaining_s = remaining.as_secs_f64(),
                        "skipping provider, Retry-After pending"
                    );
                    return false;
                }
                true
            })
            .map(|p| PrimarySelection {
                provider: p.provider_slug,
                provider_model_id: p.native_model_id,
            })
            .collect()
    }

    /// Primary provider for a streaming request. Falls back to the default
    /// aggregator with the original id when the registry has no candidate.
    pub fn select_primary(&self, model: &str, preferred: Option<&str>) -> PrimarySelection {
        self.candidates(model, preferred)
            .into_iter()
            .next()
            .unwrap_or_else(|| PrimarySelection {
                provider: self.default_provider.clone(),
                provider_model_id: model.to_string(),
            })
    }

    /// Execute a chat completion with failover across registry candidates.
    pub async fn execute_with_failover(
        &self,
        model: &str,
        request: &ChatRequest,
        preferred: Option<&str>,
    ) -> Result<FailoverOutcome, ClientError> {
        let candidates = self.candidates(model, preferred);
        let mut attempts = 0u32;
        let mut last_error: Option<ProviderError> = None;

        for candidate in &candidates {
            let Some(client) = self.provider(&candidate.provider) else {
                continue;
            };
            attempts += 1;

            let mut attempt_request = request.clone();
            attempt_request.model = candidate.provider_model_id.clone();

            let start = Instant::now();
            match client.chat_completion(attempt_request).await {
                Ok(response) => {
                    let latency_ms = start.elapsed().as_millis() as u64;
                    self.breaker.record_success(&candidate.provider);
                    self.registry
                        .record_latency(model, &candidate.provider, latency_ms);
                    tracing::info!(
                        model = %model,
                        provider = %candidate.provider,
                        latency_ms,
                        attempts,
                        "provider call succeeded"
                    );
                    return Ok(FailoverOutcome {
                        provider: candidate.provider.clone(),
                        provider_model_id: candidate.provider_model_id.clone(),
                        response,
                        attempts,
                    });
                }
                Err(error) => {
                    let category = error.category();
                    self.breaker
                        .record_failure(&candidate.provider, Some(category.as_str()));
                    if let Some(retry_after) = error.retry_after() {
                        self.retry_after
                            .set_deadline(&candidate.provider, retry_after);
                    }
                    tracing::warn!(
                        model = %model,
                        provider = %candidate.provider,
                        category = %category,
                        error = %error,
                        "provider call failed"
                    );
                    if !error.is_transient() {
                        return Err(ClientError::Provider(error));
                    }
                    last_error = Some(error);
                }
            }
        }

        // Registry exhausted (or model unregistered): default aggregator
        // with the original model id.
        let Some(fallback) = self.provider(&self.default_provider) else {
            return Err(ClientError::Configuration {
                message: format!(
                    "default provider {} is not registered",
                    self.default_provider
                ),
            });
        };

        if !candidates.is_empty() {
            tracing::info!(
                model = %model,
                "all registry providers failed, falling back to {}",
                self.default_provider
            );
        }

        attempts += 1;
        let mut fallback_request = request.clone();
        fallback_request.model = model.to_string();

        match fallback.chat_completion(fallback_request).await {
            Ok(response) => {
                self.breaker.record_success(&self.default_provider);
                Ok(FailoverOutcome {
                    provider: self.default_provider.clone(),
                    provider_model_id: model.to_string(),
                    response,
                    attempts,
                })
            }
            Err(error) => {
                self.breaker
                    .record_failure(&self.default_provider, Some(error.category().as_str()));
                let last = last_error.unwrap_or(error);
                Err(ClientError::AllProvidersFailed {
                    model: model.to_string(),
                    last_error: last.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Architecture, ModelRecord, Pricing};
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::models::{Choice, Message, Usage};
    use crate::providers::StreamResult;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedProvider {
        name: String,
        script: Mutex<VecDeque<Result<ChatResponse, &'static str>>>,
    }

    impl ScriptedProvider {
        fn new(name: &str, script: Vec<Result<ChatResponse, &'static str>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                script: Mutex::new(script.into()),
            })
        }
    }

    fn response(provider: &str) -> ChatResponse {
        ChatResponse {
            id: format!("resp-{provider}"),
            object: "chat.completion".to_string(),
            created: 0,
            model: "m".to_string(),
            choices: vec![Choice {
                index: 0,
                message: Message::assistant("ok"),
                finish_reason: Some("stop".to_string()),
            }],
            usage: Some(Usage::new(10, 40)),
        }
    }

    #[async_trait::async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn list_models(&self) -> Result<serde_json::Value, ProviderError> {
            Ok(serde_json::json!([]))
        }

        async fn chat_completion(
            &self,
            _request: ChatRequest,
        ) -> Result<ChatResponse, ProviderError> {
            match self.script.lock().unwrap().pop_front() {
                Some(Ok(resp)) => Ok(resp),
                Some(Err("timeout")) => Err(ProviderError::Timeout),
                Some(Err("500")) => Err(ProviderError::Api {
                    code: 500,
                    message: "internal".to_string(),
                }),
                Some(Err("401")) => Err(ProviderError::InvalidApiKey),
                _ => Ok(response(&self.name)),
            }
        }

        async fn chat_completion_stream(
            &self,
            _request: ChatRequest,
        ) -> Result<StreamResult, ProviderError> {
            unimplemented!("not used in router tests")
        }
    }

    fn record_for(provider: &str, price: f64) -> ModelRecord {
        ModelRecord {
            id: format!("{provider}-native-id"),
            slug: "acme/model".to_string(),
            canonical_slug: "acme/model".to_string(),
            name: "model".to_string(),
            description: String::new(),
            context_length: 8192,
            architecture: Architecture::default(),
            pricing: Some(Pricing::per_token(price, price)),
            supported_parameters: Vec::new(),
            default_parameters: serde_json::Value::Null,
            provider_slug: provider.to_string(),
            provider_site_url: None,
            model_logo_url: None,
            source_gateway: provider.to_string(),
            is_free: false,
            created: None,
        }
    }

    fn router_with(providers: Vec<Arc<ScriptedProvider>>) -> ProviderRouter {
        let registry = Arc::new(ModelRegistry::new());
        // Ascending price: a cheapest, then b, then c
        for (i, provider) in providers.iter().enumerate() {
            registry.register_canonical_records(
                provider.name(),
                &[record_for(provider.name(), (i + 1) as f64 * 1e-6)],
            );
        }
        let breaker = Arc::new(ProviderCircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(300),
            success_threshold: 1,
        }));
        let router = ProviderRouter::new(
            registry,
            breaker,
            Arc::new(RetryAfterMap::new()),
            "openrouter",
            SelectionPolicy::Cost,
        );
        for provider in providers {
            router.register_provider(provider);
        }
        router
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "acme/model".to_string(),
            messages: vec![Message::user("hi")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_failover_walks_candidates_in_order() {
        let a = ScriptedProvider::new("a", vec![Err("timeout")]);
        let b = ScriptedProvider::new("b", vec![Err("500")]);
        let c = ScriptedProvider::new("c", vec![Ok(response("c"))]);
        let router = router_with(vec![a, b, c]);

        let outcome = router
            .execute_with_failover("acme/model", &request(), None)
            .await
            .unwrap();
        assert_eq!(outcome.provider, "c");
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.response.usage.unwrap().total_tokens, 50);
    }

    #[tokio::test]
    async fn test_open_breaker_skips_provider() {
        let a = ScriptedProvider::new(
            "a",
            vec![Err("timeout"), Err("timeout"), Err("timeout")],
        );
        let b = ScriptedProvider::new("b", vec![]);
        let router = router_with(vec![a.clone(), b]);

        // Three failing requests (each falls over to b) open a's breaker
        for _ in 0..3 {
            router
                .execute_with_failover("acme/model", &request(), None)
                .await
                .unwrap();
        }

        // Next request goes straight to b: a's script is exhausted, so any
        // call to a would panic via the default Ok(...) arm count
        let outcome = router
            .execute_with_failover("acme/model", &request(), None)
            .await
            .unwrap();
        assert_eq!(outcome.provider, "b");
        assert_eq!(outcome.attempts, 1);
        assert!(router.breaker.should_skip("a"));
    }

    #[tokio::test]
    async fn test_auth_failure_aborts_without_failover() {
        let a = ScriptedProvider::new("a", vec![Err("401")]);
        let b = ScriptedProvider::new("b", vec![Ok(response("b"))]);
        let router = router_with(vec![a, b]);

        let err = router
            .execute_with_failover("acme/model", &request(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Provider(ProviderError::InvalidApiKey)
        ));
    }

    #[tokio::test]
    async fn test_unregistered_model_uses_default_aggregator() {
        let fallback = ScriptedProvider::new("openrouter", vec![Ok(response("openrouter"))]);
        let router = router_with(vec![]);
        router.register_provider(fallback);

        let outcome = router
            .execute_with_failover("unknown/model", &request(), None)
            .await
            .unwrap();
        assert_eq!(outcome.provider, "openrouter");
        // Original model id passes through untouched
        assert_eq!(outcome.provider_model_id, "unknown/model");
    }

    #[tokio::test]
    async fn test_select_primary_prefers_cheapest_then_falls_back() {
        let a = ScriptedProvider::new("a", vec![]);
        let router = router_with(vec![a]);

        let primary = router.select_primary("acme/model", None);
        assert_eq!(primary.provider, "a");
        assert_eq!(primary.provider_model_id, "a-native-id");

        let fallback = router.select_primary("unknown/model", None);
        assert_eq!(fallback.provider, "openrouter");
        assert_eq!(fallback.provider_model_id, "unknown/model");
    }
}
