//! # General-Purpose Prompt Router
//!
//! Delegates optimal-model selection for non-code prompts to an external
//! selector service, with typed fallbacks at every seam:
//!
//! - the selector is called with the conversation, the candidate model ids,
//!   and a preference derived from the mode (balanced maps to quality);
//! - the selector's native model id maps to a gateway id through a static
//!   table, then keyword heuristics, then the default aggregator;
//! - the mapped id is checked against the live catalog; a miss falls back
//!   to the mode-specific default model;
//! - selector failures retry with exponential backoff (1 s base, 10 s cap,
//!   three attempts) before falling back with `fallback_reason=exception`.

use async_trait::async_trait;
use gatewayz_models_sdk::models::Message;
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Routing mode for the general router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GeneralRouterMode {
    #[default]
    Balanced,
    Quality,
    Cost,
    Latency,
}

impl GeneralRouterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeneralRouterMode::Balanced => "balanced",
            GeneralRouterMode::Quality => "quality",
            GeneralRouterMode::Cost => "cost",
            GeneralRouterMode::Latency => "latency",
        }
    }

    /// Selector preference: balanced requests map to quality.
    pub fn selector_preference(&self) -> &'static str {
        match self {
            GeneralRouterMode::Balanced | GeneralRouterMode::Quality => "quality",
            GeneralRouterMode::Cost => "cost",
            GeneralRouterMode::Latency => "latency",
        }
    }
}

/// Parse a `router:general[:mode]` model string.
pub fn parse_general_router_model(model: &str) -> Option<GeneralRouterMode> {
    let lower = model.to_lowercase();
    if !lower.starts_with("router:general") {
        return None;
    }
    let parts: Vec<&str> = lower.split(':').collect();
    match parts.as_slice() {
        ["router", "general"] => Some(GeneralRouterMode::Balanced),
        ["router", "general", mode] => Some(match *mode {
            "quality" => GeneralRouterMode::Quality,
            "cost" => GeneralRouterMode::Cost,
            "latency" => GeneralRouterMode::Latency,
            other => {
                tracing::warn!(mode = other, "unknown general router mode, using balanced");
                GeneralRouterMode::Balanced
            }
        }),
        _ => None,
    }
}

/// Mode-specific fallback models when the selector cannot be used.
pub fn fallback_model(mode: GeneralRouterMode) -> &'static str {
    match mode {
        GeneralRouterMode::Quality => "openai/gpt-4o",
        GeneralRouterMode::Cost => "openai/gpt-4o-mini",
        GeneralRouterMode::Latency => "groq/llama-3.3-70b-versatile",
        GeneralRouterMode::Balanced => "anthropic/claude-sonnet-4",
    }
}

/// Provider slug from a gateway model id prefix; bare ids route through
/// the default aggregator.
pub fn provider_for_model(model_id: &str) -> &str {
    match model_id.split_once('/') {
        Some((provider, _)) if !provider.is_empty() => provider,
        _ => "openrouter",
    }
}

/// The selector's answer.
#[derive(Debug, Clone)]
pub struct SelectorChoice {
    pub native_model_id: String,
    pub session_id: Option<String>,
    pub confidence: f64,
}

/// External optimal-model selector.
#[async_trait]
pub trait ModelSelector: Send + Sync {
    async fn select(
        &self,
        messages: &[Message],
        candidates: &[String],
        preference: &str,
    ) -> anyhow::Result<SelectorChoice>;
}

/// HTTP client for a hosted selector service.
pub struct HttpSelectorClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpSelectorClient {
    pub fn new(base_url: String, api_key: String, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            base_url,
            api_key,
        })
    }
}

#[async_trait]
impl ModelSelector for HttpSelectorClient {
    async fn select(
        &self,
        messages: &[Message],
        candidates: &[String],
        preference: &str,
    ) -> anyhow::Result<SelectorChoice> {
        let payload = serde_json::json!({
            "messages": messages,
            "llm_providers": candidates,
            "preference": preference,
        });
        let response = self
            .client
            .post(format!("{}/v2/modelRouter/modelSelect", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        let body: serde_json::Value = response.json().await?;
        let native_model_id = body["providers"][0]["model"]
            .as_str()
            .or_else(|| body["model"].as_str())
            .ok_or_else(|| anyhow::anyhow!("selector response carried no model"))?
            .to_string();

        Ok(SelectorChoice {
            native_model_id,
            session_id: body["session_id"].as_str().map(String::from),
            confidence: body["confidence"].as_f64().unwrap_or(0.0),
        })
    }
}

/// Routing outcome for a general prompt.
#[derive(Debug, Clone, Serialize)]
pub struct GeneralRoute {
    pub model_id: String,
    pub provider: String,
    pub mode: GeneralRouterMode,
    pub routing_latency_ms: f64,
    pub confidence: f64,
    pub fallback_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector_session_id: Option<String>,
}

pub struct GeneralRouter {
    selector: Option<Arc<dyn ModelSelector>>,
    mapping: HashMap<&'static str, &'static str>,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl GeneralRouter {
    pub fn new(selector: Option<Arc<dyn ModelSelector>>) -> Self {
        Self {
            selector,
            mapping: Self::native_mapping(),
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(10),
        }
    }

    #[cfg(test)]
    fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    /// Static mapping from selector-native model names to gateway ids.
    fn native_mapping() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("gpt-4o", "openai/gpt-4o"),
            ("gpt-4o-mini", "openai/gpt-4o-mini"),
            ("gpt-4-turbo", "openai/gpt-4-turbo"),
            ("claude-sonnet-4", "anthropic/claude-sonnet-4"),
            ("claude-3-5-sonnet", "anthropic/claude-3.5-sonnet"),
            ("claude-3-haiku", "anthropic/claude-3-haiku"),
            ("gemini-1.5-pro", "google/gemini-1.5-pro"),
            ("gemini-2.0-flash", "google/gemini-2.0-flash"),
            ("llama-3.3-70b", "groq/llama-3.3-70b-versatile"),
            ("mistral-large", "mistralai/mistral-large"),
        ])
    }

    /// Map a selector-native id to a gateway id: table first, keyword
    /// heuristics second, default aggregator last.
    pub fn map_native_model(&self, native: &str) -> String {
        if let Some(mapped) = self.mapping.get(native) {
            return mapped.to_string();
        }
        let lower = native.to_lowercase();
        if native.contains('/') {
            return native.to_string();
        }
        if lower.contains("gpt") || lower.starts_with("o1") || lower.starts_with("o3") {
            return format!("openai/{native}");
        }
        if lower.contains("claude") {
            return format!("anthropic/{native}");
        }
        if lower.contains("gemini") {
            return format!("google/{native}");
        }
        if lower.contains("llama") {
            return format!("meta-llama/{native}");
        }
        if lower.contains("mistral") || lower.contains("mixtral") {
            return format!("mistralai/{native}");
        }
        // Default aggregator resolves anything else
        native.to_string()
    }

    /// Route a general prompt.
    ///
    /// `available_models` is the live catalog id set; a selected model
    /// missing from it falls back to the mode default.
    pub async fn route(
        &self,
        messages: &[Message],
        mode: GeneralRouterMode,
        candidates: &[String],
        available_models: &HashSet<String>,
    ) -> GeneralRoute {
        let start = Instant::now();

        let Some(selector) = &self.selector else {
            return self.fallback(mode, "disabled", start);
        };

        let choice = match self
            .select_with_retries(selector.as_ref(), messages, candidates, mode)
            .await
        {
            Ok(choice) => choice,
            Err(e) => {
                tracing::warn!(error = %e, "selector routing failed after retries");
                return self.fallback(mode, "exception", start);
            }
        };

        let model_id = self.map_native_model(&choice.native_model_id);
        if !available_models.is_empty() && !available_models.contains(&model_id) {
            tracing::warn!(
                model = %model_id,
                "selector picked a model absent from the live catalog"
            );
            return self.fallback(mode, "model_unavailable", start);
        }

        let route = GeneralRoute {
            provider: provider_for_model(&model_id).to_string(),
            model_id,
            mode,
            routing_latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            confidence: choice.confidence,
            fallback_used: false,
            fallback_reason: None,
            selector_session_id: choice.session_id,
        };
        tracing::info!(
            model = %route.model_id,
            mode = mode.as_str(),
            confidence = route.confidence,
            latency_ms = route.routing_latency_ms,
            "general router selected model"
        );
        route
    }

    async fn select_with_retries(
        &self,
        selector: &dyn ModelSelector,
        messages: &[Message],
        candidates: &[String],
        mode: GeneralRouterMode,
    ) -> anyhow::Result<SelectorChoice> {
        let mut last_error = None;
        for attempt in 0..self.max_attempts {
            match selector
                .select(messages, candidates, mode.selector_preference())
                .await
            {
                Ok(choice) => return Ok(choice),
                Err(e) => {
                    if attempt + 1 < self.max_attempts {
                        let backoff = self
                            .backoff_base
                            .saturating_mul(2u32.saturating_pow(attempt))
                            .min(self.backoff_cap);
                        let jitter =
                            backoff.mul_f64(rand::thread_rng().gen_range(0.0..0.1));
                        tracing::warn!(
                            attempt = attempt + 1,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "selector call failed, backing off"
                        );
                        tokio::time::sleep(backoff + jitter).await;
                    }
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("selector unavailable")))
    }

    fn fallback(&self, mode: GeneralRouterMode, reason: &str, start: Instant) -> GeneralRoute {
        let model_id = fallback_model(mode).to_string();
        tracing::info!(
            model = %model_id,
            mode = mode.as_str(),
            reason,
            "general router using fallback model"
        );
        GeneralRoute {
            provider: provider_for_model(&model_id).to_string(),
            model_id,
            mode,
            routing_latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            confidence: 0.0,
            fallback_used: true,
            fallback_reason: Some(reason.to_string()),
            selector_session_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedSelector {
        fail_first: u32,
        calls: AtomicU32,
        native: &'static str,
    }

    #[async_trait]
    impl ModelSelector for ScriptedSelector {
        async fn select(
            &self,
            _messages: &[Message],
            _candidates: &[String],
            _preference: &str,
        ) -> anyhow::Result<SelectorChoice> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                anyhow::bail!("selector 503");
            }
            Ok(SelectorChoice {
                native_model_id: self.native.to_string(),
                session_id: Some("sess-1".to_string()),
                confidence: 0.95,
            })
        }
    }

    fn available(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_mode_strings() {
        assert_eq!(
            parse_general_router_model("router:general"),
            Some(GeneralRouterMode::Balanced)
        );
        assert_eq!(
            parse_general_router_model("router:general:cost"),
            Some(GeneralRouterMode::Cost)
        );
        assert_eq!(
            parse_general_router_model("router:general:nope"),
            Some(GeneralRouterMode::Balanced)
        );
        assert_eq!(parse_general_router_model("router:code"), None);
        assert_eq!(parse_general_router_model("gpt-4o"), None);
    }

    #[test]
    fn test_mapping_table_and_keyword_heuristics() {
        let router = GeneralRouter::new(None);
        assert_eq!(router.map_native_model("gpt-4o"), "openai/gpt-4o");
        assert_eq!(
            router.map_native_model("claude-sonnet-4"),
            "anthropic/claude-sonnet-4"
        );
        // Keyword heuristics for unmapped names
        assert_eq!(router.map_native_model("gpt-5-preview"), "openai/gpt-5-preview");
        assert_eq!(
            router.map_native_model("claude-omega"),
            "anthropic/claude-omega"
        );
        // Already-prefixed and unknown ids pass through
        assert_eq!(router.map_native_model("acme/model-x"), "acme/model-x");
        assert_eq!(router.map_native_model("totally-unknown"), "totally-unknown");
    }

    #[test]
    fn test_fallback_models_per_mode() {
        assert_eq!(fallback_model(GeneralRouterMode::Quality), "openai/gpt-4o");
        assert_eq!(fallback_model(GeneralRouterMode::Cost), "openai/gpt-4o-mini");
        assert_eq!(
            fallback_model(GeneralRouterMode::Latency),
            "groq/llama-3.3-70b-versatile"
        );
        assert_eq!(
            fallback_model(GeneralRouterMode::Balanced),
            "anthropic/claude-sonnet-4"
        );
    }

    #[tokio::test]
    async fn test_no_selector_uses_fallback() {
        let router = GeneralRouter::new(None);
        let route = router
            .route(&[], GeneralRouterMode::Balanced, &[], &HashSet::new())
            .await;
        assert!(route.fallback_used);
        assert_eq!(route.fallback_reason.as_deref(), Some("disabled"));
        assert_eq!(route.model_id, "anthropic/claude-sonnet-4");
        assert_eq!(route.provider, "anthropic");
    }

    #[tokio::test]
    async fn test_selector_success_maps_and_checks_catalog() {
        let selector = Arc::new(ScriptedSelector {
            fail_first: 0,
            calls: AtomicU32::new(0),
            native: "gpt-4o",
        });
        let router = GeneralRouter::new(Some(selector));
        let route = router
            .route(
                &[Message::user("hi")],
                GeneralRouterMode::Quality,
                &[],
                &available(&["openai/gpt-4o"]),
            )
            .await;
        assert!(!route.fallback_used);
        assert_eq!(route.model_id, "openai/gpt-4o");
        assert_eq!(route.selector_session_id.as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn test_catalog_miss_falls_back_per_mode() {
        let selector = Arc::new(ScriptedSelector {
            fail_first: 0,
            calls: AtomicU32::new(0),
            native: "gpt-4o",
        });
        let router = GeneralRouter::new(Some(selector));
        let route = router
            .route(
                &[Message::user("hi")],
                GeneralRouterMode::Cost,
                &[],
                &available(&["anthropic/claude-sonnet-4"]),
            )
            .await;
        assert!(route.fallback_used);
        assert_eq!(route.fallback_reason.as_deref(), Some("model_unavailable"));
        assert_eq!(route.model_id, "openai/gpt-4o-mini");
    }

    #[tokio::test]
    async fn test_retries_then_success() {
        let selector = Arc::new(ScriptedSelector {
            fail_first: 2,
            calls: AtomicU32::new(0),
            native: "gpt-4o",
        });
        let router = GeneralRouter::new(Some(Arc::clone(&selector) as Arc<dyn ModelSelector>))
            .with_backoff(Duration::from_millis(1), Duration::from_millis(4));
        let route = router
            .route(
                &[Message::user("hi")],
                GeneralRouterMode::Quality,
                &[],
                &available(&["openai/gpt-4o"]),
            )
            .await;
        assert!(!route.fallback_used);
        assert_eq!(selector.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fall_back_with_exception() {
        let selector = Arc::new(ScriptedSelector {
            fail_first: 10,
            calls: AtomicU32::new(0),
            native: "gpt-4o",
        });
        let router = GeneralRouter::new(Some(Arc::clone(&selector) as Arc<dyn ModelSelector>))
            .with_backoff(Duration::from_millis(1), Duration::from_millis(4));
        let route = router
            .route(&[], GeneralRouterMode::Latency, &[], &HashSet::new())
            .await;
        assert!(route.fallback_used);
        assert_eq!(route.fallback_reason.as_deref(), Some("exception"));
        assert_eq!(route.model_id, "groq/llama-3.3-70b-versatile");
        assert_eq!(selector.calls.load(Ordering::SeqCst), 3);
    }
}
