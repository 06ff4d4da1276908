//! # Provider Runtime Clients
//!
//! The inference-time abstraction over upstream gateways. Every integration
//! implements [`Provider`]: a model listing, a non-streaming chat completion,
//! and a streaming chat completion normalized into a single async chunk
//! stream regardless of how the upstream SDK exposes iteration.
//!
//! Two client families cover the fleet:
//!
//! - [`openrouter`] / [`openai_compat`]: async reqwest clients speaking the
//!   OpenAI-compatible wire format over SSE.
//! - [`blocking`]: a bridge for providers whose SDKs only offer synchronous
//!   iteration. The blocking iterator runs on a dedicated worker thread and
//!   chunks cross into async land over a bounded channel; iterator
//!   exhaustion becomes a clean channel close instead of an error value
//!   leaking across the boundary.
//!
//! Providers are created from [`ProviderConfig`] via [`create_provider`];
//! the router layers circuit breaking and retry-after bookkeeping on top.

use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse, StreamChunk};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

pub mod blocking;
pub mod http_client;
pub mod openai_compat;
pub mod openrouter;

/// Pinned boxed stream of chat completion chunks.
pub type StreamResult = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// Interface every upstream integration implements.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Provider slug, e.g. `openrouter`.
    fn name(&self) -> &str;

    /// Whether streaming chat completions are supported.
    fn supports_streaming(&self) -> bool {
        true
    }

    /// Raw model listing as published by the provider. The catalog fetchers
    /// normalize this; handlers never consume it directly.
    async fn list_models(&self) -> Result<serde_json::Value, ProviderError>;

    /// Perform a chat completion request.
    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Perform a streaming chat completion request.
    async fn chat_completion_stream(
        &self,
        request: ChatRequest,
    ) -> Result<StreamResult, ProviderError>;
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider").field("name", &self.name()).finish()
    }
}

/// How a provider's upstream SDK iterates.
///
/// Most gateways stream asynchronously; a few only ship synchronous
/// clients and go through the [`blocking`] bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderTransport {
    #[default]
    Async,
    Blocking,
}

/// Configuration for one provider instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider slug
    pub name: String,
    /// API key for authentication
    pub api_key: String,
    /// Override for the provider's default base URL
    #[serde(default)]
    pub base_url: Option<String>,
    /// Request timeout
    #[serde(default = "default_timeout", with = "crate::common::duration_serde")]
    pub timeout: Duration,
    /// Model name mappings (gateway model ids to provider-native ids)
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    /// Custom HTTP headers to include in requests
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Whether this provider is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Sync-SDK providers bridge through a worker thread
    #[serde(default)]
    pub transport: ProviderTransport,
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_enabled() -> bool {
    true
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api_key: api_key.into(),
            base_url: None,
            timeout: default_timeout(),
            model_mapping: HashMap::new(),
            headers: HashMap::new(),
            enabled: true,
            transport: ProviderTransport::Async,
        }
    }

    pub fn with_blocking_transport(mut self) -> Self {
        self.transport = ProviderTransport::Blocking;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_model_mapping(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.model_mapping.insert(from.into(), to.into());
        self
    }
}

/// Create a provider instance from configuration.
///
/// `openrouter` gets its dedicated client; every other slug is treated as an
/// OpenAI-compatible gateway and requires a base URL. Providers marked with
/// the blocking transport go through the worker-thread bridge.
pub fn create_provider(
    config: ProviderConfig,
) -> Result<std::sync::Arc<dyn Provider>, ProviderError> {
    if config.transport == ProviderTransport::Blocking {
        return Ok(std::sync::Arc::new(blocking::BlockingSseProvider::new(
            config,
        )?));
    }
    match config.name.as_str() {
        "openrouter" => Ok(std::sync::Arc::new(openrouter::OpenRouterProvider::new(
            config,
        )?)),
        _ => {
            if config.base_url.is_none() {
                return Err(ProviderError::Configuration {
                    message: format!(
                        "provider {} requires an explicit base_url",
                        config.name
                    ),
                });
            }
            Ok(std::sync::Arc::new(
                openai_compat::OpenAiCompatProvider::new(config)?,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_config_builder() {
        let config = ProviderConfig::new("groq", "key")
            .with_base_url("https://api.groq.com/openai/v1")
            .with_timeout(Duration::from_secs(20))
            .with_model_mapping("groq/llama-3.3-70b-versatile", "llama-3.3-70b-versatile");

        assert_eq!(config.name, "groq");
        assert_eq!(config.timeout.as_secs(), 20);
        assert!(config.enabled);
        assert_eq!(
            config.model_mapping["groq/llama-3.3-70b-versatile"],
            "llama-3.3-70b-versatile"
        );
    }

    #[test]
    fn test_create_provider_requires_base_url_for_compat() {
        let err = create_provider(ProviderConfig::new("acme", "key")).unwrap_err();
        assert!(matches!(err, ProviderError::Configuration { .. }));

        let ok = create_provider(
            ProviderConfig::new("acme", "key").with_base_url("https://api.acme.dev/v1"),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_blocking_transport_uses_bridge() {
        let provider = create_provider(
            ProviderConfig::new("cerebras", "key")
                .with_base_url("https://api.cerebras.ai/v1")
                .with_blocking_transport(),
        )
        .unwrap();
        assert_eq!(provider.name(), "cerebras");
    }
}
