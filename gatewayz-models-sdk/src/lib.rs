//! # Gatewayz Models SDK
//!
//! Provider core for the Gatewayz LLM gateway: a unified view over ~30
//! heterogeneous upstream gateways (OpenAI-compatible endpoints, brokered
//! catalogs, region-split clouds) with the machinery the gateway's request
//! pipeline is built on.
//!
//! ## What lives here
//!
//! - **Catalog**: per-gateway fetchers normalize every provider's model
//!   listing into [`catalog::ModelRecord`] with per-single-token pricing;
//!   the [`aggregator::CatalogService`] fans out fetches over a bounded
//!   worker pool, caches with stale-while-revalidate semantics, and rebuilds
//!   the canonical model registry.
//! - **Resilience**: [`circuit_breaker::ProviderCircuitBreaker`] per
//!   provider, Retry-After deadline tracking, typed per-gateway caches with
//!   error backoff states.
//! - **Inference**: the [`providers::Provider`] trait with async SSE
//!   clients and a bridge for blocking upstream SDKs, plus the
//!   [`router::ProviderRouter`] that resolves canonical models to provider
//!   candidates and fails over across them.
//!
//! ## Example
//!
//! ```rust
//! use gatewayz_models_sdk::models::{ChatRequest, Message};
//! use gatewayz_models_sdk::providers::{create_provider, ProviderConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let provider = create_provider(ProviderConfig::new("openrouter", "sk-or-…"))?;
//! let response = provider
//!     .chat_completion(ChatRequest {
//!         model: "openai/gpt-4o".to_string(),
//!         messages: vec![Message::user("Hello!")],
//!         ..Default::default()
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod cache;
pub mod catalog;
pub mod circuit_breaker;
pub mod common;
pub mod error;
pub mod fetchers;
pub mod models;
pub mod providers;
pub mod router;

pub use aggregator::{CatalogConfig, CatalogService, CatalogSnapshotSource};
pub use cache::{CacheRead, GatewayCache};
pub use catalog::{CanonicalModel, ModelRecord, ModelRegistry, Pricing, SelectionPolicy};
pub use circuit_breaker::{CircuitBreakerConfig, ProviderCircuitBreaker, RetryAfterMap};
pub use error::{ClientError, FailureCategory, ProviderError};
pub use models::{ChatRequest, ChatResponse, Message, MessageContent, Role, StreamChunk, Usage};
pub use providers::{create_provider, Provider, ProviderConfig, StreamResult};
pub use router::{FailoverOutcome, PrimarySelection, ProviderRouter};

/// Result type for SDK operations.
pub type Result<T> = std::result::Result<T, ClientError>;
