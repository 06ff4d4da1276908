//! # HTTP Server Assembly
//!
//! Builds the axum application: shared state, the provider stack, the
//! catalog service with its fetchers, and the middleware chain. Layer
//! order, outermost first: admission gate, behavioral rate limiter,
//! logging, metrics, request timeout.

use crate::auth::AuthService;
use crate::config::Config;
use crate::handlers;
use crate::inference::InferenceHandler;
use crate::middleware::{
    admission_middleware, logging_middleware, metrics_middleware, security_middleware,
    AdmissionGate, RateLimitStore, SecurityLimiter,
};
use crate::pricing::PricingService;
use crate::routers::code::{CodeRouter, QualityPriors};
use crate::routers::general::{GeneralRouter, HttpSelectorClient, ModelSelector};
use crate::storage::{Storage, StorageSnapshotSource};
use axum::routing::{get, post};
use axum::Router;
use gatewayz_models_sdk::aggregator::{CatalogConfig, CatalogService};
use gatewayz_models_sdk::catalog::{ModelRegistry, SelectionPolicy};
use gatewayz_models_sdk::circuit_breaker::{ProviderCircuitBreaker, RetryAfterMap};
use gatewayz_models_sdk::fetchers::{
    alibaba::AlibabaFetcher, featherless::FeatherlessFetcher, groq::GroqFetcher,
    openai_compat::{builtin_gateways, OpenAiCompatFetcher}, openrouter::OpenRouterFetcher,
    CatalogFetcher, ManualPricingOverlay,
};
use gatewayz_models_sdk::providers::{create_provider, ProviderConfig};
use gatewayz_models_sdk::ProviderRouter;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;

/// Shared state across all HTTP handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub admission: Arc<AdmissionGate>,
    pub security: Arc<SecurityLimiter>,
    pub catalog: Arc<CatalogService>,
    pub registry: Arc<ModelRegistry>,
    pub breaker: Arc<ProviderCircuitBreaker>,
    pub auth: Arc<AuthService>,
    pub handler: Arc<InferenceHandler>,
    pub code_router: Arc<CodeRouter>,
    pub general_router: Arc<GeneralRouter>,
    pub models_response_cache: Arc<Mutex<LruCache<String, (Instant, serde_json::Value)>>>,
}

impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            admission: Arc::clone(&self.admission),
            security: Arc::clone(&self.security),
            catalog: Arc::clone(&self.catalog),
            registry: Arc::clone(&self.registry),
            breaker: Arc::clone(&self.breaker),
            auth: Arc::clone(&self.auth),
            handler: Arc::clone(&self.handler),
            code_router: Arc::clone(&self.code_router),
            general_router: Arc::clone(&self.general_router),
            models_response_cache: Arc::clone(&self.models_response_cache),
        }
    }
}

/// Build the catalog fetcher set from configured gateway API keys.
fn build_fetchers(config: &Config) -> Vec<Arc<dyn CatalogFetcher>> {
    let mut fetchers: Vec<Arc<dyn CatalogFetcher>> = Vec::new();
    let key = |slug: &str| config.gateway_keys.get(slug).cloned();

    if let Some(api_key) = key("openrouter") {
        match OpenRouterFetcher::new(api_key, None) {
            Ok(fetcher) => fetchers.push(Arc::new(fetcher)),
            Err(e) => tracing::error!(error = %e, "failed to build openrouter fetcher"),
        }
    }
    if let Some(api_key) = key("groq") {
        match GroqFetcher::new(api_key, None) {
            Ok(fetcher) => fetchers.push(Arc::new(fetcher)),
            Err(e) => tracing::error!(error = %e, "failed to build groq fetcher"),
        }
    }
    if let Some(api_key) = key("featherless") {
        match FeatherlessFetcher::new(api_key, None, None) {
            Ok(fetcher) => fetchers.push(Arc::new(fetcher)),
            Err(e) => tracing::error!(error = %e, "failed to build featherless fetcher"),
        }
    }
    if key("alibaba").is_some() || key("alibaba-cn").is_some() {
        let regions = AlibabaFetcher::default_regions(key("alibaba"), key("alibaba-cn"));
        fetchers.push(Arc::new(AlibabaFetcher::new(regions, None)));
    }

    for spec in builtin_gateways() {
        let slug = spec.slug;
        if matches!(slug, "openrouter" | "groq" | "featherless" | "alibaba") {
            continue;
        }
        if let Some(api_key) = key(slug) {
            match OpenAiCompatFetcher::new(spec, api_key, None) {
                Ok(fetcher) => fetchers.push(Arc::new(fetcher)),
                Err(e) => tracing::error!(gateway = slug, error = %e, "failed to build fetcher"),
            }
        }
    }

    fetchers
}

/// Create and wire the full application router.
pub async fn create_server(
    config: Config,
    storage: Arc<dyn Storage>,
) -> anyhow::Result<Router> {
    let config = Arc::new(config);

    let registry = Arc::new(ModelRegistry::new());
    let breaker = Arc::new(ProviderCircuitBreaker::default());
    let retry_after = Arc::new(RetryAfterMap::new());

    // Manual pricing overlay from the store
    let overlay = match storage.pricing_overrides().await {
        Ok(overrides) => ManualPricingOverlay::new(overrides),
        Err(e) => {
            tracing::warn!(error = %e, "pricing overrides unavailable, using empty overlay");
            ManualPricingOverlay::default()
        }
    };

    let catalog_config = CatalogConfig {
        ttl: config.catalog.ttl,
        stale_ttl: config.catalog.stale_ttl,
        fetch_workers: config.catalog.fetch_workers,
        refresh_workers: config.catalog.refresh_workers,
        per_provider_timeout: config.catalog.per_provider_timeout,
        overall_timeout: config.catalog.overall_timeout,
        ..Default::default()
    };
    let mut catalog = CatalogService::new(
        catalog_config,
        Arc::clone(&registry),
        Arc::clone(&breaker),
        Arc::clone(&retry_after),
        overlay,
        Some(Arc::new(StorageSnapshotSource(Arc::clone(&storage)))),
    );
    for fetcher in build_fetchers(&config) {
        catalog.add_fetcher(fetcher);
    }
    catalog.set_failure_hook(Arc::new(|gateway, category| {
        crate::metrics::metrics().inc_catalog_failure(gateway, category);
    }));
    let catalog = Arc::new(catalog);

    // Runtime inference providers
    let policy = match config.routing.policy.as_str() {
        "latency" => SelectionPolicy::Latency,
        _ => SelectionPolicy::Cost,
    };
    let router = Arc::new(ProviderRouter::new(
        Arc::clone(&registry),
        Arc::clone(&breaker),
        Arc::clone(&retry_after),
        config.routing.default_provider.clone(),
        policy,
    ));
    for (name, provider_config) in &config.providers {
        if !provider_config.enabled {
            continue;
        }
        match create_provider(provider_config.clone()) {
            Ok(provider) => router.register_provider(provider),
            Err(e) => tracing::error!(provider = %name, error = %e, "failed to create provider"),
        }
    }
    // The default aggregator always gets a runtime client when its key is
    // configured, even without an explicit provider entry
    if router.provider(&config.routing.default_provider).is_none() {
        if let Some(api_key) = config.gateway_keys.get(&config.routing.default_provider) {
            if let Ok(provider) = create_provider(ProviderConfig::new(
                config.routing.default_provider.clone(),
                api_key.clone(),
            )) {
                router.register_provider(provider);
            }
        }
    }

    let auth = Arc::new(AuthService::new(Arc::clone(&storage), &config));
    let pricing = Arc::new(PricingService::new(
        Arc::clone(&registry),
        config.pricing.clone(),
    ));
    let handler = Arc::new(InferenceHandler::new(
        Arc::clone(&auth),
        pricing,
        router,
        Arc::clone(&storage),
    ));

    // Rate limit backend: Redis when reachable, in-process otherwise
    let store = match &config.redis_url {
        Some(url) => match redis::Client::open(url.as_str()) {
            Ok(client) => match client.get_connection_manager().await {
                Ok(conn) => {
                    tracing::info!("behavioral rate limiter backed by redis");
                    RateLimitStore::with_redis(conn)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "redis unreachable, using in-process rate limiting");
                    RateLimitStore::in_memory()
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "invalid redis url, using in-process rate limiting");
                RateLimitStore::in_memory()
            }
        },
        None => RateLimitStore::in_memory(),
    };
    let security = Arc::new(SecurityLimiter::new(config.security.clone(), store));

    let admission = Arc::new(AdmissionGate::new(&config.admission));

    let code_router = Arc::new(CodeRouter::new(QualityPriors::load(None)));
    let selector: Option<Arc<dyn ModelSelector>> = match (
        &config.routing.selector_url,
        &config.routing.selector_api_key,
    ) {
        (Some(url), Some(api_key)) => {
            match HttpSelectorClient::new(url.clone(), api_key.clone(), Duration::from_secs(10)) {
                Ok(client) => Some(Arc::new(client)),
                Err(e) => {
                    tracing::error!(error = %e, "failed to build selector client");
                    None
                }
            }
        }
        _ => None,
    };
    let general_router = Arc::new(GeneralRouter::new(selector));

    let response_cache_size =
        NonZeroUsize::new(config.catalog.response_cache_size.max(1)).unwrap();

    let state = AppState {
        config: Arc::clone(&config),
        admission,
        security,
        catalog,
        registry,
        breaker,
        auth,
        handler,
        code_router,
        general_router,
        models_response_cache: Arc::new(Mutex::new(LruCache::new(response_cache_size))),
    };

    let app = Router::new()
        // Core API
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/models", get(handlers::list_models))
        // Health and metrics
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::ready))
        .route("/metrics", get(handlers::prometheus_metrics))
        // Diagnostics
        .route(
            "/api/diagnostics/health",
            get(handlers::diagnostics_health),
        )
        .route(
            "/api/diagnostics/concurrency",
            get(handlers::diagnostics_concurrency),
        )
        .route(
            "/api/diagnostics/provider-timing",
            get(handlers::diagnostics_provider_timing),
        )
        .route(
            "/api/diagnostics/circuit-breakers",
            get(handlers::diagnostics_circuit_breakers),
        )
        // Router inspection
        .route("/v1/routers/code", get(handlers::code_router_info))
        .route("/v1/routers/code/test", post(handlers::code_router_test))
        .route("/v1/routers/general", get(handlers::general_router_info))
        .route(
            "/v1/routers/general/test",
            post(handlers::general_router_test),
        )
        .layer(
            ServiceBuilder::new()
                .layer(tower_http::cors::CorsLayer::permissive())
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    admission_middleware,
                ))
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    security_middleware,
                ))
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    logging_middleware,
                ))
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    metrics_middleware,
                ))
                .layer(TimeoutLayer::new(config.server.timeout)),
        )
        .with_state(state);

    Ok(app)
}
