//! # HTTP Handlers
//!
//! Endpoint adapters over the core. The chat endpoint resolves virtual
//! router models first, then hands the request to the inference handler;
//! streaming responses go out as SSE with a terminal `[DONE]` event. The
//! models listing serves the aggregated catalog through a small response
//! cache keyed by request fingerprint. Diagnostics endpoints expose the
//! admission gate, provider timing, and circuit breaker state.

use crate::auth::AuthService;
use crate::gateway_error::GatewayError;
use crate::inference::InternalChatRequest;
use crate::metrics::metrics;
use crate::routers::code::{code_router_model_string, CodeRouterMode};
use crate::routers::general::{fallback_model, GeneralRouterMode};
use crate::routers::{normalize_model_alias, parse_code_router_model, parse_general_router_model};
use crate::server::AppState;
use crate::timing::timing_tracker;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde_json::json;
use std::collections::HashSet;
use std::convert::Infallible;
use std::time::{Duration, Instant};

fn api_key_from_headers(headers: &HeaderMap) -> Result<String, GatewayError> {
    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok());
    AuthService::extract_api_key(header).ok_or_else(|| GatewayError::InvalidApiKey {
        message: "Missing Authorization header".to_string(),
    })
}

/// Resolve `router:…` virtual models to a concrete model id. Returns the
/// routing metadata attached to non-streaming responses.
async fn resolve_virtual_model(
    state: &AppState,
    request: &mut InternalChatRequest,
) -> Option<serde_json::Value> {
    let normalized = normalize_model_alias(&request.model);

    if let Some(mode) = parse_code_router_model(&normalized) {
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, gatewayz_models_sdk::models::Role::User))
            .map(|m| m.content.to_text())
            .unwrap_or_default();
        let context = state.code_router.classifier().extract_context(&request.messages);
        let route = state.code_router.route(&prompt, mode, Some(&context));
        request.model = route.model_id.clone();
        return Some(serde_json::to_value(&route).unwrap_or_default());
    }

    if let Some(mode) = parse_general_router_model(&normalized) {
        let available: HashSet<String> = state
            .catalog
            .get_all_models()
            .await
            .into_iter()
            .map(|m| m.id)
            .collect();
        let candidates: Vec<String> = available.iter().take(128).cloned().collect();
        let route = state
            .general_router
            .route(&request.messages, mode, &candidates, &available)
            .await;
        request.model = route.model_id.clone();
        return Some(serde_json::to_value(&route).unwrap_or_default());
    }

    if normalized != request.model {
        request.model = normalized;
    }
    None
}

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut request): Json<InternalChatRequest>,
) -> Response {
    let api_key = match api_key_from_headers(&headers) {
        Ok(key) => key,
        Err(e) => return e.into_response(),
    };

    if request.messages.is_empty() {
        return GatewayError::Validation {
            message: "messages must not be empty".to_string(),
        }
        .into_response();
    }

    let routing_metadata = resolve_virtual_model(&state, &mut request).await;

    if request.stream {
        let stream = match state.handler.clone().process_stream(&api_key, request).await {
            Ok(stream) => stream,
            Err(e) => return e.into_response(),
        };

        let events = stream
            .map(|item| {
                let event = match item {
                    Ok(chunk) => Event::default()
                        .data(serde_json::to_string(&chunk).unwrap_or_default()),
                    Err(e) => Event::default().data(
                        json!({"error": {"code": e.code(), "message": e.to_string()}})
                            .to_string(),
                    ),
                };
                Ok::<Event, Infallible>(event)
            })
            .chain(futures::stream::once(async {
                Ok(Event::default().data("[DONE]"))
            }));

        return Sse::new(events).keep_alive(KeepAlive::default()).into_response();
    }

    match state.handler.process(&api_key, request).await {
        Ok(response) => {
            let mut body = serde_json::to_value(&response).unwrap_or_default();
            if let Some(metadata) = routing_metadata {
                body["routing"] = metadata;
            }
            Json(body).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// GET /v1/models - aggregated catalog with a fingerprint-keyed response
/// cache in front of the fan-out.
pub async fn list_models(State(state): State<AppState>) -> Response {
    let fingerprint = "models:all".to_string();

    {
        let mut cache = state.models_response_cache.lock().unwrap();
        if let Some((at, cached)) = cache.get(&fingerprint) {
            if at.elapsed() < Duration::from_secs(60) {
                let body = cached.clone();
                return Json(body).into_response();
            }
        }
    }

    let models = state.catalog.get_all_models().await;
    let body = json!({
        "object": "list",
        "data": models,
    });

    state
        .models_response_cache
        .lock()
        .unwrap()
        .put(fingerprint, (Instant::now(), body.clone()));

    Json(body).into_response()
}

/// GET /health
pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy"}))
}

/// GET /ready
pub async fn ready() -> Json<serde_json::Value> {
    Json(json!({"status": "ready"}))
}

/// GET /metrics - Prometheus text format.
pub async fn prometheus_metrics() -> Response {
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        metrics().render_prometheus(),
    )
        .into_response()
}

/// GET /api/diagnostics/health
pub async fn diagnostics_health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// GET /api/diagnostics/concurrency
pub async fn diagnostics_concurrency(State(state): State<AppState>) -> Json<serde_json::Value> {
    let gate = &state.admission;
    let utilization = gate.utilization();
    let health = if utilization >= 0.9 || gate.waiting() >= gate.queue_size() {
        "critical"
    } else if utilization >= 0.7 {
        "warning"
    } else {
        "healthy"
    };

    Json(json!({
        "active_requests": metrics().active_requests(),
        "queued_requests": metrics().queued_requests(),
        "limit": gate.limit(),
        "queue_size": gate.queue_size(),
        "utilization_percent": (utilization * 100.0).round(),
        "health": health,
    }))
}

/// GET /api/diagnostics/provider-timing
pub async fn diagnostics_provider_timing() -> Json<serde_json::Value> {
    Json(json!({
        "providers": timing_tracker().snapshot(),
        "thresholds": {
            "slow_s": crate::timing::SLOW_THRESHOLD.as_secs(),
            "very_slow_s": crate::timing::VERY_SLOW_THRESHOLD.as_secs(),
            "critical_s": crate::timing::CRITICAL_THRESHOLD.as_secs(),
        }
    }))
}

/// GET /api/diagnostics/circuit-breakers
pub async fn diagnostics_circuit_breakers(
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    Json(json!({
        "open_circuits": state.breaker.open_circuits(),
        "providers": state.breaker.all_status(),
    }))
}

/// GET /v1/routers/code - settings, tiers, and fallback configuration.
pub async fn code_router_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    let priors = state.code_router.priors();
    Json(json!({
        "modes": ["auto", "price", "quality", "agentic"],
        "model_strings": [
            code_router_model_string(CodeRouterMode::Auto),
            code_router_model_string(CodeRouterMode::Price),
            code_router_model_string(CodeRouterMode::Quality),
            code_router_model_string(CodeRouterMode::Agentic),
        ],
        "priors_version": priors.version,
        "tiers": priors.model_tiers,
        "fallback_model": priors.fallback_model,
        "baselines": priors.baselines,
    }))
}

#[derive(serde::Deserialize)]
pub struct CodeRouterTestRequest {
    pub prompt: String,
    #[serde(default)]
    pub mode: Option<String>,
}

/// POST /v1/routers/code/test - classification + selection without
/// performing inference.
pub async fn code_router_test(
    State(state): State<AppState>,
    Json(body): Json<CodeRouterTestRequest>,
) -> Json<serde_json::Value> {
    let mode = body
        .mode
        .as_deref()
        .map(|m| format!("router:code:{m}"))
        .and_then(|s| parse_code_router_model(&s))
        .unwrap_or(CodeRouterMode::Auto);

    let is_code = state.code_router.classifier().is_code_related(&body.prompt);
    let classification = state.code_router.classifier().classify(&body.prompt, None);
    let route = state.code_router.route(&body.prompt, mode, None);

    Json(json!({
        "is_code_related": is_code,
        "classification": classification,
        "route": route,
    }))
}

/// GET /v1/routers/general - modes and fallback configuration.
pub async fn general_router_info() -> Json<serde_json::Value> {
    Json(json!({
        "modes": ["balanced", "quality", "cost", "latency"],
        "fallback_models": {
            "balanced": fallback_model(GeneralRouterMode::Balanced),
            "quality": fallback_model(GeneralRouterMode::Quality),
            "cost": fallback_model(GeneralRouterMode::Cost),
            "latency": fallback_model(GeneralRouterMode::Latency),
        },
    }))
}

#[derive(serde::Deserialize)]
pub struct GeneralRouterTestRequest {
    #[serde(default)]
    pub messages: Vec<gatewayz_models_sdk::models::Message>,
    #[serde(default)]
    pub mode: Option<String>,
}

/// POST /v1/routers/general/test - selection dry-run without inference.
pub async fn general_router_test(
    State(state): State<AppState>,
    Json(body): Json<GeneralRouterTestRequest>,
) -> Json<serde_json::Value> {
    let mode = body
        .mode
        .as_deref()
        .map(|m| format!("router:general:{m}"))
        .and_then(|s| parse_general_router_model(&s))
        .unwrap_or(GeneralRouterMode::Balanced);

    let available: HashSet<String> = state
        .catalog
        .get_all_models()
        .await
        .into_iter()
        .map(|m| m.id)
        .collect();
    let candidates: Vec<String> = available.iter().take(128).cloned().collect();
    let route = state
        .general_router
        .route(&body.messages, mode, &candidates, &available)
        .await;

    Json(json!({ "route": route }))
}
