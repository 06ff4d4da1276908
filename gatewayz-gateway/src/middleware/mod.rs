//! # HTTP Middleware
//!
//! The request path layers, outermost first:
//!
//! 1. **Admission gate** - global concurrency limiting with a bounded
//!    overflow queue ([`admission`]).
//! 2. **Behavioral rate limiter** - tiered IP/fingerprint limits and the
//!    velocity-mode error shield ([`security`]).
//! 3. **Logging** - request/response lines with latency and request id.
//! 4. **Metrics** - status-class counters for `/metrics`.
//!
//! Authentication is not a layer here: the inference handler resolves the
//! API key itself because authorization outcomes (trial vs paid) shape the
//! whole pipeline, not just admission.

use crate::metrics::metrics;
use crate::server::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use std::time::Instant;

pub mod admission;
pub mod security;

pub use admission::{admission_middleware, AdmissionGate};
pub use security::{security_middleware, RateLimitStore, SecurityLimiter};

/// Request/response logging with latency and a per-request id.
pub async fn logging_middleware(
    State(_state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let request_id = uuid::Uuid::new_v4().to_string();

    req.extensions_mut().insert(RequestId(request_id.clone()));

    let response = next.run(req).await;

    tracing::info!(
        request_id = %request_id,
        method = %method,
        uri = %uri,
        status = %response.status(),
        latency_ms = start.elapsed().as_millis() as u64,
        "request processed"
    );

    response
}

/// Per-request id injected into extensions by the logging middleware.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Coarse request accounting for the Prometheus endpoint. Monitoring
/// endpoints are excluded so scrapes do not count themselves.
pub async fn metrics_middleware(
    State(_state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    let response = next.run(req).await;

    let skip = path.starts_with("/metrics") || path.starts_with("/health") || path == "/ready";
    if !skip {
        metrics().record_request(response.status().as_u16());
    }

    response
}
