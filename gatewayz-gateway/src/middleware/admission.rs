//! # Admission Gate
//!
//! Global concurrency limiter in front of the application handler. A single
//! gate instance exists per process:
//!
//! - a free slot is acquired immediately;
//! - with all slots busy and the wait queue full, the request is rejected
//!   at once with 503 `server_overload` and `Retry-After: 5`;
//! - otherwise the request waits up to `queue_timeout` for a slot and is
//!   rejected the same way on timeout.
//!
//! Monitoring paths (`/health`, `/metrics`, `/ready`, plus prefix matches)
//! bypass the gate so probes keep working under overload. The permit is an
//! RAII guard, so the slot and the active gauge are released exactly once
//! on every exit path, including handler panics.

use crate::config::AdmissionConfig;
use crate::gateway_error::GatewayError;
use crate::metrics::metrics;
use crate::server::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Paths exempt from concurrency control; prefixes also match so
/// `/health/detailed` stays reachable.
pub const EXEMPT_PATHS: &[&str] = &["/health", "/metrics", "/ready"];

pub fn is_exempt(path: &str) -> bool {
    EXEMPT_PATHS
        .iter()
        .any(|p| path == *p || path.starts_with(&format!("{p}/")))
}

/// Why a request was rejected at the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionRejection {
    QueueFull,
    QueueTimeout,
}

impl AdmissionRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionRejection::QueueFull => "queue_full",
            AdmissionRejection::QueueTimeout => "queue_timeout",
        }
    }
}

/// RAII slot: releasing the semaphore and decrementing the active gauge
/// happen on drop, no matter how the handler exits.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        metrics().dec_active();
    }
}

pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    limit: usize,
    queue_size: usize,
    queue_timeout: Duration,
    waiting: AtomicUsize,
}

impl AdmissionGate {
    pub fn new(config: &AdmissionConfig) -> Self {
        tracing::info!(
            limit = config.limit,
            queue_size = config.queue_size,
            queue_timeout_s = config.queue_timeout.as_secs_f64(),
            "admission gate initialized"
        );
        Self {
            semaphore: Arc::new(Semaphore::new(config.limit)),
            limit: config.limit,
            queue_size: config.queue_size,
            queue_timeout: config.queue_timeout,
            waiting: AtomicUsize::new(0),
        }
    }

    /// Admit one request, waiting in the bounded queue if necessary.
    pub async fn admit(&self) -> Result<AdmissionPermit, AdmissionRejection> {
        // Fast path: free slot
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            metrics().inc_active();
            return Ok(AdmissionPermit { _permit: permit });
        }

        if self.waiting.load(Ordering::Acquire) >= self.queue_size {
            metrics().inc_rejected(AdmissionRejection::QueueFull.reason());
            return Err(AdmissionRejection::QueueFull);
        }

        self.waiting.fetch_add(1, Ordering::AcqRel);
        metrics().inc_queued();

        let acquired = tokio::time::timeout(
            self.queue_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await;

        self.waiting.fetch_sub(1, Ordering::AcqRel);
        metrics().dec_queued();

        match acquired {
            Ok(Ok(permit)) => {
                metrics().inc_active();
                Ok(AdmissionPermit { _permit: permit })
            }
            Ok(Err(_closed)) => {
                metrics().inc_rejected(AdmissionRejection::QueueTimeout.reason());
                Err(AdmissionRejection::QueueTimeout)
            }
            Err(_elapsed) => {
                metrics().inc_rejected(AdmissionRejection::QueueTimeout.reason());
                Err(AdmissionRejection::QueueTimeout)
            }
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    /// Active slots as a share of the limit.
    pub fn utilization(&self) -> f64 {
        let available = self.semaphore.available_permits();
        (self.limit.saturating_sub(available)) as f64 / self.limit as f64
    }
}

pub async fn admission_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if is_exempt(path) {
        return next.run(req).await;
    }

    match state.admission.admit().await {
        Ok(permit) => {
            let response = next.run(req).await;
            drop(permit);
            response
        }
        Err(rejection) => {
            tracing::warn!(
                method = %req.method(),
                path = %req.uri().path(),
                reason = rejection.reason(),
                waiting = state.admission.waiting(),
                "admission gate rejected request"
            );
            GatewayError::ServerOverload.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(limit: usize, queue_size: usize, queue_timeout: Duration) -> AdmissionGate {
        AdmissionGate::new(&AdmissionConfig {
            limit,
            queue_size,
            queue_timeout,
        })
    }

    #[test]
    fn test_exempt_paths() {
        assert!(is_exempt("/health"));
        assert!(is_exempt("/health/detailed"));
        assert!(is_exempt("/metrics"));
        assert!(is_exempt("/ready"));
        assert!(!is_exempt("/v1/chat/completions"));
        assert!(!is_exempt("/healthz"));
    }

    #[tokio::test]
    async fn test_zero_queue_rejects_second_request_immediately() {
        let gate = gate(1, 0, Duration::from_secs(10));

        let held = gate.admit().await.unwrap();
        let rejected = gate.admit().await.unwrap_err();
        assert_eq!(rejected, AdmissionRejection::QueueFull);

        drop(held);
        assert!(gate.admit().await.is_ok());
    }

    #[tokio::test]
    async fn test_zero_timeout_rejects_when_no_slot() {
        let gate = gate(1, 5, Duration::ZERO);

        let _held = gate.admit().await.unwrap();
        let rejected = gate.admit().await.unwrap_err();
        assert_eq!(rejected, AdmissionRejection::QueueTimeout);
    }

    #[tokio::test]
    async fn test_queued_request_proceeds_when_slot_frees() {
        let gate = Arc::new(gate(1, 5, Duration::from_secs(5)));

        let held = gate.admit().await.unwrap();
        let gate2 = Arc::clone(&gate);
        let waiter = tokio::spawn(async move { gate2.admit().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        let permit = waiter.await.unwrap();
        assert!(permit.is_ok());
    }

    #[tokio::test]
    async fn test_slots_conserved_across_completions() {
        let gate = Arc::new(gate(3, 10, Duration::from_secs(1)));

        for _ in 0..5 {
            let mut permits = Vec::new();
            for _ in 0..3 {
                permits.push(gate.admit().await.unwrap());
            }
            permits.clear();
        }

        // All slots free again: three immediate admissions succeed
        let a = gate.admit().await.unwrap();
        let b = gate.admit().await.unwrap();
        let c = gate.admit().await.unwrap();
        assert_eq!(gate.utilization(), 1.0);
        drop((a, b, c));
        assert_eq!(gate.utilization(), 0.0);
    }
}
