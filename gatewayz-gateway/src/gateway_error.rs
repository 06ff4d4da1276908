//! # Gateway Error Taxonomy and Response Envelope
//!
//! Every error the gateway returns is structured JSON:
//!
//! ```json
//! { "error": { "status": 402, "code": "insufficient_credits",
//!              "message": "…", "type": "billing_error",
//!              "request_id": "…", "details": { … } } }
//! ```
//!
//! The HTTP status code always equals `error.status`. Rate-limit kinds add
//! `X-RateLimit-*` and `Retry-After` headers; server overload carries
//! `Retry-After: 5`.
//!
//! Authorization and budget failures are produced before any provider call;
//! provider failures are classified upstream and arrive here as
//! `ProviderError`/`ProviderUnavailable`; accounting failures after a
//! successful provider call surface as `internal_error` with the failed
//! operation named.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Machine-readable rate-limit kind carried in the error `type` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitKind {
    /// Per-key or per-user rate limiting
    RateLimited,
    /// IP-tier behavioral limit
    SecurityLimit,
    /// Fingerprint or velocity-mode behavioral limit
    BehavioralLimit,
}

impl RateLimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitKind::RateLimited => "rate_limited",
            RateLimitKind::SecurityLimit => "security_limit",
            RateLimitKind::BehavioralLimit => "behavioral_limit",
        }
    }
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("{message}")]
    InvalidApiKey { message: String },

    #[error("Trial has expired. Please upgrade to a paid plan to continue using the API.")]
    TrialExpired,

    #[error("{message}")]
    TrialLimitExceeded { message: String },

    #[error("Insufficient credits for this request")]
    InsufficientCredits {
        max_cost: f64,
        max_output_tokens: u32,
        input_tokens: u32,
    },

    #[error("{message}")]
    RateLimited {
        message: String,
        kind: RateLimitKind,
        limit: u32,
        retry_after_secs: u64,
    },

    #[error("Server at capacity, please retry")]
    ServerOverload,

    #[error("Provider {provider} failed for model {model}")]
    Provider {
        provider: String,
        model: String,
        provider_message: String,
    },

    #[error("Provider {provider} is currently unavailable")]
    ProviderUnavailable { provider: String },

    #[error("Model not found: {model}")]
    ModelNotFound {
        model: String,
        suggestions: Vec<String>,
    },

    #[error("{message}")]
    Validation { message: String },

    #[error("Internal error during {operation}")]
    Internal { operation: String, message: String },
}

impl GatewayError {
    pub fn internal(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Internal {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidApiKey { .. } => StatusCode::UNAUTHORIZED,
            GatewayError::TrialExpired | GatewayError::TrialLimitExceeded { .. } => {
                StatusCode::FORBIDDEN
            }
            GatewayError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::ServerOverload | GatewayError::ProviderUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Provider { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::Validation { .. } => StatusCode::BAD_REQUEST,
            GatewayError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidApiKey { .. } => "invalid_api_key",
            GatewayError::TrialExpired => "trial_expired",
            GatewayError::TrialLimitExceeded { .. } => "trial_limit_exceeded",
            GatewayError::InsufficientCredits { .. } => "insufficient_credits",
            GatewayError::RateLimited { kind, .. } => kind.as_str(),
            GatewayError::ServerOverload => "server_overload",
            GatewayError::Provider { .. } => "provider_error",
            GatewayError::ProviderUnavailable { .. } => "provider_unavailable",
            GatewayError::ModelNotFound { .. } => "model_not_found",
            GatewayError::Validation { .. } => "validation_error",
            GatewayError::Internal { .. } => "internal_error",
        }
    }

    /// Taxonomy tag grouping related codes.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::InvalidApiKey { .. } => "authentication_error",
            GatewayError::TrialExpired | GatewayError::TrialLimitExceeded { .. } => {
                "trial_error"
            }
            GatewayError::InsufficientCredits { .. } => "billing_error",
            GatewayError::RateLimited { kind, .. } => kind.as_str(),
            GatewayError::ServerOverload => "server_overload",
            GatewayError::Provider { .. } | GatewayError::ProviderUnavailable { .. } => {
                "upstream_error"
            }
            GatewayError::ModelNotFound { .. } | GatewayError::Validation { .. } => {
                "invalid_request"
            }
            GatewayError::Internal { .. } => "internal_error",
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            GatewayError::InsufficientCredits {
                max_cost,
                max_output_tokens,
                input_tokens,
            } => Some(json!({
                "max_cost": max_cost,
                "max_output_tokens": max_output_tokens,
                "input_tokens": input_tokens,
            })),
            GatewayError::Provider {
                provider,
                model,
                provider_message,
            } => Some(json!({
                "provider": provider,
                "model": model,
                "provider_message": provider_message,
            })),
            GatewayError::ProviderUnavailable { provider } => {
                Some(json!({ "provider": provider }))
            }
            GatewayError::ModelNotFound { suggestions, .. } if !suggestions.is_empty() => {
                Some(json!({ "suggestions": suggestions }))
            }
            GatewayError::Internal { operation, .. } => {
                Some(json!({ "operation": operation }))
            }
            GatewayError::RateLimited {
                limit,
                retry_after_secs,
                ..
            } => Some(json!({
                "limit_per_minute": limit,
                "retry_after": retry_after_secs,
            })),
            _ => None,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let request_id = Uuid::new_v4().to_string();

        let mut error = json!({
            "status": status.as_u16(),
            "code": self.code(),
            "message": self.to_string(),
            "type": self.error_type(),
            "request_id": request_id,
        });
        if let Some(details) = self.details() {
            error["details"] = details;
        }

        let mut response = (status, Json(json!({ "error": error }))).into_response();

        match &self {
            GatewayError::ServerOverload => {
                response
                    .headers_mut()
                    .insert("Retry-After", HeaderValue::from_static("5"));
            }
            GatewayError::RateLimited {
                limit,
                retry_after_secs,
                ..
            } => {
                let headers = response.headers_mut();
                if let Ok(v) = HeaderValue::from_str(&limit.to_string()) {
                    headers.insert("X-RateLimit-Limit", v);
                }
                headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
                if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    headers.insert("Retry-After", v);
                }
            }
            _ => {}
        }

        response
    }
}

impl From<gatewayz_models_sdk::ClientError> for GatewayError {
    fn from(err: gatewayz_models_sdk::ClientError) -> Self {
        use gatewayz_models_sdk::ClientError;
        match err {
            ClientError::Provider(e) => GatewayError::from(e),
            ClientError::AllProvidersFailed { model, last_error } => GatewayError::Provider {
                provider: "all".to_string(),
                model,
                provider_message: last_error,
            },
            other => GatewayError::internal("provider_routing", other.to_string()),
        }
    }
}

impl From<gatewayz_models_sdk::ProviderError> for GatewayError {
    fn from(err: gatewayz_models_sdk::ProviderError) -> Self {
        use gatewayz_models_sdk::ProviderError;
        match &err {
            ProviderError::ModelNotFound { model } => GatewayError::ModelNotFound {
                model: model.clone(),
                suggestions: Vec::new(),
            },
            ProviderError::ServiceUnavailable => GatewayError::ProviderUnavailable {
                provider: "upstream".to_string(),
            },
            _ => GatewayError::Provider {
                provider: "upstream".to_string(),
                model: String::new(),
                provider_message: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::InvalidApiKey {
                message: "bad key".into()
            }
            .status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(GatewayError::TrialExpired.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            GatewayError::InsufficientCredits {
                max_cost: 0.001025,
                max_output_tokens: 100,
                input_tokens: 10
            }
            .status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            GatewayError::ServerOverload.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_insufficient_credits_details() {
        let err = GatewayError::InsufficientCredits {
            max_cost: 0.001025,
            max_output_tokens: 100,
            input_tokens: 10,
        };
        let details = err.details().unwrap();
        assert_eq!(details["max_cost"], 0.001025);
        assert_eq!(details["max_output_tokens"], 100);
        assert_eq!(details["input_tokens"], 10);
        assert_eq!(err.code(), "insufficient_credits");
    }

    #[test]
    fn test_rate_limit_codes() {
        let err = GatewayError::RateLimited {
            message: "too many requests".into(),
            kind: RateLimitKind::BehavioralLimit,
            limit: 100,
            retry_after_secs: 60,
        };
        assert_eq!(err.code(), "behavioral_limit");
        assert_eq!(err.error_type(), "behavioral_limit");
    }

    #[tokio::test]
    async fn test_envelope_shape() {
        let err = GatewayError::Internal {
            operation: "credit_deduction".into(),
            message: "store write failed".into(),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["status"], 500);
        assert_eq!(body["error"]["code"], "internal_error");
        assert_eq!(body["error"]["details"]["operation"], "credit_deduction");
        assert!(body["error"]["request_id"].is_string());
    }

    #[tokio::test]
    async fn test_overload_carries_retry_after() {
        let response = GatewayError::ServerOverload.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["Retry-After"], "5");
    }
}
