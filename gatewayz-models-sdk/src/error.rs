//! # Error Types
//!
//! Standardized error types for provider interactions and client-level
//! operations, plus the failure classification used by the circuit breakers
//! and the catalog aggregator.
//!
//! ## Failure classification
//!
//! Every provider failure collapses into one of six categories:
//! `timeout`, `connection_error`, `rate_limited`, `auth_failure`,
//! `server_error`, `unknown`. The category drives metrics labels, circuit
//! breaker accounting, and the transient-vs-permanent retry decision in the
//! failover router: timeouts, connection errors, 5xx, and rate limits are
//! retryable on another provider; auth failures and other 4xx are not.

use std::time::Duration;
use thiserror::Error;

/// Provider-specific API and communication errors.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// HTTP client and network communication errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider API error with status code and message
    #[error("API error: {code} - {message}")]
    Api { code: u16, message: String },

    /// Invalid or missing API key
    #[error("Invalid API key")]
    InvalidApiKey,

    /// Requested model not found or unsupported
    #[error("Model not found: {model}")]
    ModelNotFound { model: String },

    /// Rate limit exceeded; carries the upstream Retry-After when present
    #[error("Rate limit exceeded")]
    RateLimited { retry_after: Option<Duration> },

    /// Account quota exceeded; not retryable, cached with its own backoff
    #[error("Quota exceeded")]
    QuotaExceeded,

    /// Provider service temporarily unavailable
    #[error("Service unavailable")]
    ServiceUnavailable,

    /// Request timeout
    #[error("Timeout")]
    Timeout,

    /// JSON serialization and deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Response body did not match the expected shape
    #[error("Invalid response format")]
    InvalidResponse,

    /// Invalid or missing provider configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Unsupported provider slug
    #[error("Provider not supported: {provider}")]
    ProviderNotSupported { provider: String },
}

impl ProviderError {
    /// Classify this error for metrics and circuit-breaker accounting.
    pub fn category(&self) -> FailureCategory {
        match self {
            ProviderError::Timeout => FailureCategory::Timeout,
            ProviderError::Http(e) => {
                if e.is_timeout() {
                    FailureCategory::Timeout
                } else if e.is_connect() {
                    FailureCategory::ConnectionError
                } else {
                    FailureCategory::Unknown
                }
            }
            ProviderError::RateLimited { .. } | ProviderError::QuotaExceeded => {
                FailureCategory::RateLimited
            }
            ProviderError::InvalidApiKey => FailureCategory::AuthFailure,
            ProviderError::ServiceUnavailable => FailureCategory::ServerError,
            ProviderError::Api { code, .. } => match code {
                401 | 403 => FailureCategory::AuthFailure,
                429 => FailureCategory::RateLimited,
                500..=599 => FailureCategory::ServerError,
                _ => FailureCategory::Unknown,
            },
            _ => FailureCategory::Unknown,
        }
    }

    /// Whether trying another provider makes sense for this failure.
    ///
    /// Auth failures and non-429 4xx errors abort failover; everything
    /// availability-shaped advances to the next candidate.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category(),
            FailureCategory::Timeout
                | FailureCategory::ConnectionError
                | FailureCategory::RateLimited
                | FailureCategory::ServerError
        ) && !matches!(self, ProviderError::QuotaExceeded)
    }

    /// Retry-After carried by the upstream response, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Coarse failure category used for logs, metrics, and breaker decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCategory {
    Timeout,
    ConnectionError,
    RateLimited,
    AuthFailure,
    ServerError,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Timeout => "timeout",
            FailureCategory::ConnectionError => "connection_error",
            FailureCategory::RateLimited => "rate_limited",
            FailureCategory::AuthFailure => "auth_failure",
            FailureCategory::ServerError => "server_error",
            FailureCategory::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// High-level client operation errors.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Wrapped provider-specific errors
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Provider routing and selection errors
    #[error("Routing error: {message}")]
    Routing { message: String },

    /// Cache operation failures
    #[error("Cache error: {message}")]
    Cache { message: String },

    /// Invalid or missing configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// All failover candidates exhausted
    #[error("All providers failed for model {model}: {last_error}")]
    AllProvidersFailed { model: String, last_error: String },
}
