//! # Gateway Configuration
//!
//! TOML-backed configuration with environment-variable overrides and schema
//! validation. Every tunable named elsewhere in the crate - admission gate
//! bounds, behavioral rate limits, trial cache TTLs, catalog fan-out
//! settings, pricing defaults - resolves here.
//!
//! ## Example
//!
//! ```rust
//! use gatewayz_gateway::config::Config;
//!
//! let config = Config::load("config.toml")?;
//! config.validate()?;
//! ```

use gatewayz_models_sdk::common::duration_serde;
use gatewayz_models_sdk::providers::ProviderConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

/// Main configuration for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub catalog: CatalogSettings,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub routing: RoutingSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Runtime inference providers by slug
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    /// Catalog fetcher API keys by gateway slug
    #[serde(default)]
    pub gateway_keys: HashMap<String, String>,
    /// Deployment environment: "live", "test", "staging", "development"
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Redis URL for distributed rate limiting (in-process fallback if unset)
    #[serde(default)]
    pub redis_url: Option<String>,
}

fn default_environment() -> String {
    "live".to_string()
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            timeout: Duration::from_secs(120),
        }
    }
}

/// Global concurrency gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Requests processed concurrently
    pub limit: usize,
    /// Requests allowed to wait for a slot
    pub queue_size: usize,
    /// Maximum time a queued request waits
    #[serde(with = "duration_serde")]
    pub queue_timeout: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            limit: 20,
            queue_size: 50,
            queue_timeout: Duration::from_secs(10),
        }
    }
}

/// Behavioral rate limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub enabled: bool,
    /// Requests per minute for residential/business IPs
    pub residential_limit: u32,
    /// Requests per minute for datacenter-shaped IPs
    pub datacenter_limit: u32,
    /// Requests per minute per behavioral fingerprint across all IPs
    pub fingerprint_limit: u32,
    /// Keywords marking datacenter ASNs/reverse DNS
    pub datacenter_keywords: Vec<String>,
    #[serde(default)]
    pub velocity: VelocityConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            residential_limit: 300,
            datacenter_limit: 60,
            fingerprint_limit: 100,
            datacenter_keywords: [
                "aws", "amazon", "google", "digitalocean", "azure", "ovh", "linode", "proxy",
                "vpn",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            velocity: VelocityConfig::default(),
        }
    }
}

/// Velocity-mode (error-spike shield) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VelocityConfig {
    /// Rolling window the error ratio is computed over
    #[serde(with = "duration_serde")]
    pub window: Duration,
    /// System-error share of traffic that engages velocity mode
    pub error_ratio: f64,
    /// Minimum outcomes in the window before engaging
    pub min_requests: usize,
    /// How long velocity mode stays engaged
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Limit multiplier while engaged
    pub multiplier: f64,
}

impl Default for VelocityConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            error_ratio: 0.25,
            min_requests: 100,
            duration: Duration::from_secs(180),
            multiplier: 0.5,
        }
    }
}

/// Authorization and trial-validation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub enabled: bool,
    /// User/plan cache TTL (plan changes are rare)
    #[serde(with = "duration_serde")]
    pub plan_cache_ttl: Duration,
    /// Trial cache TTL while the trial is active
    #[serde(with = "duration_serde")]
    pub trial_cache_ttl: Duration,
    /// Trial cache TTL once expired/invalid (expired keys are bot traffic)
    #[serde(with = "duration_serde")]
    pub trial_cache_ttl_invalid: Duration,
    /// API-key lookup retry attempts for transient store errors
    pub api_key_lookup_retries: u32,
    /// Linear backoff step between lookup retries
    #[serde(with = "duration_serde")]
    pub api_key_lookup_backoff: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            plan_cache_ttl: Duration::from_secs(30),
            trial_cache_ttl: Duration::from_secs(60),
            trial_cache_ttl_invalid: Duration::from_secs(3600),
            api_key_lookup_retries: 3,
            api_key_lookup_backoff: Duration::from_millis(100),
        }
    }
}

/// Catalog fan-out and caching settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSettings {
    #[serde(with = "duration_serde")]
    pub ttl: Duration,
    #[serde(with = "duration_serde")]
    pub stale_ttl: Duration,
    pub fetch_workers: usize,
    pub refresh_workers: usize,
    #[serde(with = "duration_serde")]
    pub per_provider_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub overall_timeout: Duration,
    /// Entries in the catalog response cache (keyed by request fingerprint)
    pub response_cache_size: usize,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            stale_ttl: Duration::from_secs(7200),
            fetch_workers: 12,
            refresh_workers: 4,
            per_provider_timeout: Duration::from_secs(15),
            overall_timeout: Duration::from_secs(30),
            response_cache_size: 256,
        }
    }
}

/// Pricing and credit pre-check settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Output-token bound assumed when a request omits max_tokens
    pub default_max_output_tokens: u32,
    /// Flat per-token rate for trial charges when no model pricing exists
    pub trial_fallback_rate: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            default_max_output_tokens: 4096,
            trial_fallback_rate: 0.00002,
        }
    }
}

/// Provider routing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSettings {
    /// Default aggregator used when a model is not in the registry
    pub default_provider: String,
    /// Candidate ordering: "cost" or "latency"
    pub policy: String,
    /// External selector service for the general router; disabled when unset
    #[serde(default)]
    pub selector_url: Option<String>,
    #[serde(default)]
    pub selector_api_key: Option<String>,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            default_provider: "openrouter".to_string(),
            policy: "cost".to_string(),
            selector_url: None,
            selector_api_key: None,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = env::var("GATEWAY_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = env::var("GATEWAY_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(environment) = env::var("GATEWAY_ENVIRONMENT") {
            self.environment = environment;
        }
        if let Ok(url) = env::var("REDIS_URL") {
            self.redis_url = Some(url);
        }
        // Gateway fetcher keys: GATEWAY_KEY_<SLUG> (dashes as underscores)
        for (key, value) in env::vars() {
            if let Some(slug) = key.strip_prefix("GATEWAY_KEY_") {
                let slug = slug.to_lowercase().replace('_', "-");
                self.gateway_keys.entry(slug).or_insert(value);
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.host.is_empty() {
            anyhow::bail!("server host cannot be empty");
        }
        if self.server.port == 0 {
            anyhow::bail!("server port must be between 1 and 65535");
        }
        if self.admission.limit == 0 {
            anyhow::bail!("admission limit must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.security.velocity.error_ratio) {
            anyhow::bail!("velocity error_ratio must be between 0.0 and 1.0");
        }
        if self.security.velocity.multiplier <= 0.0 || self.security.velocity.multiplier > 1.0 {
            anyhow::bail!("velocity multiplier must be in (0.0, 1.0]");
        }
        if self.catalog.stale_ttl < self.catalog.ttl {
            anyhow::bail!("catalog stale_ttl must be at least ttl");
        }
        if self.pricing.default_max_output_tokens == 0 {
            anyhow::bail!("default_max_output_tokens must be at least 1");
        }
        for (name, provider) in &self.providers {
            if provider.api_key.is_empty() {
                anyhow::bail!("provider {name} has an empty api_key");
            }
            if let Some(base_url) = &provider.base_url {
                if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                    anyhow::bail!("invalid base URL for provider {name}: {base_url}");
                }
            }
        }
        Ok(())
    }

    /// Non-live environments run with halved entitlements.
    pub fn is_live(&self) -> bool {
        !matches!(
            self.environment.as_str(),
            "test" | "staging" | "development"
        )
    }

    pub fn entitlement_multiplier(&self) -> f64 {
        if self.is_live() {
            1.0
        } else {
            0.5
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.admission.limit, 20);
        assert_eq!(config.admission.queue_size, 50);
        assert_eq!(config.security.residential_limit, 300);
        assert_eq!(config.security.datacenter_limit, 60);
        assert_eq!(config.security.fingerprint_limit, 100);
    }

    #[test]
    fn test_environment_multiplier() {
        let mut config = Config::default();
        assert!(config.is_live());
        assert_eq!(config.entitlement_multiplier(), 1.0);

        config.environment = "staging".to_string();
        assert!(!config.is_live());
        assert_eq!(config.entitlement_multiplier(), 0.5);
    }

    #[test]
    fn test_toml_round_trip() {
        let toml_src = r#"
            environment = "test"

            [server]
            host = "127.0.0.1"
            port = 9090
            timeout = "60s"

            [admission]
            limit = 5
            queue_size = 10
            queue_timeout = "2s"
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.admission.limit, 5);
        assert_eq!(config.admission.queue_timeout, Duration::from_secs(2));
        // Unspecified sections fall back to defaults
        assert_eq!(config.security.fingerprint_limit, 100);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.admission.limit = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.security.velocity.multiplier = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.catalog.stale_ttl = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }
}
