//! # Authorization, Trial Validation, and Entitlements
//!
//! Resolves a gateway-issued API key into an authorized context before any
//! provider work happens:
//!
//! 1. **User lookup** with a 30 s cache (plan changes are rare) and bounded
//!    retry for transient store errors. The special keys
//!    `local-dev-bypass-key` and `anonymous` are never looked up.
//! 2. **Trial validation** with asymmetric cache TTLs: 60 s while a trial
//!    is active, a full hour once it is expired or invalid - expired keys
//!    are overwhelmingly bot traffic and the long TTL keeps them off the
//!    store.
//! 3. **Paid-path forcing**: a record flagged `is_trial` that also carries
//!    an active subscription (or a pro/max/admin tier) is treated as paid.
//! 4. **Entitlements**: per-tier daily/monthly caps, halved outside live
//!    environments, with a 25 000 daily-token floor in live and effectively
//!    unlimited caps for admins.

use crate::config::{AuthConfig, Config};
use crate::gateway_error::GatewayError;
use crate::metrics::metrics;
use crate::storage::{Plan, Storage, StorageError, TrialRecord, User};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Keys that bypass the store entirely.
pub const SPECIAL_KEYS: &[&str] = &["local-dev-bypass-key", "anonymous"];

/// Daily-token floor applied in live environments.
const LIVE_DAILY_TOKEN_FLOOR: u64 = 25_000;

/// Authorized request context produced by [`AuthService::authorize`].
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub api_key: String,
    pub user: User,
    /// Trial record when the key is on the trial path; `None` means paid
    pub trial: Option<TrialRecord>,
    pub plan: Option<Plan>,
}

impl AuthContext {
    /// Whether charges go through trial tracking rather than credits.
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }
}

/// Effective per-tier limits after environment adjustment.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct EffectiveLimits {
    pub daily_requests: u64,
    pub monthly_requests: u64,
    pub daily_tokens: u64,
    pub monthly_tokens: u64,
    pub unlimited: bool,
}

struct Cached<T> {
    value: T,
    at: Instant,
}

impl<T: Clone> Cached<T> {
    fn fresh(&self, ttl: Duration) -> Option<T> {
        (self.at.elapsed() < ttl).then(|| self.value.clone())
    }
}

pub struct AuthService {
    storage: Arc<dyn Storage>,
    config: AuthConfig,
    is_live: bool,
    entitlement_multiplier: f64,
    user_cache: DashMap<String, Cached<Option<User>>>,
    plan_cache: DashMap<i64, Cached<Option<Plan>>>,
    trial_cache: DashMap<String, Cached<TrialValidation>>,
}

/// Cached outcome of a trial validation.
#[derive(Debug, Clone)]
pub struct TrialValidation {
    pub is_valid: bool,
    pub is_trial: bool,
    pub is_expired: bool,
    pub error: Option<String>,
    pub record: Option<TrialRecord>,
}

impl TrialValidation {
    fn paid() -> Self {
        Self {
            is_valid: true,
            is_trial: false,
            is_expired: false,
            error: None,
            record: None,
        }
    }
}

impl AuthService {
    pub fn new(storage: Arc<dyn Storage>, config: &Config) -> Self {
        Self {
            storage,
            config: config.auth.clone(),
            is_live: config.is_live(),
            entitlement_multiplier: config.entitlement_multiplier(),
            user_cache: DashMap::new(),
            plan_cache: DashMap::new(),
            trial_cache: DashMap::new(),
        }
    }

    /// Pull the API key out of an Authorization header value.
    pub fn extract_api_key(header: Option<&str>) -> Option<String> {
        let header = header?.trim();
        let key = header.strip_prefix("Bearer ").unwrap_or(header).trim();
        (!key.is_empty()).then(|| key.to_string())
    }

    /// Full authorization pipeline for one request.
    pub async fn authorize(&self, api_key: &str) -> Result<AuthContext, GatewayError> {
        let user = self
            .user_for_key(api_key)
            .await?
            .ok_or_else(|| GatewayError::InvalidApiKey {
                message: "Access forbidden. Your API key may be invalid or expired.".to_string(),
            })?;

        let plan = self.plan_for_user(user.id).await;

        // Admin tier bypasses trial checks entirely
        let is_admin =
            user.tier == "admin" || plan.as_ref().map(|p| p.is_admin).unwrap_or(false);
        if is_admin {
            return Ok(AuthContext {
                api_key: api_key.to_string(),
                user,
                trial: None,
                plan,
            });
        }

        let validation = self.validate_trial(api_key, &user).await;
        if !validation.is_valid {
            let message = validation
                .error
                .unwrap_or_else(|| "Trial access denied.".to_string());
            return Err(if validation.is_expired {
                GatewayError::TrialExpired
            } else if validation.is_trial {
                GatewayError::TrialLimitExceeded { message }
            } else {
                GatewayError::InvalidApiKey { message }
            });
        }

        Ok(AuthContext {
            api_key: api_key.to_string(),
            user,
            trial: validation.record.filter(|_| validation.is_trial),
            plan,
        })
    }

    async fn user_for_key(&self, api_key: &str) -> Result<Option<User>, GatewayError> {
        if let Some(entry) = self.user_cache.get(api_key) {
            if let Some(user) = entry.fresh(self.config.plan_cache_ttl) {
                return Ok(user);
            }
        }

        let user = self
            .storage
            .user_by_api_key(api_key)
            .await
            .map_err(|e| GatewayError::internal("user_lookup", e.to_string()))?;
        self.user_cache.insert(
            api_key.to_string(),
            Cached {
                value: user.clone(),
                at: Instant::now(),
            },
        );
        Ok(user)
    }

    async fn plan_for_user(&self, user_id: i64) -> Option<Plan> {
        if let Some(entry) = self.plan_cache.get(&user_id) {
            if let Some(plan) = entry.fresh(self.config.plan_cache_ttl) {
                return plan;
            }
        }

        let plan = match self.storage.plan_for_user(user_id).await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "plan lookup failed");
                None
            }
        };
        self.plan_cache.insert(
            user_id,
            Cached {
                value: plan.clone(),
                at: Instant::now(),
            },
        );
        plan
    }

    /// Invalidate cached user/plan state after a plan change.
    pub fn invalidate_user(&self, api_key: &str, user_id: i64) {
        self.user_cache.remove(api_key);
        self.plan_cache.remove(&user_id);
        self.trial_cache.remove(api_key);
    }

    async fn validate_trial(&self, api_key: &str, user: &User) -> TrialValidation {
        if let Some(entry) = self.trial_cache.get(api_key) {
            let ttl = if entry.value.is_valid && !entry.value.is_expired {
                self.config.trial_cache_ttl
            } else {
                self.config.trial_cache_ttl_invalid
            };
            if let Some(validation) = entry.fresh(ttl) {
                return validation;
            }
        }

        let validation = self.validate_trial_uncached(api_key, user).await;
        self.trial_cache.insert(
            api_key.to_string(),
            Cached {
                value: validation.clone(),
                at: Instant::now(),
            },
        );
        validation
    }

    async fn validate_trial_uncached(&self, api_key: &str, user: &User) -> TrialValidation {
        let record = match self.storage.trial_record(api_key).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(error = %e, "trial lookup failed");
                return TrialValidation {
                    is_valid: false,
                    is_trial: false,
                    is_expired: false,
                    error: Some(format!(
                        "Access forbidden. An error occurred while validating your API key: {e}."
                    )),
                    record: None,
                };
            }
        };

        let Some(record) = record else {
            return TrialValidation::paid();
        };
        if !record.is_trial {
            return TrialValidation::paid();
        }

        // A trial flag plus an active subscription means the record is
        // stale; force the paid path
        if user.has_active_subscription() {
            tracing::warn!(
                user_id = user.id,
                "is_trial set but user has an active subscription, forcing paid path"
            );
            return TrialValidation::paid();
        }

        if record.is_expired(Utc::now()) {
            return TrialValidation {
                is_valid: false,
                is_trial: true,
                is_expired: true,
                error: Some(
                    "Trial has expired. Please upgrade to a paid plan to continue using the API."
                        .to_string(),
                ),
                record: Some(record),
            };
        }

        if record.limits_exceeded() {
            let which = if record.used_tokens >= record.max_tokens {
                "token"
            } else if record.used_requests >= record.max_requests {
                "request"
            } else {
                "credit"
            };
            return TrialValidation {
                is_valid: false,
                is_trial: true,
                is_expired: false,
                error: Some(format!(
                    "Trial {which} limit exceeded. Please upgrade to a paid plan."
                )),
                record: Some(record),
            };
        }

        TrialValidation {
            is_valid: true,
            is_trial: true,
            is_expired: false,
            error: None,
            record: Some(record),
        }
    }

    /// Invalidate the trial cache after a usage write so the next
    /// validation sees fresh counters.
    pub fn invalidate_trial(&self, api_key: &str) {
        self.trial_cache.remove(api_key);
    }

    /// API-key id lookup with bounded retry for transient store errors.
    pub async fn api_key_id_with_retry(&self, api_key: &str) -> Option<i64> {
        if api_key.is_empty() || SPECIAL_KEYS.contains(&api_key) {
            tracing::debug!("skipping lookup for special key");
            return None;
        }

        let mut last_error: Option<StorageError> = None;
        for attempt in 0..self.config.api_key_lookup_retries {
            match self.storage.api_key_id(api_key).await {
                Ok(Some(id)) => {
                    if attempt > 0 {
                        metrics().inc_api_key_lookup("retry");
                    }
                    metrics().inc_api_key_lookup("success");
                    return Some(id);
                }
                Ok(None) => {
                    // Key not in the store; retrying cannot help
                    metrics().inc_api_key_lookup("not_found");
                    return None;
                }
                Err(e) => {
                    metrics().inc_api_key_lookup("failed");
                    if attempt + 1 < self.config.api_key_lookup_retries {
                        tracing::warn!(
                            attempt = attempt + 1,
                            error = %e,
                            "API key lookup failed, retrying"
                        );
                        tokio::time::sleep(
                            self.config.api_key_lookup_backoff * (attempt + 1),
                        )
                        .await;
                    }
                    last_error = Some(e);
                }
            }
        }

        tracing::error!(
            retries = self.config.api_key_lookup_retries,
            error = %last_error.map(|e| e.to_string()).unwrap_or_default(),
            "API key lookup exhausted retries"
        );
        None
    }

    /// Effective caps for a plan after the environment adjustment.
    pub fn effective_limits(&self, plan: Option<&Plan>) -> EffectiveLimits {
        let Some(plan) = plan else {
            return self.scale(EffectiveLimits {
                daily_requests: 1_000,
                monthly_requests: 10_000,
                daily_tokens: 250_000,
                monthly_tokens: 2_500_000,
                unlimited: false,
            });
        };

        if plan.is_admin || plan.tier == "admin" {
            return EffectiveLimits {
                daily_requests: u64::MAX,
                monthly_requests: u64::MAX,
                daily_tokens: u64::MAX,
                monthly_tokens: u64::MAX,
                unlimited: true,
            };
        }

        self.scale(EffectiveLimits {
            daily_requests: plan.daily_request_cap,
            monthly_requests: plan.monthly_request_cap,
            daily_tokens: plan.daily_token_cap,
            monthly_tokens: plan.monthly_token_cap,
            unlimited: false,
        })
    }

    fn scale(&self, mut limits: EffectiveLimits) -> EffectiveLimits {
        let scale = |v: u64| (v as f64 * self.entitlement_multiplier) as u64;
        limits.daily_requests = scale(limits.daily_requests);
        limits.monthly_requests = scale(limits.monthly_requests);
        limits.daily_tokens = scale(limits.daily_tokens);
        limits.monthly_tokens = scale(limits.monthly_tokens);
        if self.is_live {
            limits.daily_tokens = limits.daily_tokens.max(LIVE_DAILY_TOKEN_FLOOR);
        }
        limits
    }
}

/// Loose shape check for gateway-issued keys, used by the behavioral rate
/// limiter to let authenticated traffic bypass IP and fingerprint limits.
pub fn looks_like_gateway_key(key: &str) -> bool {
    (key.starts_with("sk-") || key.starts_with("gw-")) && key.len() >= 20
}
