//! # Pricing and Credit Pre-Check
//!
//! Per-token cost resolution against the canonical registry plus the
//! pre-flight credit reservation that runs before any provider call:
//!
//! - prompt tokens are estimated conservatively at one token per four
//!   characters of message content;
//! - output is bounded by the requested `max_tokens` (or the configured
//!   default when omitted);
//! - `max_cost = est_prompt · prompt_price + max_output · completion_price`;
//! - a non-trial user with `credits < max_cost` is rejected with 402 before
//!   the provider is touched.
//!
//! The actual charge after a completed request uses the reported usage and
//! is therefore always `≤ max_cost` (monotone reservation). Models without
//! usable pricing can never produce a charge against a non-trial user: the
//! pre-check rejects them instead. Trial charges fall back to a flat
//! per-token rate when no model pricing exists.

use crate::config::PricingConfig;
use crate::gateway_error::GatewayError;
use crate::storage::User;
use gatewayz_models_sdk::catalog::{ModelRegistry, SelectionPolicy};
use std::sync::Arc;

/// Resolved per-token prices for one model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub prompt: f64,
    pub completion: f64,
}

/// Accepted credit reservation from the pre-flight check.
#[derive(Debug, Clone, Copy)]
pub struct CreditReservation {
    pub max_cost: f64,
    pub max_output_tokens: u32,
    pub input_tokens: u32,
}

pub struct PricingService {
    registry: Arc<ModelRegistry>,
    config: PricingConfig,
}

impl PricingService {
    pub fn new(registry: Arc<ModelRegistry>, config: PricingConfig) -> Self {
        Self { registry, config }
    }

    /// Per-token pricing for a model: the cheapest registered provider with
    /// usable pricing wins.
    pub fn model_pricing(&self, model_id: &str) -> Option<ModelPricing> {
        self.registry
            .providers_for(model_id, SelectionPolicy::Cost, None)
            .into_iter()
            .filter_map(|p| p.pricing)
            .find(|p| p.is_usable())
            .map(|p| ModelPricing {
                prompt: p.prompt.unwrap_or(0.0),
                completion: p.completion.unwrap_or(0.0),
            })
    }

    /// Conservative chars/4 prompt estimate, never below one token.
    pub fn estimate_prompt_tokens(content_chars: usize) -> u32 {
        ((content_chars / 4).max(1)) as u32
    }

    /// Exact cost of reported usage, when the model has pricing.
    pub fn cost_usd(
        &self,
        model_id: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
    ) -> Option<f64> {
        self.model_pricing(model_id).map(|p| {
            prompt_tokens as f64 * p.prompt + completion_tokens as f64 * p.completion
        })
    }

    /// Trial charge: real pricing when found, flat fallback rate otherwise.
    pub fn trial_cost(&self, model_id: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        match self.cost_usd(model_id, prompt_tokens, completion_tokens) {
            Some(cost) => cost,
            None => {
                let total = (prompt_tokens + completion_tokens) as f64;
                tracing::info!(
                    model = %model_id,
                    total_tokens = total,
                    "model not in catalog, charging trial flat rate"
                );
                total * self.config.trial_fallback_rate
            }
        }
    }

    /// Pre-flight credit check for non-trial users.
    pub fn precheck(
        &self,
        user: &User,
        model_id: &str,
        content_chars: usize,
        requested_max_tokens: Option<u32>,
    ) -> Result<CreditReservation, GatewayError> {
        let input_tokens = Self::estimate_prompt_tokens(content_chars);
        let max_output_tokens =
            requested_max_tokens.unwrap_or(self.config.default_max_output_tokens);

        let Some(pricing) = self.model_pricing(model_id) else {
            // No usable pricing means no meterable charge; reject rather
            // than let an unpriced model through the paid path.
            return Err(GatewayError::Validation {
                message: format!(
                    "model {model_id} has no usable pricing and cannot be metered"
                ),
            });
        };

        let max_cost = input_tokens as f64 * pricing.prompt
            + max_output_tokens as f64 * pricing.completion;

        if user.credits < max_cost {
            tracing::warn!(
                user_id = user.id,
                model = %model_id,
                max_cost,
                credits = user.credits,
                "insufficient credits at pre-check"
            );
            return Err(GatewayError::InsufficientCredits {
                max_cost,
                max_output_tokens,
                input_tokens,
            });
        }

        tracing::debug!(
            user_id = user.id,
            model = %model_id,
            max_cost,
            credits = user.credits,
            "credit pre-check passed"
        );
        Ok(CreditReservation {
            max_cost,
            max_output_tokens,
            input_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatewayz_models_sdk::catalog::{Architecture, ModelRecord, Pricing};

    fn registry_with_gpt4o() -> Arc<ModelRegistry> {
        let registry = Arc::new(ModelRegistry::new());
        let record = ModelRecord {
            id: "openai/gpt-4o".to_string(),
            slug: "openai/gpt-4o".to_string(),
            canonical_slug: "openai/gpt-4o".to_string(),
            name: "GPT-4o".to_string(),
            description: String::new(),
            context_length: 128000,
            architecture: Architecture::default(),
            pricing: Some(Pricing::per_token(2.5e-6, 1.0e-5)),
            supported_parameters: Vec::new(),
            default_parameters: serde_json::Value::Null,
            provider_slug: "openai".to_string(),
            provider_site_url: None,
            model_logo_url: None,
            source_gateway: "openrouter".to_string(),
            is_free: false,
            created: None,
        };
        registry.register_canonical_records("openrouter", &[record]);
        registry
    }

    fn user_with_credits(credits: f64) -> User {
        User {
            id: 1,
            api_key_id: 10,
            credits,
            tier: "free".to_string(),
            stripe_subscription_id: None,
            subscription_status: None,
        }
    }

    fn service() -> PricingService {
        PricingService::new(registry_with_gpt4o(), PricingConfig::default())
    }

    #[test]
    fn test_precheck_reservation_math() {
        // 10 prompt tokens (40 chars), max 100 output, prompt $2.50/M,
        // completion $10/M: max_cost = 0.000025 + 0.001 = 0.001025
        let service = service();
        let user = user_with_credits(10.0);

        let reservation = service
            .precheck(&user, "openai/gpt-4o", 40, Some(100))
            .unwrap();
        assert_eq!(reservation.input_tokens, 10);
        assert_eq!(reservation.max_output_tokens, 100);
        assert!((reservation.max_cost - 0.001025).abs() < 1e-12);
    }

    #[test]
    fn test_precheck_rejects_insufficient_credits() {
        let service = service();
        let user = user_with_credits(0.0005);

        let err = service
            .precheck(&user, "openai/gpt-4o", 40, Some(100))
            .unwrap_err();
        match err {
            GatewayError::InsufficientCredits {
                max_cost,
                max_output_tokens,
                input_tokens,
            } => {
                assert!((max_cost - 0.001025).abs() < 1e-12);
                assert_eq!(max_output_tokens, 100);
                assert_eq!(input_tokens, 10);
            }
            other => panic!("expected InsufficientCredits, got {other:?}"),
        }
    }

    #[test]
    fn test_actual_cost_within_reservation() {
        let service = service();
        let user = user_with_credits(10.0);
        let reservation = service
            .precheck(&user, "openai/gpt-4o", 40, Some(100))
            .unwrap();

        // Provider reports usage (10, 40): cost = 0.000425 <= max_cost
        let cost = service.cost_usd("openai/gpt-4o", 10, 40).unwrap();
        assert!((cost - 0.000425).abs() < 1e-12);
        assert!(cost <= reservation.max_cost);
        assert!(cost >= 0.0);
    }

    #[test]
    fn test_unpriced_model_rejected_for_paid_users() {
        let service = service();
        let user = user_with_credits(100.0);
        let err = service
            .precheck(&user, "unknown/model", 40, Some(100))
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation { .. }));
    }

    #[test]
    fn test_trial_flat_fallback() {
        let service = service();
        // Unknown model: 150 tokens at the flat 0.00002 rate
        let cost = service.trial_cost("unknown/model", 100, 50);
        assert!((cost - 0.003).abs() < 1e-12);
        // Known model uses real pricing
        let cost = service.trial_cost("openai/gpt-4o", 10, 40);
        assert!((cost - 0.000425).abs() < 1e-12);
    }

    #[test]
    fn test_prompt_estimate_floor() {
        assert_eq!(PricingService::estimate_prompt_tokens(0), 1);
        assert_eq!(PricingService::estimate_prompt_tokens(3), 1);
        assert_eq!(PricingService::estimate_prompt_tokens(400), 100);
    }

    #[test]
    fn test_default_max_tokens_applied() {
        let service = service();
        let user = user_with_credits(10.0);
        let reservation = service
            .precheck(&user, "openai/gpt-4o", 40, None)
            .unwrap();
        assert_eq!(reservation.max_output_tokens, 4096);
    }
}
