//! # Per-Gateway Catalog Fetchers
//!
//! One fetcher per upstream gateway: authenticated GET against the gateway's
//! model listing, parse, and map every entry into a [`ModelRecord`]. The
//! normalization rules shared by all fetchers live here:
//!
//! - `provider_slug` derives from the model id prefix, falling back to the
//!   source gateway.
//! - Pricing converts from the gateway's native unit (per-1K, per-1M,
//!   cents-per-token) to **per-single-token decimals** before any handler
//!   code sees a record.
//! - Records with a negative price component (dynamic pricing) are dropped.
//! - Records priced zero/zero are dropped unless allowlisted free
//!   (`is_free`), so free-looking noise cannot drain credits.
//! - Unpriced records survive only during a full catalog build.
//! - Unknown context length defaults to the gateway default (or 4096).
//! - A manual pricing overlay may override prompt/completion last.
//!
//! Gateways with a genuinely distinct shape get a dedicated module
//! ([`openrouter`], [`groq`], [`alibaba`], [`featherless`]); the long tail of
//! OpenAI-compatible catalogs shares the table-driven [`openai_compat`]
//! fetcher.

use crate::catalog::{ModelRecord, Pricing};
use crate::error::ProviderError;
use std::collections::HashMap;

pub mod alibaba;
pub mod featherless;
pub mod groq;
pub mod openai_compat;
pub mod openrouter;

/// A catalog fetcher for one gateway.
#[async_trait::async_trait]
pub trait CatalogFetcher: Send + Sync {
    /// Gateway slug this fetcher serves.
    fn gateway(&self) -> &str;

    /// Fetch and normalize the gateway's model listing.
    ///
    /// Pricing is already per-single-token on return; the catalog-wide drop
    /// rules and overlay are applied by [`apply_catalog_rules`].
    async fn fetch(&self) -> Result<Vec<ModelRecord>, ProviderError>;
}

/// Native pricing unit published by a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PricingUnit {
    /// Dollars per single token (already normalized)
    PerToken,
    /// Dollars per 1 000 tokens
    PerThousandTokens,
    /// Dollars per 1 000 000 tokens
    PerMillionTokens,
    /// Cents per single token
    CentsPerToken,
}

impl PricingUnit {
    /// Convert a native price into dollars per single token.
    pub fn to_per_token(&self, value: f64) -> f64 {
        match self {
            PricingUnit::PerToken => value,
            PricingUnit::PerThousandTokens => value / 1_000.0,
            PricingUnit::PerMillionTokens => value / 1_000_000.0,
            PricingUnit::CentsPerToken => value / 100.0,
        }
    }
}

/// Manual pricing overrides keyed by model id.
#[derive(Debug, Clone, Default)]
pub struct ManualPricingOverlay {
    overrides: HashMap<String, Pricing>,
}

impl ManualPricingOverlay {
    pub fn new(overrides: HashMap<String, Pricing>) -> Self {
        Self { overrides }
    }

    pub fn apply(&self, record: &mut ModelRecord) {
        if let Some(overlay) = self.overrides.get(&record.id) {
            let pricing = record.pricing.get_or_insert_with(Pricing::default);
            if overlay.prompt.is_some() {
                pricing.prompt = overlay.prompt;
            }
            if overlay.completion.is_some() {
                pricing.completion = overlay.completion;
            }
        }
    }
}

/// Validate the raw batch shape for one gateway.
///
/// Accepts a plain JSON array or the OpenAI-style `{"data": […]}` envelope.
/// Entries that are not objects or lack an `id` are dropped with a warning;
/// a batch that is not a list at all is dropped whole.
pub fn validate_batch(gateway: &str, payload: &serde_json::Value) -> Vec<serde_json::Value> {
    let items = match payload {
        serde_json::Value::Array(items) => items.as_slice(),
        serde_json::Value::Object(map) => match map.get("data") {
            Some(serde_json::Value::Array(items)) => items.as_slice(),
            _ => {
                tracing::warn!(
                    gateway = %gateway,
                    "gateway returned an envelope without a data list, skipping entire batch"
                );
                return Vec::new();
            }
        },
        other => {
            tracing::warn!(
                gateway = %gateway,
                got = %value_type_name(other),
                "gateway returned unexpected payload type, skipping entire batch"
            );
            return Vec::new();
        }
    };

    let mut valid = Vec::with_capacity(items.len());
    for item in items {
        let has_id = item
            .as_object()
            .and_then(|o| o.get("id"))
            .and_then(|id| id.as_str())
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        if has_id {
            valid.push(item.clone());
        } else {
            tracing::warn!(
                gateway = %gateway,
                entry = %truncate_for_log(item),
                "dropping malformed model entry (missing id)"
            );
        }
    }

    let dropped = items.len() - valid.len();
    if dropped > 0 {
        tracing::warn!(
            gateway = %gateway,
            dropped,
            total = items.len(),
            "dropped malformed model entries"
        );
    }
    valid
}

/// Apply the catalog-wide drop rules and the manual pricing overlay.
///
/// `keep_unpriced` is true only during a full catalog build, where records
/// without usable pricing are retained for canonical registration. They are
/// never chargeable either way: the credit pre-check rejects paid requests
/// for models whose pricing is unknown.
pub fn apply_catalog_rules(
    gateway: &str,
    records: Vec<ModelRecord>,
    overlay: &ManualPricingOverlay,
    keep_unpriced: bool,
) -> Vec<ModelRecord> {
    let total = records.len();
    let mut kept = Vec::with_capacity(total);

    for record in records {
        let mut record = record.normalized();

        // Dynamic pricing: any negative component excludes the record
        if let Some(pricing) = record.pricing.take() {
            match pricing.sanitize() {
                Some(clean) => record.pricing = Some(clean),
                None => {
                    tracing::debug!(
                        gateway = %gateway,
                        model = %record.id,
                        "dropping dynamic-priced model"
                    );
                    continue;
                }
            }
        }

        overlay.apply(&mut record);

        match &record.pricing {
            Some(pricing) if pricing.is_zero_priced() && !record.is_free => {
                tracing::debug!(
                    gateway = %gateway,
                    model = %record.id,
                    "dropping zero-priced model without free allowlisting"
                );
                continue;
            }
            Some(_) => {}
            None if record.is_free => {}
            None if keep_unpriced => {}
            None => {
                tracing::debug!(
                    gateway = %gateway,
                    model = %record.id,
                    "dropping unpriced model outside catalog build"
                );
                continue;
            }
        }

        kept.push(record);
    }

    if kept.len() != total {
        tracing::info!(
            gateway = %gateway,
            dropped = total - kept.len(),
            kept = kept.len(),
            "catalog rules filtered models"
        );
    }
    kept
}

fn value_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

fn truncate_for_log(value: &serde_json::Value) -> String {
    let mut s = value.to_string();
    if s.len() > 120 {
        s.truncate(120);
        s.push('…');
    }
    s
}

/// Read a price from the common places gateways put it.
pub(crate) fn price_from_entry(
    entry: &serde_json::Value,
    keys: &[&str],
) -> Option<f64> {
    for key in keys {
        let value = entry.get(key).or_else(|| {
            entry
                .get("pricing")
                .and_then(|p| p.get(key))
        });
        if let Some(v) = value {
            if let Some(f) = v.as_f64() {
                return Some(f);
            }
            if let Some(s) = v.as_str() {
                if let Ok(f) = s.trim().parse::<f64>() {
                    return Some(f);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Architecture;
    use serde_json::json;

    pub(crate) fn bare_record(id: &str, gateway: &str) -> ModelRecord {
        ModelRecord {
            id: id.to_string(),
            slug: String::new(),
            canonical_slug: String::new(),
            name: String::new(),
            description: String::new(),
            context_length: 0,
            architecture: Architecture::default(),
            pricing: None,
            supported_parameters: Vec::new(),
            default_parameters: serde_json::Value::Null,
            provider_slug: String::new(),
            provider_site_url: None,
            model_logo_url: None,
            source_gateway: gateway.to_string(),
            is_free: false,
            created: None,
        }
    }

    #[test]
    fn test_pricing_unit_conversion() {
        assert_eq!(PricingUnit::PerMillionTokens.to_per_token(2.5), 2.5e-6);
        assert_eq!(PricingUnit::PerThousandTokens.to_per_token(0.002), 2e-6);
        assert_eq!(PricingUnit::CentsPerToken.to_per_token(0.0001), 1e-6);
        assert_eq!(PricingUnit::PerToken.to_per_token(3e-7), 3e-7);
    }

    #[test]
    fn test_validate_batch_accepts_both_shapes() {
        let plain = json!([{"id": "a"}, {"id": "b"}]);
        assert_eq!(validate_batch("g", &plain).len(), 2);

        let envelope = json!({"data": [{"id": "a"}]});
        assert_eq!(validate_batch("g", &envelope).len(), 1);
    }

    #[test]
    fn test_validate_batch_drops_malformed() {
        let payload = json!([{"id": "ok"}, {"name": "no id"}, "not an object", {"id": ""}]);
        let valid = validate_batch("g", &payload);
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0]["id"], "ok");
    }

    #[test]
    fn test_validate_batch_rejects_non_list() {
        assert!(validate_batch("g", &json!("nope")).is_empty());
        assert!(validate_batch("g", &json!({"models": []})).is_empty());
    }

    #[test]
    fn test_rules_drop_dynamic_and_zero_priced() {
        let overlay = ManualPricingOverlay::default();

        let mut dynamic = bare_record("a/dyn", "g");
        dynamic.pricing = Some(Pricing::per_token(-1.0, 1e-6));
        let mut zero = bare_record("a/zero", "g");
        zero.pricing = Some(Pricing::per_token(0.0, 0.0));
        let mut free = bare_record("a/zero:free", "g");
        free.pricing = Some(Pricing::per_token(0.0, 0.0));
        free.is_free = true;
        let mut priced = bare_record("a/ok", "g");
        priced.pricing = Some(Pricing::per_token(1e-6, 2e-6));

        let kept = apply_catalog_rules("g", vec![dynamic, zero, free, priced], &overlay, false);
        let ids: Vec<_> = kept.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a/zero:free", "a/ok"]);
    }

    #[test]
    fn test_rules_keep_unpriced_only_during_build() {
        let overlay = ManualPricingOverlay::default();
        let unpriced = bare_record("a/unpriced", "g");

        assert_eq!(
            apply_catalog_rules("g", vec![unpriced.clone()], &overlay, true).len(),
            1
        );
        assert!(apply_catalog_rules("g", vec![unpriced], &overlay, false).is_empty());
    }

    #[test]
    fn test_overlay_overrides_pricing() {
        let mut overrides = HashMap::new();
        overrides.insert("a/ok".to_string(), Pricing::per_token(9e-6, 8e-6));
        let overlay = ManualPricingOverlay::new(overrides);

        let mut record = bare_record("a/ok", "g");
        record.pricing = Some(Pricing::per_token(1e-6, 2e-6));

        let kept = apply_catalog_rules("g", vec![record], &overlay, false);
        assert_eq!(kept[0].pricing.as_ref().unwrap().prompt, Some(9e-6));
    }
}
