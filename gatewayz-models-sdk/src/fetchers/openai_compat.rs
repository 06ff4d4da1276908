use crate::catalog::{Architecture, ModelRecord, Pricing};
use crate::error::ProviderError;
use crate::fetchers::{price_from_entry, validate_batch, CatalogFetcher, PricingUnit};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use std::collections::HashMap;
use std::time::Duration;

/// Static description of one OpenAI-compatible gateway.
#[derive(Debug, Clone)]
pub struct GatewaySpec {
    /// Gateway slug, also the source_gateway on produced records
    pub slug: &'static str,
    /// Default models-listing base URL
    pub base_url: &'static str,
    /// Native pricing unit of the listing
    pub pricing_unit: PricingUnit,
    /// Context length assumed when the listing omits one
    pub default_context: u32,
    /// Whether bare model ids get a `{slug}/` prefix
    pub prefix_ids: bool,
}

/// The long tail of gateways whose listings all follow the OpenAI
/// `/models` shape with bearer auth. Pricing units and defaults are the
/// only per-gateway variation worth a table entry; anything needing real
/// logic has a dedicated fetcher module instead.
pub fn builtin_gateways() -> Vec<GatewaySpec> {
    use PricingUnit::*;
    vec![
        GatewaySpec { slug: "deepinfra", base_url: "https://api.deepinfra.com/v1/openai", pricing_unit: PerMillionTokens, default_context: 4096, prefix_ids: false },
        GatewaySpec { slug: "together", base_url: "https://api.together.xyz/v1", pricing_unit: PerMillionTokens, default_context: 4096, prefix_ids: false },
        GatewaySpec { slug: "fireworks", base_url: "https://api.fireworks.ai/inference/v1", pricing_unit: PerMillionTokens, default_context: 4096, prefix_ids: false },
        GatewaySpec { slug: "cerebras", base_url: "https://api.cerebras.ai/v1", pricing_unit: PerMillionTokens, default_context: 8192, prefix_ids: true },
        GatewaySpec { slug: "nebius", base_url: "https://api.studio.nebius.ai/v1", pricing_unit: PerMillionTokens, default_context: 4096, prefix_ids: false },
        GatewaySpec { slug: "xai", base_url: "https://api.x.ai/v1", pricing_unit: PerMillionTokens, default_context: 131072, prefix_ids: true },
        GatewaySpec { slug: "novita", base_url: "https://api.novita.ai/v3/openai", pricing_unit: PerMillionTokens, default_context: 4096, prefix_ids: false },
        GatewaySpec { slug: "chutes", base_url: "https://llm.chutes.ai/v1", pricing_unit: PerMillionTokens, default_context: 4096, prefix_ids: false },
        GatewaySpec { slug: "onerouter", base_url: "https://api.onerouter.pro/v1", pricing_unit: PerMillionTokens, default_context: 4096, prefix_ids: false },
        GatewaySpec { slug: "helicone", base_url: "https://ai-gateway.helicone.ai/v1", pricing_unit: PerMillionTokens, default_context: 4096, prefix_ids: false },
        GatewaySpec { slug: "anannas", base_url: "https://api.anannas.ai/v1", pricing_unit: PerMillionTokens, default_context: 4096, prefix_ids: false },
        GatewaySpec { slug: "aihubmix", base_url: "https://aihubmix.com/v1", pricing_unit: PerThousandTokens, default_context: 4096, prefix_ids: false },
        GatewaySpec { slug: "vercel-ai-gateway", base_url: "https://ai-gateway.vercel.sh/v1", pricing_unit: PerMillionTokens, default_context: 4096, prefix_ids: false },
        GatewaySpec { slug: "simplismart", base_url: "https://api.simplismart.ai/v1", pricing_unit: PerMillionTokens, default_context: 4096, prefix_ids: false },
        GatewaySpec { slug: "sybil", base_url: "https://api.sybil.com/v1", pricing_unit: PerMillionTokens, default_context: 4096, prefix_ids: false },
        GatewaySpec { slug: "morpheus", base_url: "https://api.mor.org/api/v1", pricing_unit: PerMillionTokens, default_context: 4096, prefix_ids: false },
        GatewaySpec { slug: "canopywave", base_url: "https://api.canopywave.io/v1", pricing_unit: PerMillionTokens, default_context: 4096, prefix_ids: false },
        GatewaySpec { slug: "clarifai", base_url: "https://api.clarifai.com/v2/ext/openai/v1", pricing_unit: PerMillionTokens, default_context: 4096, prefix_ids: false },
        GatewaySpec { slug: "near", base_url: "https://api.near.ai/v1", pricing_unit: PerMillionTokens, default_context: 4096, prefix_ids: false },
        GatewaySpec { slug: "fal", base_url: "https://fal.run/v1", pricing_unit: PerMillionTokens, default_context: 4096, prefix_ids: false },
        GatewaySpec { slug: "hug", base_url: "https://router.huggingface.co/v1", pricing_unit: PerMillionTokens, default_context: 4096, prefix_ids: false },
        GatewaySpec { slug: "aimo", base_url: "https://api.aimo.network/v1", pricing_unit: PerMillionTokens, default_context: 4096, prefix_ids: false },
        GatewaySpec { slug: "openai", base_url: "https://api.openai.com/v1", pricing_unit: PerMillionTokens, default_context: 128000, prefix_ids: true },
        GatewaySpec { slug: "anthropic", base_url: "https://api.anthropic.com/v1", pricing_unit: PerMillionTokens, default_context: 200000, prefix_ids: true },
        GatewaySpec { slug: "google-vertex", base_url: "https://us-central1-aiplatform.googleapis.com/v1", pricing_unit: PerMillionTokens, default_context: 1000000, prefix_ids: true },
        GatewaySpec { slug: "zai", base_url: "https://api.z.ai/api/paas/v4", pricing_unit: PerMillionTokens, default_context: 128000, prefix_ids: true },
    ]
}

/// Table-driven fetcher for OpenAI-compatible gateway listings.
pub struct OpenAiCompatFetcher {
    spec: GatewaySpec,
    client: HttpProviderClient,
}

impl OpenAiCompatFetcher {
    pub fn new(
        spec: GatewaySpec,
        api_key: String,
        base_url: Option<String>,
    ) -> Result<Self, ProviderError> {
        let client = HttpProviderClient::new(
            Duration::from_secs(20),
            base_url,
            spec.base_url,
            &HashMap::new(),
            AuthStrategy::Bearer { token: api_key },
        )?;
        Ok(Self { spec, client })
    }

    fn normalize(&self, entry: &serde_json::Value) -> ModelRecord {
        let raw_id = entry["id"].as_str().unwrap_or_default();
        let id = if self.spec.prefix_ids && !raw_id.contains('/') {
            format!("{}/{raw_id}", self.spec.slug)
        } else {
            raw_id.to_string()
        };

        let prompt = price_from_entry(entry, &["prompt", "input", "input_cost_per_token"])
            .map(|v| self.unit_for(entry).to_per_token(v));
        let completion = price_from_entry(entry, &["completion", "output", "output_cost_per_token"])
            .map(|v| self.unit_for(entry).to_per_token(v));
        let pricing = if prompt.is_some() || completion.is_some() {
            Some(Pricing {
                prompt,
                completion,
                ..Default::default()
            })
        } else {
            None
        };

        let context_length = entry["context_length"]
            .as_u64()
            .or_else(|| entry["max_context"].as_u64())
            .or_else(|| entry["context_window"].as_u64())
            .unwrap_or(self.spec.default_context as u64) as u32;

        ModelRecord {
            slug: id.clone(),
            canonical_slug: id.clone(),
            name: entry["name"].as_str().unwrap_or(&id).to_string(),
            description: entry["description"]
                .as_str()
                .map(String::from)
                .unwrap_or_else(|| format!("{} hosted model {raw_id}.", self.spec.slug)),
            context_length,
            architecture: Architecture::default(),
            pricing,
            supported_parameters: Vec::new(),
            default_parameters: serde_json::Value::Null,
            provider_slug: ModelRecord::provider_from_id(&id, self.spec.slug),
            provider_site_url: None,
            model_logo_url: None,
            source_gateway: self.spec.slug.to_string(),
            is_free: false,
            created: entry["created"].as_i64(),
            id,
        }
        .normalized()
    }

    fn unit_for(&self, entry: &serde_json::Value) -> PricingUnit {
        // `*_cost_per_token` fields are per-token regardless of the
        // gateway's listed unit
        if entry.get("input_cost_per_token").is_some()
            || entry.get("output_cost_per_token").is_some()
        {
            PricingUnit::PerToken
        } else {
            self.spec.pricing_unit
        }
    }
}

#[async_trait::async_trait]
impl CatalogFetcher for OpenAiCompatFetcher {
    fn gateway(&self) -> &str {
        self.spec.slug
    }

    async fn fetch(&self) -> Result<Vec<ModelRecord>, ProviderError> {
        let payload: serde_json::Value = self.client.get_json("/models").await?;
        let entries = validate_batch(self.spec.slug, &payload);
        Ok(entries.iter().map(|e| self.normalize(e)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(slug: &'static str, unit: PricingUnit, prefix: bool) -> GatewaySpec {
        GatewaySpec {
            slug,
            base_url: "https://example.invalid/v1",
            pricing_unit: unit,
            default_context: 4096,
            prefix_ids: prefix,
        }
    }

    #[test]
    fn test_per_million_conversion_and_prefixing() {
        let fetcher = OpenAiCompatFetcher::new(
            spec("cerebras", PricingUnit::PerMillionTokens, true),
            "k".into(),
            None,
        )
        .unwrap();

        let record = fetcher.normalize(&json!({
            "id": "llama-3.3-70b",
            "pricing": {"input": 0.85, "output": 1.2},
            "context_window": 65536
        }));

        assert_eq!(record.id, "cerebras/llama-3.3-70b");
        assert_eq!(record.provider_slug, "cerebras");
        assert!((record.pricing.as_ref().unwrap().prompt.unwrap() - 8.5e-7).abs() < 1e-13);
        assert_eq!(record.context_length, 65536);
    }

    #[test]
    fn test_cost_per_token_fields_bypass_unit() {
        let fetcher = OpenAiCompatFetcher::new(
            spec("together", PricingUnit::PerMillionTokens, false),
            "k".into(),
            None,
        )
        .unwrap();

        let record = fetcher.normalize(&json!({
            "id": "meta-llama/Llama-3.1-70B",
            "input_cost_per_token": 8.8e-7,
            "output_cost_per_token": 8.8e-7
        }));

        assert_eq!(record.pricing.as_ref().unwrap().prompt, Some(8.8e-7));
        assert_eq!(record.provider_slug, "meta-llama");
    }

    #[test]
    fn test_default_context_applies() {
        let fetcher = OpenAiCompatFetcher::new(
            spec("novita", PricingUnit::PerMillionTokens, false),
            "k".into(),
            None,
        )
        .unwrap();
        let record = fetcher.normalize(&json!({"id": "some/model"}));
        assert_eq!(record.context_length, 4096);
        assert!(record.pricing.is_none());
    }

    #[test]
    fn test_builtin_table_has_unique_slugs() {
        let gateways = builtin_gateways();
        let mut slugs: Vec<_> = gateways.iter().map(|g| g.slug).collect();
        slugs.sort_unstable();
        let before = slugs.len();
        slugs.dedup();
        assert_eq!(before, slugs.len());
        assert!(gateways.len() >= 25);
    }
}
