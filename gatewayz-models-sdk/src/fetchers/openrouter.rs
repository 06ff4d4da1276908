use crate::catalog::{Architecture, ModelRecord, Pricing};
use crate::error::ProviderError;
use crate::fetchers::{validate_batch, CatalogFetcher};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use std::collections::HashMap;
use std::time::Duration;

/// OpenRouter catalog fetcher.
///
/// OpenRouter's listing is the reference shape the common schema was modeled
/// on, so normalization is mostly a straight field mapping. Two quirks:
/// `-1` price components mark dynamic-priced auto-routing models, and ids
/// ending in `:free` are the only legitimately free models in the fleet.
pub struct OpenRouterFetcher {
    client: HttpProviderClient,
}

impl OpenRouterFetcher {
    pub fn new(api_key: String, base_url: Option<String>) -> Result<Self, ProviderError> {
        let client = HttpProviderClient::new(
            Duration::from_secs(20),
            base_url,
            "https://openrouter.ai/api/v1",
            &HashMap::new(),
            AuthStrategy::Bearer { token: api_key },
        )?;
        Ok(Self { client })
    }

    fn normalize(entry: &serde_json::Value) -> ModelRecord {
        let id = entry["id"].as_str().unwrap_or_default().to_string();
        let slug = entry["slug"].as_str().unwrap_or(&id).to_string();
        let canonical_slug = entry["canonical_slug"].as_str().unwrap_or(&slug).to_string();

        let pricing = entry.get("pricing").map(|p| Pricing {
            prompt: str_price(p, "prompt"),
            completion: str_price(p, "completion"),
            request: str_price(p, "request"),
            image: str_price(p, "image"),
            web_search: str_price(p, "web_search"),
            internal_reasoning: str_price(p, "internal_reasoning"),
        });

        let architecture = entry
            .get("architecture")
            .map(|a| Architecture {
                modality: a["modality"].as_str().unwrap_or("text->text").to_string(),
                input_modalities: str_list(a.get("input_modalities")),
                output_modalities: str_list(a.get("output_modalities")),
                tokenizer: a["tokenizer"].as_str().map(String::from),
                instruct_type: a["instruct_type"].as_str().map(String::from),
            })
            .unwrap_or_default();

        ModelRecord {
            is_free: id.ends_with(":free"),
            provider_slug: ModelRecord::provider_from_id(&id, "openrouter"),
            name: entry["name"].as_str().unwrap_or(&id).to_string(),
            description: entry["description"].as_str().unwrap_or_default().to_string(),
            context_length: entry["context_length"].as_u64().unwrap_or(0) as u32,
            architecture,
            pricing,
            supported_parameters: str_list(entry.get("supported_parameters")),
            default_parameters: entry
                .get("default_parameters")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
            provider_site_url: None,
            model_logo_url: entry["model_logo_url"].as_str().map(String::from),
            source_gateway: "openrouter".to_string(),
            created: entry["created"].as_i64(),
            id,
            slug,
            canonical_slug,
        }
        .normalized()
    }
}

fn str_price(pricing: &serde_json::Value, key: &str) -> Option<f64> {
    match pricing.get(key) {
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        _ => None,
    }
}

fn str_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl CatalogFetcher for OpenRouterFetcher {
    fn gateway(&self) -> &str {
        "openrouter"
    }

    async fn fetch(&self) -> Result<Vec<ModelRecord>, ProviderError> {
        let payload: serde_json::Value = self.client.get_json("/models").await?;
        let entries = validate_batch("openrouter", &payload);
        Ok(entries.iter().map(Self::normalize).collect())
    }
}
