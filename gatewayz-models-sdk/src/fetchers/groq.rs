use crate::catalog::{Architecture, ModelRecord, Pricing};
use crate::error::ProviderError;
use crate::fetchers::{validate_batch, CatalogFetcher};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use std::collections::HashMap;
use std::time::Duration;

/// Groq catalog fetcher.
///
/// Groq publishes pricing in two historical formats: cents per token
/// (`cents_per_input_token`/`cents_per_output_token`) or dollars per token
/// (`input`/`output`). Both converge on per-single-token decimals here.
pub struct GroqFetcher {
    client: HttpProviderClient,
}

impl GroqFetcher {
    pub fn new(api_key: String, base_url: Option<String>) -> Result<Self, ProviderError> {
        let client = HttpProviderClient::new(
            Duration::from_secs(20),
            base_url,
            "https://api.groq.com/openai/v1",
            &HashMap::new(),
            AuthStrategy::Bearer { token: api_key },
        )?;
        Ok(Self { client })
    }

    fn normalize(entry: &serde_json::Value) -> ModelRecord {
        let model_id = entry["id"].as_str().unwrap_or_default();
        let slug = format!("groq/{model_id}");

        let display_name = entry["display_name"]
            .as_str()
            .map(String::from)
            .unwrap_or_else(|| model_id.replace(['-', '_'], " "));

        let owned_by = entry["owned_by"].as_str();
        let base_description = entry["description"]
            .as_str()
            .map(String::from)
            .unwrap_or_else(|| format!("Groq hosted model {model_id}."));
        let description = match owned_by {
            Some(owner) if !base_description.to_lowercase().contains(&owner.to_lowercase()) => {
                format!("{base_description} Owned by {owner}.")
            }
            _ => base_description,
        };

        let metadata = entry.get("metadata").cloned().unwrap_or_default();
        let context_length = metadata["context_length"]
            .as_u64()
            .or_else(|| entry["context_length"].as_u64())
            .unwrap_or(0) as u32;

        let pricing_info = entry.get("pricing").cloned().unwrap_or_default();
        let mut pricing = Pricing::default();
        if pricing_info.get("cents_per_input_token").is_some()
            || pricing_info.get("cents_per_output_token").is_some()
        {
            pricing.prompt = pricing_info["cents_per_input_token"]
                .as_f64()
                .map(|c| c / 100.0);
            pricing.completion = pricing_info["cents_per_output_token"]
                .as_f64()
                .map(|c| c / 100.0);
        } else {
            pricing.prompt = pricing_info["input"].as_f64();
            pricing.completion = pricing_info["output"].as_f64();
        }
        let pricing = if pricing.prompt.is_some() || pricing.completion.is_some() {
            Some(pricing)
        } else {
            None
        };

        ModelRecord {
            id: slug.clone(),
            slug: slug.clone(),
            canonical_slug: slug,
            name: display_name,
            description,
            context_length,
            architecture: Architecture::default(),
            pricing,
            supported_parameters: Vec::new(),
            default_parameters: serde_json::Value::Null,
            provider_slug: "groq".to_string(),
            provider_site_url: Some("https://groq.com".to_string()),
            model_logo_url: None,
            source_gateway: "groq".to_string(),
            is_free: false,
            created: entry["created"].as_i64(),
        }
        .normalized()
    }
}

#[async_trait::async_trait]
impl CatalogFetcher for GroqFetcher {
    fn gateway(&self) -> &str {
        "groq"
    }

    async fn fetch(&self) -> Result<Vec<ModelRecord>, ProviderError> {
        let payload: serde_json::Value = self.client.get_json("/models").await?;
        let entries = validate_batch("groq", &payload);
        Ok(entries.iter().map(Self::normalize).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cents_per_token_conversion() {
        let entry = json!({
            "id": "llama-3.3-70b-versatile",
            "owned_by": "Meta",
            "pricing": {"cents_per_input_token": 0.0000059, "cents_per_output_token": 0.0000079},
            "metadata": {"context_length": 131072}
        });
        let record = GroqFetcher::normalize(&entry);

        assert_eq!(record.id, "groq/llama-3.3-70b-versatile");
        assert_eq!(record.provider_slug, "groq");
        assert_eq!(record.context_length, 131072);
        let pricing = record.pricing.unwrap();
        assert!((pricing.prompt.unwrap() - 5.9e-8).abs() < 1e-15);
        assert!((pricing.completion.unwrap() - 7.9e-8).abs() < 1e-15);
        assert!(record.description.contains("Owned by Meta"));
    }

    #[test]
    fn test_dollar_pricing_passthrough() {
        let entry = json!({
            "id": "gemma2-9b-it",
            "pricing": {"input": 2e-7, "output": 2e-7}
        });
        let record = GroqFetcher::normalize(&entry);
        assert_eq!(record.pricing.unwrap().prompt, Some(2e-7));
        // Unknown context length falls back to the default
        assert_eq!(record.context_length, 4096);
    }
}
