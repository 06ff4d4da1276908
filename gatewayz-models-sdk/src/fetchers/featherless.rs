use crate::catalog::{Architecture, ModelRecord, Pricing};
use crate::error::ProviderError;
use crate::fetchers::{validate_batch, CatalogFetcher};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Featherless catalog fetcher.
///
/// Featherless is flaky enough that a static export of its catalog ships as
/// a last-resort fallback: when the live listing fails, the fetcher loads
/// the newest export CSV (if configured) and runs those rows through the
/// same normalization path.
pub struct FeatherlessFetcher {
    client: HttpProviderClient,
    export_path: Option<PathBuf>,
}

impl FeatherlessFetcher {
    pub fn new(
        api_key: String,
        base_url: Option<String>,
        export_path: Option<PathBuf>,
    ) -> Result<Self, ProviderError> {
        let client = HttpProviderClient::new(
            Duration::from_secs(20),
            base_url,
            "https://api.featherless.ai/v1",
            &HashMap::new(),
            AuthStrategy::Bearer { token: api_key },
        )?;
        Ok(Self {
            client,
            export_path,
        })
    }

    fn normalize(entry: &serde_json::Value) -> ModelRecord {
        let id = entry["id"].as_str().unwrap_or_default().to_string();
        let prompt = entry["pricing"]["prompt"].as_f64();
        let completion = entry["pricing"]["completion"].as_f64();
        let pricing = if prompt.is_some() || completion.is_some() {
            Some(Pricing {
                prompt,
                completion,
                ..Default::default()
            })
        } else {
            None
        };

        ModelRecord {
            slug: id.clone(),
            canonical_slug: id.clone(),
            name: entry["name"].as_str().unwrap_or(&id).to_string(),
            description: entry["description"]
                .as_str()
                .map(String::from)
                .unwrap_or_else(|| format!("Featherless catalog entry for {id}.")),
            context_length: entry["context_length"].as_u64().unwrap_or(0) as u32,
            architecture: Architecture::default(),
            pricing,
            supported_parameters: Vec::new(),
            default_parameters: serde_json::Value::Null,
            provider_slug: ModelRecord::provider_from_id(&id, "featherless"),
            provider_site_url: None,
            model_logo_url: None,
            source_gateway: "featherless".to_string(),
            is_free: false,
            created: None,
            id,
        }
        .normalized()
    }

    /// Parse rows from a catalog export CSV.
    ///
    /// Columns: `gateway,id,name,context_length,prompt_price,completion_price`.
    /// Rows for other gateways and rows without an id are skipped.
    fn load_export(&self) -> Option<Vec<ModelRecord>> {
        let path = self.export_path.as_ref()?;
        let content = std::fs::read_to_string(path).ok()?;
        let mut lines = content.lines();
        let header: Vec<&str> = lines.next()?.split(',').map(str::trim).collect();
        let col = |name: &str| header.iter().position(|h| *h == name);
        let (gw_col, id_col) = (col("gateway")?, col("id")?);
        let name_col = col("name");
        let ctx_col = col("context_length");
        let prompt_col = col("prompt_price");
        let completion_col = col("completion_price");

        let mut records = Vec::new();
        for line in lines {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.get(gw_col).map(|g| g.to_lowercase()) != Some("featherless".to_string()) {
                continue;
            }
            let Some(id) = fields.get(id_col).filter(|id| !id.is_empty()) else {
                continue;
            };
            let parse_price = |idx: Option<usize>| {
                idx.and_then(|i| fields.get(i))
                    .and_then(|v| v.parse::<f64>().ok())
            };
            let entry = serde_json::json!({
                "id": id,
                "name": name_col.and_then(|i| fields.get(i)).copied().unwrap_or(id),
                "context_length": ctx_col
                    .and_then(|i| fields.get(i))
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0),
                "pricing": {
                    "prompt": parse_price(prompt_col),
                    "completion": parse_price(completion_col),
                }
            });
            records.push(Self::normalize(&entry));
        }

        if records.is_empty() {
            None
        } else {
            tracing::info!(
                count = records.len(),
                path = %path.display(),
                "loaded Featherless models from catalog export"
            );
            Some(records)
        }
    }
}

#[async_trait::async_trait]
impl CatalogFetcher for FeatherlessFetcher {
    fn gateway(&self) -> &str {
        "featherless"
    }

    async fn fetch(&self) -> Result<Vec<ModelRecord>, ProviderError> {
        match self.client.get_json::<serde_json::Value>("/models").await {
            Ok(payload) => {
                let entries = validate_batch("featherless", &payload);
                Ok(entries.iter().map(Self::normalize).collect())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Featherless live fetch failed, trying export");
                match self.load_export() {
                    Some(records) => Ok(records),
                    None => Err(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_export_parsing_filters_gateway() {
        let mut file = tempfile_path("featherless-export.csv");
        writeln!(
            file.1,
            "gateway,id,name,context_length,prompt_price,completion_price\n\
             featherless,meta/llama-3.1-8b,Llama 3.1 8B,16384,0.0000001,0.0000002\n\
             openrouter,openai/gpt-4o,GPT-4o,128000,0.0000025,0.00001\n\
             featherless,,missing id,0,,"
        )
        .unwrap();
        drop(file.1);

        let fetcher =
            FeatherlessFetcher::new("k".into(), None, Some(file.0.clone())).unwrap();
        let records = fetcher.load_export().unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "meta/llama-3.1-8b");
        assert_eq!(records[0].provider_slug, "meta");
        assert_eq!(records[0].context_length, 16384);
        assert_eq!(records[0].pricing.as_ref().unwrap().prompt, Some(1e-7));

        std::fs::remove_file(file.0).ok();
    }

    fn tempfile_path(name: &str) -> (PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!("{}-{}", std::process::id(), name));
        let file = std::fs::File::create(&path).unwrap();
        (path, file)
    }
}
