use crate::catalog::{Architecture, ModelRecord, Pricing};
use crate::error::ProviderError;
use crate::fetchers::{price_from_entry, validate_batch, CatalogFetcher, PricingUnit};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Backoff applied when Alibaba reports a quota-exceeded 429. Queries during
/// the backoff serve whatever cached data exists without hitting the API.
pub const QUOTA_BACKOFF: Duration = Duration::from_secs(15 * 60);

/// One Alibaba Cloud region endpoint.
#[derive(Debug, Clone)]
pub struct AlibabaRegion {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
}

/// Alibaba Cloud (DashScope) catalog fetcher with region failover.
///
/// The international and China endpoints take separate API keys, and a key
/// valid in one region is rejected by the other. Failover is therefore
/// auth-shaped rather than availability-shaped, which is why it lives here
/// as a small state machine instead of in the general circuit breaker:
/// an auth failure tries the next region, a success is remembered as the
/// last working region, and quota errors abort without retry so the caller
/// can cache the [`QUOTA_BACKOFF`].
pub struct AlibabaFetcher {
    regions: Vec<AlibabaRegion>,
    explicit_region: Option<String>,
    last_working: Mutex<Option<String>>,
    timeout: Duration,
}

impl AlibabaFetcher {
    pub fn new(regions: Vec<AlibabaRegion>, explicit_region: Option<String>) -> Self {
        Self {
            regions,
            explicit_region,
            last_working: Mutex::new(None),
            timeout: Duration::from_secs(20),
        }
    }

    /// Standard endpoints: international first, then China.
    pub fn default_regions(
        intl_api_key: Option<String>,
        cn_api_key: Option<String>,
    ) -> Vec<AlibabaRegion> {
        vec![
            AlibabaRegion {
                name: "international".to_string(),
                base_url: "https://dashscope-intl.aliyuncs.com/compatible-mode/v1".to_string(),
                api_key: intl_api_key,
            },
            AlibabaRegion {
                name: "china".to_string(),
                base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string(),
                api_key: cn_api_key,
            },
        ]
    }

    fn candidate_order(&self) -> Vec<AlibabaRegion> {
        let with_keys: Vec<AlibabaRegion> = self
            .regions
            .iter()
            .filter(|r| r.api_key.is_some())
            .cloned()
            .collect();

        if let Some(explicit) = &self.explicit_region {
            return with_keys
                .into_iter()
                .filter(|r| &r.name == explicit)
                .collect();
        }

        let last = self.last_working.lock().unwrap().clone();
        match last {
            Some(last) => {
                let mut ordered: Vec<AlibabaRegion> = with_keys
                    .iter()
                    .filter(|r| r.name == last)
                    .cloned()
                    .collect();
                ordered.extend(with_keys.into_iter().filter(|r| r.name != last));
                ordered
            }
            None => with_keys,
        }
    }

    async fn fetch_region(&self, region: &AlibabaRegion) -> Result<Vec<ModelRecord>, ProviderError> {
        let client = HttpProviderClient::new(
            self.timeout,
            Some(region.base_url.clone()),
            "",
            &HashMap::new(),
            AuthStrategy::Bearer {
                token: region.api_key.clone().unwrap_or_default(),
            },
        )?;

        let payload: serde_json::Value = client.get_json("/models").await?;
        let entries = validate_batch("alibaba", &payload);
        Ok(entries.iter().map(Self::normalize).collect())
    }

    fn normalize(entry: &serde_json::Value) -> ModelRecord {
        let model_id = entry["id"].as_str().unwrap_or_default();
        let slug = format!("alibaba/{model_id}");

        // DashScope publishes per-1M pricing when it publishes any
        let prompt = price_from_entry(entry, &["input_price", "input"])
            .map(|v| PricingUnit::PerMillionTokens.to_per_token(v));
        let completion = price_from_entry(entry, &["output_price", "output"])
            .map(|v| PricingUnit::PerMillionTokens.to_per_token(v));
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
            id: slug.clone(),
            slug: slug.clone(),
            canonical_slug: slug,
            name: entry["name"].as_str().unwrap_or(model_id).to_string(),
            description: entry["description"]
                .as_str()
                .map(String::from)
                .unwrap_or_else(|| format!("Alibaba Cloud hosted model {model_id}.")),
            context_length: entry["context_length"].as_u64().unwrap_or(0) as u32,
            architecture: Architecture::default(),
            pricing,
            supported_parameters: Vec::new(),
            default_parameters: serde_json::Value::Null,
            provider_slug: "alibaba".to_string(),
            provider_site_url: Some("https://www.alibabacloud.com".to_string()),
            model_logo_url: None,
            source_gateway: "alibaba".to_string(),
            is_free: false,
            created: None,
        }
        .normalized()
    }
}

#[async_trait::async_trait]
impl CatalogFetcher for AlibabaFetcher {
    fn gateway(&self) -> &str {
        "alibaba"
    }

    async fn fetch(&self) -> Result<Vec<ModelRecord>, ProviderError> {
        let candidates = self.candidate_order();
        if candidates.is_empty() {
            return Err(ProviderError::Configuration {
                message: "no Alibaba region has an API key configured".to_string(),
            });
        }

        let mut last_error = None;
        for region in &candidates {
            match self.fetch_region(region).await {
                Ok(records) => {
                    *self.last_working.lock().unwrap() = Some(region.name.clone());
                    return Ok(records);
                }
                Err(ProviderError::QuotaExceeded) => {
                    // Quota errors do not retry in another region; the
                    // caller caches the 15-minute backoff.
                    tracing::warn!(
                        region = %region.name,
                        "Alibaba quota exceeded, aborting region failover"
                    );
                    return Err(ProviderError::QuotaExceeded);
                }
                Err(e @ ProviderError::InvalidApiKey) => {
                    tracing::warn!(
                        region = %region.name,
                        "Alibaba auth failure, trying next region"
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    tracing::warn!(
                        region = %region.name,
                        error = %e,
                        "Alibaba region fetch failed, trying next region"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(ProviderError::ServiceUnavailable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn region(name: &str, url: String, key: Option<&str>) -> AlibabaRegion {
        AlibabaRegion {
            name: name.to_string(),
            base_url: url,
            api_key: key.map(String::from),
        }
    }

    #[test]
    fn test_candidate_order_skips_keyless_regions() {
        let fetcher = AlibabaFetcher::new(
            vec![
                region("international", "http://a".into(), None),
                region("china", "http://b".into(), Some("key")),
            ],
            None,
        );
        let order = fetcher.candidate_order();
        assert_eq!(order.len(), 1);
        assert_eq!(order[0].name, "china");
    }

    #[test]
    fn test_explicit_region_wins() {
        let fetcher = AlibabaFetcher::new(
            vec![
                region("international", "http://a".into(), Some("k1")),
                region("china", "http://b".into(), Some("k2")),
            ],
            Some("china".to_string()),
        );
        let order = fetcher.candidate_order();
        assert_eq!(order.len(), 1);
        assert_eq!(order[0].name, "china");
    }

    #[tokio::test]
    async fn test_auth_failure_fails_over_and_remembers_region() {
        let bad = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&bad)
            .await;

        let good = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "qwen-max", "input_price": 1.6, "output_price": 6.4}]
            })))
            .mount(&good)
            .await;

        let fetcher = AlibabaFetcher::new(
            vec![
                region("international", bad.uri(), Some("k1")),
                region("china", good.uri(), Some("k2")),
            ],
            None,
        );

        let records = fetcher.fetch().await.unwrap();
        assert_eq!(records[0].id, "alibaba/qwen-max");
        assert!((records[0].pricing.as_ref().unwrap().prompt.unwrap() - 1.6e-6).abs() < 1e-12);
        assert_eq!(
            fetcher.last_working.lock().unwrap().as_deref(),
            Some("china")
        );

        // Next fetch starts from the remembered region
        let order = fetcher.candidate_order();
        assert_eq!(order[0].name, "china");
    }

    #[tokio::test]
    async fn test_quota_error_aborts_failover() {
        let quota = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": {"message": "You exceeded your current quota"}
            })))
            .mount(&quota)
            .await;

        let never_called = MockServer::start().await;

        let fetcher = AlibabaFetcher::new(
            vec![
                region("international", quota.uri(), Some("k1")),
                region("china", never_called.uri(), Some("k2")),
            ],
            None,
        );

        let err = fetcher.fetch().await.unwrap_err();
        assert!(matches!(err, ProviderError::QuotaExceeded));
        assert_eq!(never_called.received_requests().await.unwrap().len(), 0);
    }
}
