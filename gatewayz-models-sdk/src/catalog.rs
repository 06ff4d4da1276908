//! # Model Catalog Types and Canonical Registry
//!
//! The catalog is the gateway-neutral view over ~30 heterogeneous upstream
//! gateways. Every fetcher normalizes its provider's listing into
//! [`ModelRecord`]; the [`ModelRegistry`] then deduplicates records into
//! canonical identities that the failover router resolves at request time.
//!
//! ## Pricing invariants
//!
//! All prices are **per single token** in USD by the time a record leaves a
//! fetcher. A negative component marks dynamic pricing and the whole record
//! is excluded ([`Pricing::sanitize`]). A record whose prompt and completion
//! prices are both zero is dropped unless explicitly allowlisted as free,
//! so free-looking catalog noise cannot drain credits.
//!
//! ## Canonical identities
//!
//! One canonical id (usually the `canonical_slug`) may be backed by several
//! [`CanonicalModelProvider`] entries fetched from different gateways. The
//! registry is rebuilt from scratch on every full catalog rebuild; the
//! "building catalog" flag short-circuits enrichers that would otherwise
//! recursively fetch the catalog they are part of building.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Default context length when a gateway does not report one.
pub const DEFAULT_CONTEXT_LENGTH: u32 = 4096;

/// Per-single-token pricing for one model.
///
/// Fields are `None` when the gateway does not publish that component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub prompt: Option<f64>,
    pub completion: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_search: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_reasoning: Option<f64>,
}

impl Pricing {
    pub fn per_token(prompt: f64, completion: f64) -> Self {
        Self {
            prompt: Some(prompt),
            completion: Some(completion),
            ..Default::default()
        }
    }

    /// Reject dynamic pricing.
    ///
    /// Aggregators use `-1` (or other negative values) to mark models whose
    /// price is decided at request time. We cannot meter those, so the whole
    /// record is excluded: returns `None` when any present component is
    /// negative or non-finite.
    pub fn sanitize(self) -> Option<Self> {
        let components = [
            self.prompt,
            self.completion,
            self.request,
            self.image,
            self.web_search,
            self.internal_reasoning,
        ];
        for value in components.into_iter().flatten() {
            if value < 0.0 || !value.is_finite() {
                return None;
            }
        }
        Some(self)
    }

    /// Both prompt and completion published and zero.
    pub fn is_zero_priced(&self) -> bool {
        (self.prompt.is_some() || self.completion.is_some())
            && self.prompt.unwrap_or(0.0) == 0.0
            && self.completion.unwrap_or(0.0) == 0.0
    }

    /// Prompt and completion prices both known.
    pub fn is_usable(&self) -> bool {
        self.prompt.is_some() && self.completion.is_some()
    }

    /// Combined per-token price used for cheapest-first provider ordering.
    pub fn combined(&self) -> f64 {
        self.prompt.unwrap_or(0.0) + self.completion.unwrap_or(0.0)
    }
}

/// Modality and tokenizer metadata for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Architecture {
    pub modality: String,
    pub input_modalities: Vec<String>,
    pub output_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokenizer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instruct_type: Option<String>,
}

impl Default for Architecture {
    fn default() -> Self {
        Self {
            modality: "text->text".to_string(),
            input_modalities: vec!["text".to_string()],
            output_modalities: vec!["text".to_string()],
            tokenizer: None,
            instruct_type: None,
        }
    }
}

/// Canonical, gateway-neutral description of one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    /// Provider-scoped identifier, e.g. `openai/gpt-4o`
    pub id: String,
    pub slug: String,
    pub canonical_slug: String,
    pub name: String,
    pub description: String,
    pub context_length: u32,
    pub architecture: Architecture,
    /// Per-single-token pricing; `None` when the gateway published nothing
    pub pricing: Option<Pricing>,
    #[serde(default)]
    pub supported_parameters: Vec<String>,
    #[serde(default)]
    pub default_parameters: serde_json::Value,
    /// Entity actually running the model, extracted from the id prefix
    pub provider_slug: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_site_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_logo_url: Option<String>,
    /// Gateway this record was fetched from; may differ from provider_slug
    pub source_gateway: String,
    /// Allowlisted legitimately-free model (e.g. OpenRouter `:free` ids)
    #[serde(default)]
    pub is_free: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
}

impl ModelRecord {
    /// Derive the provider slug from a model id prefix, falling back to the
    /// source gateway when the id carries no prefix.
    pub fn provider_from_id(id: &str, source_gateway: &str) -> String {
        match id.split_once('/') {
            Some((prefix, _)) if !prefix.is_empty() => prefix.to_string(),
            _ => source_gateway.to_string(),
        }
    }

    /// Fill derived fields so that normalizing twice yields an equal record.
    pub fn normalized(mut self) -> Self {
        if self.slug.is_empty() {
            self.slug = self.id.clone();
        }
        if self.canonical_slug.is_empty() {
            self.canonical_slug = self.slug.clone();
        }
        if self.provider_slug.is_empty() {
            self.provider_slug = Self::provider_from_id(&self.id, &self.source_gateway);
        }
        if self.name.is_empty() {
            self.name = self
                .id
                .rsplit('/')
                .next()
                .unwrap_or(&self.id)
                .replace(['-', '_'], " ");
        }
        if self.context_length == 0 {
            self.context_length = DEFAULT_CONTEXT_LENGTH;
        }
        self
    }
}

/// One gateway's offering of a canonical model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalModelProvider {
    pub provider_slug: String,
    pub native_model_id: String,
    pub context_length: u32,
    pub pricing: Option<Pricing>,
    pub source_gateway: String,
    /// Exponential moving average of observed call latency, for ordering
    #[serde(default)]
    pub average_latency_ms: f64,
}

/// Deduplicated model identity across gateways.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalModel {
    pub canonical_id: String,
    pub name: String,
    pub description: String,
    pub providers: Vec<CanonicalModelProvider>,
}

/// Provider ordering policy for [`ModelRegistry::providers_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    /// Cheapest combined per-token price first, latency as tie-break
    #[default]
    Cost,
    /// Lowest observed latency first
    Latency,
    /// Explicit provider preference, then cost
    Preferred,
}

/// Process-wide canonical model registry.
///
/// Reset at the start of each full catalog rebuild and repopulated as the
/// per-gateway fetchers complete. All mutation is lock-free per entry; the
/// building flag is a plain atomic because it only gates re-entrance.
pub struct ModelRegistry {
    canonical: DashMap<String, CanonicalModel>,
    building: AtomicBool,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            canonical: DashMap::new(),
            building: AtomicBool::new(false),
        }
    }

    /// Drop all canonical identities. Called before a full rebuild.
    pub fn reset_canonical_models(&self) {
        self.canonical.clear();
        tracing::debug!("canonical model registry reset");
    }

    /// Whether a full catalog build is currently in progress.
    ///
    /// Enrichers consult this to avoid recursively fetching the catalog they
    /// are helping to build.
    pub fn is_building(&self) -> bool {
        self.building.load(Ordering::Acquire)
    }

    /// Mark a catalog build in progress; the guard clears the flag on drop.
    pub fn begin_build(self: &Arc<Self>) -> BuildGuard {
        self.building.store(true, Ordering::Release);
        BuildGuard {
            registry: Arc::clone(self),
        }
    }

    /// Register records fetched from one gateway.
    ///
    /// Records without a canonical id are skipped. An existing provider
    /// entry for the same gateway is replaced rather than duplicated.
    pub fn register_canonical_records(&self, provider_slug: &str, records: &[ModelRecord]) {
        for record in records {
            let canonical_id = if record.canonical_slug.is_empty() {
                if record.id.is_empty() {
                    continue;
                }
                record.id.clone()
            } else {
                record.canonical_slug.clone()
            };

            let provider = CanonicalModelProvider {
                provider_slug: provider_slug.to_string(),
                native_model_id: record.id.clone(),
                context_length: record.context_length,
                pricing: record.pricing.clone(),
                source_gateway: record.source_gateway.clone(),
                average_latency_ms: 0.0,
            };

            let mut entry = self
                .canonical
                .entry(canonical_id.clone())
                .or_insert_with(|| CanonicalModel {
                    canonical_id,
                    name: record.name.clone(),
                    description: record.description.clone(),
                    providers: Vec::new(),
                });

            match entry
                .providers
                .iter_mut()
                .find(|p| p.provider_slug == provider.provider_slug)
            {
                Some(existing) => {
                    let latency = existing.average_latency_ms;
                    *existing = provider;
                    existing.average_latency_ms = latency;
                }
                None => entry.providers.push(provider),
            }
        }
    }

    /// Look up a canonical model. Only ids with at least one registered
    /// provider are advertised.
    pub fn get_model(&self, canonical_id: &str) -> Option<CanonicalModel> {
        self.canonical
            .get(canonical_id)
            .filter(|m| !m.providers.is_empty())
            .map(|m| m.clone())
    }

    /// Ordered provider candidates for a canonical model.
    pub fn providers_for(
        &self,
        canonical_id: &str,
        policy: SelectionPolicy,
        preferred: Option<&str>,
    ) -> Vec<CanonicalModelProvider> {
        let Some(model) = self.get_model(canonical_id) else {
            return Vec::new();
        };
        let mut providers = model.providers;

        providers.sort_by(|a, b| {
            let cost = |p: &CanonicalModelProvider| {
                p.pricing.as_ref().map(|pr| pr.combined()).unwrap_or(f64::MAX)
            };
            match policy {
                SelectionPolicy::Latency => a
                    .average_latency_ms
                    .total_cmp(&b.average_latency_ms)
                    .then(cost(a).total_cmp(&cost(b))),
                SelectionPolicy::Cost | SelectionPolicy::Preferred => cost(a)
                    .total_cmp(&cost(b))
                    .then(a.average_latency_ms.total_cmp(&b.average_latency_ms)),
            }
        });

        if let Some(preferred) = preferred {
            if let Some(pos) = providers.iter().position(|p| p.provider_slug == preferred) {
                let chosen = providers.remove(pos);
                providers.insert(0, chosen);
            }
        }

        providers
    }

    /// Record an observed call latency for provider ordering.
    pub fn record_latency(&self, canonical_id: &str, provider_slug: &str, latency_ms: u64) {
        if let Some(mut entry) = self.canonical.get_mut(canonical_id) {
            if let Some(provider) = entry
                .providers
                .iter_mut()
                .find(|p| p.provider_slug == provider_slug)
            {
                let alpha = 0.1;
                provider.average_latency_ms =
                    alpha * latency_ms as f64 + (1.0 - alpha) * provider.average_latency_ms;
            }
        }
    }

    /// Snapshot of every advertised canonical model.
    pub fn canonical_snapshot(&self) -> Vec<CanonicalModel> {
        self.canonical
            .iter()
            .filter(|e| !e.providers.is_empty())
            .map(|e| e.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.canonical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.canonical.is_empty()
    }
}

/// RAII guard for the building-catalog flag.
pub struct BuildGuard {
    registry: Arc<ModelRegistry>,
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        self.registry.building.store(false, Ordering::Release);
    }
}
