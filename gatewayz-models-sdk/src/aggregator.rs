//! # Catalog Aggregator
//!
//! Produces the unified model list across all active gateways while keeping
//! tail latency bounded:
//!
//! 1. Build the candidate set, skipping gateways whose circuit breaker is
//!    open or whose Retry-After deadline has not elapsed (each skip logged
//!    with the remaining time).
//! 2. Fan out one fetch per candidate over a bounded worker pool (default
//!    12) and process results **in completion order**, so one slow gateway
//!    cannot block the fast ones.
//! 3. Enforce the overall deadline; gateways still pending when it fires
//!    count as timeout failures in their breakers.
//! 4. Cache the merged list with stale-while-revalidate semantics (typical
//!    ttl 1 h, stale 2 h) and rebuild the canonical registry on every full
//!    rebuild.
//!
//! Per-gateway reads go through the same [`GatewayCache`] state machine:
//! fresh data returns immediately, stale data returns while exactly one
//! background refresh is scheduled, and error backoffs serve whatever stale
//! data exists rather than hammering a failing upstream.

use crate::cache::{CacheRead, GatewayCache, RefreshPool};
use crate::catalog::{ModelRecord, ModelRegistry};
use crate::circuit_breaker::{ProviderCircuitBreaker, RetryAfterMap};
use crate::error::ProviderError;
use crate::fetchers::{apply_catalog_rules, CatalogFetcher, ManualPricingOverlay};
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Catalog fan-out and caching parameters.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub ttl: Duration,
    pub stale_ttl: Duration,
    pub fetch_workers: usize,
    pub refresh_workers: usize,
    pub per_provider_timeout: Duration,
    pub overall_timeout: Duration,
    /// Error backoff for ordinary fetch failures
    pub error_backoff: Duration,
    /// Error backoff for quota-exceeded failures (Alibaba-style)
    pub quota_backoff: Duration,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            stale_ttl: Duration::from_secs(7200),
            fetch_workers: 12,
            refresh_workers: 4,
            per_provider_timeout: Duration::from_secs(15),
            overall_timeout: Duration::from_secs(30),
            error_backoff: Duration::from_secs(60),
            quota_backoff: Duration::from_secs(15 * 60),
        }
    }
}

/// Source of the last persisted catalog snapshot per gateway, used when a
/// live fetch fails. Implemented by the gateway's storage layer.
#[async_trait::async_trait]
pub trait CatalogSnapshotSource: Send + Sync {
    async fn snapshot(&self, gateway: &str) -> Option<Vec<ModelRecord>>;
}

/// The process-wide catalog service.
pub struct CatalogService {
    config: CatalogConfig,
    fetchers: HashMap<String, Arc<dyn CatalogFetcher>>,
    caches: DashMap<String, Arc<GatewayCache<Vec<ModelRecord>>>>,
    merged: GatewayCache<Vec<ModelRecord>>,
    registry: Arc<ModelRegistry>,
    breaker: Arc<ProviderCircuitBreaker>,
    retry_after: Arc<RetryAfterMap>,
    overlay: ManualPricingOverlay,
    snapshot_source: Option<Arc<dyn CatalogSnapshotSource>>,
    refresh_pool: RefreshPool,
    /// Observer for classified fetch failures, used for metrics counters
    failure_hook: Option<Arc<dyn Fn(&str, &str) + Send + Sync>>,
}

impl CatalogService {
    pub fn new(
        config: CatalogConfig,
        registry: Arc<ModelRegistry>,
        breaker: Arc<ProviderCircuitBreaker>,
        retry_after: Arc<RetryAfterMap>,
        overlay: ManualPricingOverlay,
        snapshot_source: Option<Arc<dyn CatalogSnapshotSource>>,
    ) -> Self {
        let merged = GatewayCache::new(config.ttl, config.stale_ttl);
        let refresh_pool = RefreshPool::new(config.refresh_workers);
        Self {
            config,
            fetchers: HashMap::new(),
            caches: DashMap::new(),
            merged,
            registry,
            breaker,
            retry_after,
            overlay,
            snapshot_source,
            refresh_pool,
            failure_hook: None,
        }
    }

    pub fn add_fetcher(&mut self, fetcher: Arc<dyn CatalogFetcher>) {
        self.fetchers.insert(fetcher.gateway().to_string(), fetcher);
    }

    /// Observe classified fetch failures, e.g. to bump metrics counters.
    pub fn set_failure_hook(&mut self, hook: Arc<dyn Fn(&str, &str) + Send + Sync>) {
        self.failure_hook = Some(hook);
    }

    fn observe_failure(&self, gateway: &str, category: &str) {
        if let Some(hook) = &self.failure_hook {
            hook(gateway, category);
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn breaker(&self) -> &Arc<ProviderCircuitBreaker> {
        &self.breaker
    }

    pub fn gateways(&self) -> Vec<String> {
        self.fetchers.keys().cloned().collect()
    }

    fn cache_for(&self, gateway: &str) -> Arc<GatewayCache<Vec<ModelRecord>>> {
        self.caches
            .entry(gateway.to_string())
            .or_insert_with(|| {
                Arc::new(GatewayCache::new(self.config.ttl, self.config.stale_ttl))
            })
            .clone()
    }

    /// Models for one gateway, stale-while-revalidate.
    pub async fn models_for_gateway(self: &Arc<Self>, gateway: &str) -> Vec<ModelRecord> {
        let cache = self.cache_for(gateway);
        match cache.read() {
            CacheRead::Fresh(data) => {
                self.registry.register_canonical_records(gateway, &data);
                (*data).clone()
            }
            CacheRead::Stale(data) => {
                self.schedule_refresh(gateway);
                self.registry.register_canonical_records(gateway, &data);
                (*data).clone()
            }
            CacheRead::ErrorBackoff { message, stale } => {
                tracing::debug!(
                    gateway = %gateway,
                    error = %message,
                    "gateway in error backoff, serving cached data"
                );
                match stale {
                    Some(data) => {
                        self.registry.register_canonical_records(gateway, &data);
                        (*data).clone()
                    }
                    None => Vec::new(),
                }
            }
            CacheRead::Empty => self.fetch_gateway(gateway).await,
        }
    }

    fn schedule_refresh(self: &Arc<Self>, gateway: &str) {
        let cache = self.cache_for(gateway);
        if !cache.try_begin_refresh() {
            return;
        }
        let service = Arc::clone(self);
        let gateway = gateway.to_string();
        self.refresh_pool.spawn(gateway.clone(), async move {
            service.fetch_gateway(&gateway).await;
            service.cache_for(&gateway).end_refresh();
        });
    }

    /// Foreground fetch for one gateway, honoring breaker and retry-after
    /// state, falling back to stale data or the persisted snapshot.
    async fn fetch_gateway(&self, gateway: &str) -> Vec<ModelRecord> {
        if self.breaker.should_skip(gateway) {
            tracing::debug!(gateway = %gateway, "skipping fetch, circuit breaker open");
            return self.fallback_records(gateway).await;
        }
        if let Some(remaining) = self.retry_after.remaining(gateway) {
            tracing::info!(
                gateway = %gateway,
                remaining_s = remaining.as_secs_f64(),
                "skipping fetch, Retry-After deadline not elapsed"
            );
            return self.fallback_records(gateway).await;
        }
        let Some(fetcher) = self.fetchers.get(gateway) else {
            tracing::warn!(gateway = %gateway, "no fetcher registered");
            return Vec::new();
        };

        let cache = self.cache_for(gateway);
        let start = Instant::now();
        let result =
            tokio::time::timeout(self.config.per_provider_timeout, fetcher.fetch()).await;
        let elapsed = start.elapsed();

        match result {
            Ok(Ok(records)) => {
                let records = apply_catalog_rules(
                    gateway,
                    records,
                    &self.overlay,
                    self.registry.is_building(),
                );
                tracing::info!(
                    gateway = %gateway,
                    models = records.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "gateway catalog fetched"
                );
                self.breaker.record_success(gateway);
                cache.set(records.clone());
                self.registry.register_canonical_records(gateway, &records);
                records
            }
            Ok(Err(error)) => {
                let category = error.category();
                tracing::warn!(
                    gateway = %gateway,
                    category = %category,
                    error = %error,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "gateway catalog fetch failed"
                );
                self.breaker.record_failure(gateway, Some(category.as_str()));
                self.observe_failure(gateway, category.as_str());
                if let Some(retry_after) = error.retry_after() {
                    self.retry_after.set_deadline(gateway, retry_after);
                }
                let backoff = if matches!(error, ProviderError::QuotaExceeded) {
                    self.config.quota_backoff
                } else {
                    self.config.error_backoff
                };
                cache.set_error(error.to_string(), backoff);
                self.fallback_records(gateway).await
            }
            Err(_) => {
                tracing::warn!(
                    gateway = %gateway,
                    timeout_s = self.config.per_provider_timeout.as_secs_f64(),
                    "gateway catalog fetch timed out"
                );
                self.breaker.record_failure(gateway, Some("timeout"));
                self.observe_failure(gateway, "timeout");
                cache.set_error("fetch timed out", self.config.error_backoff);
                self.fallback_records(gateway).await
            }
        }
    }

    /// Stale cache first, then the persisted snapshot re-run through the
    /// normal normalization rules.
    async fn fallback_records(&self, gateway: &str) -> Vec<ModelRecord> {
        if let Some(data) = self.cache_for(gateway).read().data() {
            self.registry.register_canonical_records(gateway, &data);
            return (*data).clone();
        }

        if let Some(source) = &self.snapshot_source {
            if let Some(snapshot) = source.snapshot(gateway).await {
                tracing::info!(
                    gateway = %gateway,
                    models = snapshot.len(),
                    "serving persisted catalog snapshot"
                );
                let records =
                    apply_catalog_rules(gateway, snapshot, &self.overlay, true);
                self.registry.register_canonical_records(gateway, &records);
                return records;
            }
        }

        Vec::new()
    }

    /// The aggregated catalog across all gateways, stale-while-revalidate.
    pub async fn get_all_models(self: &Arc<Self>) -> Vec<ModelRecord> {
        match self.merged.read() {
            CacheRead::Fresh(data) => (*data).clone(),
            CacheRead::Stale(data) => {
                if self.merged.try_begin_refresh() {
                    let service = Arc::clone(self);
                    self.refresh_pool.spawn("__all__".to_string(), async move {
                        service.rebuild_catalog().await;
                        service.merged.end_refresh();
                    });
                }
                (*data).clone()
            }
            CacheRead::ErrorBackoff { stale, .. } => {
                stale.map(|d| (*d).clone()).unwrap_or_default()
            }
            CacheRead::Empty => self.rebuild_catalog().await,
        }
    }

    /// Full fan-out rebuild. Resets the canonical registry first; fetchers
    /// re-register their records as they complete.
    async fn rebuild_catalog(self: &Arc<Self>) -> Vec<ModelRecord> {
        self.registry.reset_canonical_models();
        let _build = self.registry.begin_build();

        let mut candidates = Vec::new();
        for gateway in self.fetchers.keys() {
            if self.breaker.should_skip(gateway) {
                tracing::info!(gateway = %gateway, "skipping gateway in rebuild, circuit open");
                continue;
            }
            if let Some(remaining) = self.retry_after.remaining(gateway) {
                tracing::info!(
                    gateway = %gateway,
                    remaining_s = remaining.as_secs_f64(),
                    "skipping gateway in rebuild, Retry-After pending"
                );
                continue;
            }
            candidates.push(gateway.clone());
        }

        tracing::info!(
            candidates = candidates.len(),
            total = self.fetchers.len(),
            "starting parallel catalog rebuild"
        );
        let start = Instant::now();

        let mut merged: Vec<ModelRecord> = Vec::new();
        let mut completed: HashSet<String> = HashSet::new();

        {
            let mut fetches = futures::stream::iter(candidates.iter().cloned().map(|gateway| {
                let service = Arc::clone(self);
                async move {
                    let records = service.fetch_gateway(&gateway).await;
                    (gateway, records)
                }
            }))
            .buffer_unordered(self.config.fetch_workers.max(1));

            let deadline = tokio::time::sleep(self.config.overall_timeout);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    next = fetches.next() => {
                        match next {
                            Some((gateway, records)) => {
                                completed.insert(gateway);
                                merged.extend(records);
                            }
                            None => break,
                        }
                    }
                    _ = &mut deadline => {
                        tracing::warn!(
                            timeout_s = self.config.overall_timeout.as_secs_f64(),
                            "overall catalog rebuild deadline reached"
                        );
                        break;
                    }
                }
            }
        }

        for gateway in &candidates {
            if !completed.contains(gateway) {
                self.breaker.record_failure(gateway, Some("overall_timeout"));
                self.observe_failure(gateway, "timeout");
            }
        }

        tracing::info!(
            gateways = completed.len(),
            models = merged.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "catalog rebuild complete"
        );

        self.merged.set(merged.clone());
        merged
    }

    /// Force the next read to rebuild. Used by admin cache invalidation.
    pub fn invalidate(&self, gateway: Option<&str>) {
        match gateway {
            Some(gateway) => {
                if let Some(cache) = self.caches.get(gateway) {
                    cache.clear();
                }
            }
            None => {
                for cache in self.caches.iter() {
                    cache.clear();
                }
                self.merged.clear();
            }
        }
    }
}
