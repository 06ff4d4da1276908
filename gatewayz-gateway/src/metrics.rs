//! # Gateway Metrics
//!
//! Process-wide counters and gauges behind a `OnceLock`, rendered in
//! Prometheus text format by the `/metrics` handler. The names match the
//! operational dashboards:
//!
//! - `concurrency_active_requests` / `concurrency_queued_requests` - gauges
//!   maintained by the admission gate
//! - `concurrency_rejected_total{reason}` - overload rejections, labeled
//!   `queue_full` or `queue_timeout`
//! - `rate_limited_requests_total{limit_type}` - behavioral limiter hits
//! - `catalog_fetch_failures_total{gateway,category}` - classified fetch
//!   failures feeding the circuit breakers
//! - `api_key_lookup_attempts_total{status}` - lookup retry outcomes
//! - `http_requests_total{status_class}` - coarse request accounting

use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

static METRICS: OnceLock<GatewayMetrics> = OnceLock::new();

/// The global metrics collector.
pub fn metrics() -> &'static GatewayMetrics {
    METRICS.get_or_init(GatewayMetrics::new)
}

pub struct GatewayMetrics {
    start: Instant,
    concurrency_active: AtomicI64,
    concurrency_queued: AtomicI64,
    concurrency_rejected: DashMap<String, AtomicU64>,
    rate_limited: DashMap<String, AtomicU64>,
    requests_by_class: DashMap<String, AtomicU64>,
    catalog_failures: DashMap<(String, String), AtomicU64>,
    api_key_lookups: DashMap<String, AtomicU64>,
}

impl GatewayMetrics {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            concurrency_active: AtomicI64::new(0),
            concurrency_queued: AtomicI64::new(0),
            concurrency_rejected: DashMap::new(),
            rate_limited: DashMap::new(),
            requests_by_class: DashMap::new(),
            catalog_failures: DashMap::new(),
            api_key_lookups: DashMap::new(),
        }
    }

    pub fn inc_active(&self) {
        self.concurrency_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active(&self) {
        self.concurrency_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_queued(&self) {
        self.concurrency_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_queued(&self) {
        self.concurrency_queued.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_requests(&self) -> i64 {
        self.concurrency_active.load(Ordering::Relaxed)
    }

    pub fn queued_requests(&self) -> i64 {
        self.concurrency_queued.load(Ordering::Relaxed)
    }

    pub fn inc_rejected(&self, reason: &str) {
        bump(&self.concurrency_rejected, reason.to_string());
    }

    pub fn inc_rate_limited(&self, limit_type: &str) {
        bump(&self.rate_limited, limit_type.to_string());
    }

    pub fn record_request(&self, status: u16) {
        let class = format!("{}xx", status / 100);
        bump(&self.requests_by_class, class);
    }

    pub fn inc_catalog_failure(&self, gateway: &str, category: &str) {
        self.catalog_failures
            .entry((gateway.to_string(), category.to_string()))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_api_key_lookup(&self, status: &str) {
        bump(&self.api_key_lookups, status.to_string());
    }

    /// Render everything in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(2048);

        out.push_str("# TYPE concurrency_active_requests gauge\n");
        out.push_str(&format!(
            "concurrency_active_requests {}\n",
            self.active_requests()
        ));
        out.push_str("# TYPE concurrency_queued_requests gauge\n");
        out.push_str(&format!(
            "concurrency_queued_requests {}\n",
            self.queued_requests()
        ));

        out.push_str("# TYPE concurrency_rejected_total counter\n");
        for entry in self.concurrency_rejected.iter() {
            out.push_str(&format!(
                "concurrency_rejected_total{{reason=\"{}\"}} {}\n",
                entry.key(),
                entry.value().load(Ordering::Relaxed)
            ));
        }

        out.push_str("# TYPE rate_limited_requests_total counter\n");
        for entry in self.rate_limited.iter() {
            out.push_str(&format!(
                "rate_limited_requests_total{{limit_type=\"{}\"}} {}\n",
                entry.key(),
                entry.value().load(Ordering::Relaxed)
            ));
        }

        out.push_str("# TYPE http_requests_total counter\n");
        for entry in self.requests_by_class.iter() {
            out.push_str(&format!(
                "http_requests_total{{status_class=\"{}\"}} {}\n",
                entry.key(),
                entry.value().load(Ordering::Relaxed)
            ));
        }

        out.push_str("# TYPE catalog_fetch_failures_total counter\n");
        for entry in self.catalog_failures.iter() {
            let (gateway, category) = entry.key();
            out.push_str(&format!(
                "catalog_fetch_failures_total{{gateway=\"{gateway}\",category=\"{category}\"}} {}\n",
                entry.value().load(Ordering::Relaxed)
            ));
        }

        out.push_str("# TYPE api_key_lookup_attempts_total counter\n");
        for entry in self.api_key_lookups.iter() {
            out.push_str(&format!(
                "api_key_lookup_attempts_total{{status=\"{}\"}} {}\n",
                entry.key(),
                entry.value().load(Ordering::Relaxed)
            ));
        }

        out.push_str("# TYPE gateway_uptime_seconds gauge\n");
        out.push_str(&format!(
            "gateway_uptime_seconds {}\n",
            self.start.elapsed().as_secs()
        ));

        out
    }
}

fn bump(map: &DashMap<String, AtomicU64>, key: String) {
    map.entry(key)
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauges_and_counters_render() {
        let m = GatewayMetrics::new();
        m.inc_active();
        m.inc_active();
        m.dec_active();
        m.inc_queued();
        m.inc_rejected("queue_full");
        m.inc_rejected("queue_full");
        m.inc_rate_limited("security_limit");
        m.record_request(200);
        m.record_request(503);
        m.inc_catalog_failure("openrouter", "timeout");
        m.inc_api_key_lookup("success");

        let rendered = m.render_prometheus();
        assert!(rendered.contains("concurrency_active_requests 1"));
        assert!(rendered.contains("concurrency_queued_requests 1"));
        assert!(rendered.contains("concurrency_rejected_total{reason=\"queue_full\"} 2"));
        assert!(rendered.contains("rate_limited_requests_total{limit_type=\"security_limit\"} 1"));
        assert!(rendered.contains("http_requests_total{status_class=\"5xx\"} 1"));
        assert!(rendered
            .contains("catalog_fetch_failures_total{gateway=\"openrouter\",category=\"timeout\"} 1"));
        assert!(rendered.contains("api_key_lookup_attempts_total{status=\"success\"} 1"));
    }
}
