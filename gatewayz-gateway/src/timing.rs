//! Slow-provider call tracking.
//!
//! Inference calls are timed around the provider roundtrip; calls crossing
//! the 30/45/60 second thresholds log at warn/error/critical and increment
//! per-provider slow counters surfaced by `/api/diagnostics/provider-timing`.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::OnceLock;
use std::time::Duration;

pub const SLOW_THRESHOLD: Duration = Duration::from_secs(30);
pub const VERY_SLOW_THRESHOLD: Duration = Duration::from_secs(45);
pub const CRITICAL_THRESHOLD: Duration = Duration::from_secs(60);

static TRACKER: OnceLock<ProviderTimingTracker> = OnceLock::new();

pub fn timing_tracker() -> &'static ProviderTimingTracker {
    TRACKER.get_or_init(ProviderTimingTracker::new)
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ProviderTiming {
    pub total_calls: u64,
    pub slow_calls: u64,
    pub very_slow_calls: u64,
    pub critical_calls: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderTimingSnapshot {
    pub provider: String,
    pub total_calls: u64,
    pub slow_calls: u64,
    pub very_slow_calls: u64,
    pub critical_calls: u64,
    pub average_ms: f64,
    pub max_ms: u64,
}

pub struct ProviderTimingTracker {
    stats: DashMap<String, ProviderTiming>,
}

impl Default for ProviderTimingTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderTimingTracker {
    pub fn new() -> Self {
        Self {
            stats: DashMap::new(),
        }
    }

    pub fn record(&self, provider: &str, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        let mut entry = self.stats.entry(provider.to_string()).or_default();
        entry.total_calls += 1;
        entry.total_ms += ms;
        entry.max_ms = entry.max_ms.max(ms);

        if elapsed >= CRITICAL_THRESHOLD {
            entry.critical_calls += 1;
            tracing::error!(
                provider = %provider,
                elapsed_s = elapsed.as_secs_f64(),
                "provider call critically slow"
            );
        } else if elapsed >= VERY_SLOW_THRESHOLD {
            entry.very_slow_calls += 1;
            tracing::error!(
                provider = %provider,
                elapsed_s = elapsed.as_secs_f64(),
                "provider call very slow"
            );
        } else if elapsed >= SLOW_THRESHOLD {
            entry.slow_calls += 1;
            tracing::warn!(
                provider = %provider,
                elapsed_s = elapsed.as_secs_f64(),
                "provider call slow"
            );
        }
    }

    pub fn snapshot(&self) -> Vec<ProviderTimingSnapshot> {
        let mut snapshots: Vec<ProviderTimingSnapshot> = self
            .stats
            .iter()
            .map(|entry| {
                let timing = entry.value();
                ProviderTimingSnapshot {
                    provider: entry.key().clone(),
                    total_calls: timing.total_calls,
                    slow_calls: timing.slow_calls,
                    very_slow_calls: timing.very_slow_calls,
                    critical_calls: timing.critical_calls,
                    average_ms: if timing.total_calls > 0 {
                        timing.total_ms as f64 / timing.total_calls as f64
                    } else {
                        0.0
                    },
                    max_ms: timing.max_ms,
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.provider.cmp(&b.provider));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_buckets() {
        let tracker = ProviderTimingTracker::new();
        tracker.record("openrouter", Duration::from_secs(1));
        tracker.record("openrouter", Duration::from_secs(35));
        tracker.record("openrouter", Duration::from_secs(50));
        tracker.record("openrouter", Duration::from_secs(70));

        let snapshot = &tracker.snapshot()[0];
        assert_eq!(snapshot.total_calls, 4);
        assert_eq!(snapshot.slow_calls, 1);
        assert_eq!(snapshot.very_slow_calls, 1);
        assert_eq!(snapshot.critical_calls, 1);
        assert_eq!(snapshot.max_ms, 70_000);
    }
}
