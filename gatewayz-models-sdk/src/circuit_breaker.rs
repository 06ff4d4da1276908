//! # Per-Provider Circuit Breakers
//!
//! Stops sending work to an upstream that is consistently failing. One
//! registry tracks every provider; there is no per-provider object to wire
//! through call sites.
//!
//! ## State machine
//!
//! - **closed**: requests attempted; a success zeroes `consecutive_failures`,
//!   a failure increments it, and reaching `failure_threshold` opens the
//!   circuit and stamps `last_failure_time`.
//! - **open**: [`ProviderCircuitBreaker::should_skip`] returns `true` until
//!   `recovery_timeout` has elapsed since the last failure; the first caller
//!   after that probes (half-open).
//! - **half-open**: one probe allowed. Success closes the circuit; failure
//!   re-opens it with a fresh `last_failure_time`.
//!
//! The open → half-open transition is eager: whichever caller checks first
//! after the timeout gets the probe. The registry mutex serializes that
//! check, and the circuit closes on the first success, so only one probe is
//! in flight at a time.
//!
//! Idempotence: `record_success` after close only updates counters;
//! `record_failure` while open updates counters without re-stamping the open
//! transition.
//!
//! ## Retry-After deadlines
//!
//! A separate [`RetryAfterMap`] stores per-provider "skip until" deadlines
//! populated from upstream 429 Retry-After headers. It is availability
//! bookkeeping with an exact upstream-provided horizon, which is why it does
//! not share the breaker's failure counters.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Circuit breaker tuning parameters.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long an open circuit blocks before allowing a probe
    pub recovery_timeout: Duration,
    /// Successes required in half-open to close (first success closes)
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(300),
            success_threshold: 1,
        }
    }
}

/// Health state tracked per provider.
#[derive(Debug, Clone, Default)]
pub struct ProviderState {
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_requests: u64,
    pub last_failure_time: Option<Instant>,
    pub last_success_time: Option<Instant>,
    pub is_open: bool,
}

/// Serializable status snapshot for diagnostics endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub provider: String,
    pub is_open: bool,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_requests: u64,
    pub failure_rate: f64,
    pub seconds_since_last_failure: Option<f64>,
    pub seconds_since_last_success: Option<f64>,
}

/// Registry of circuit breakers keyed by provider slug.
pub struct ProviderCircuitBreaker {
    config: CircuitBreakerConfig,
    states: Mutex<HashMap<String, ProviderState>>,
}

impl Default for ProviderCircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl ProviderCircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        tracing::info!(
            failure_threshold = config.failure_threshold,
            recovery_timeout_s = config.recovery_timeout.as_secs(),
            "circuit breaker initialized"
        );
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Whether requests to this provider should be skipped.
    ///
    /// Returns `false` for closed circuits and for open circuits whose
    /// recovery timeout has elapsed (the caller becomes the half-open probe).
    pub fn should_skip(&self, provider: &str) -> bool {
        let mut states = self.states.lock().unwrap();
        let state = states.entry(provider.to_string()).or_default();

        if !state.is_open {
            return false;
        }

        let elapsed = state
            .last_failure_time
            .map(|t| t.elapsed())
            .unwrap_or(Duration::MAX);
        if elapsed >= self.config.recovery_timeout {
            tracing::info!(
                provider = %provider,
                elapsed_s = elapsed.as_secs_f64(),
                "circuit breaker half-open, allowing probe"
            );
            return false;
        }

        tracing::debug!(
            provider = %provider,
            remaining_s = (self.config.recovery_timeout - elapsed).as_secs_f64(),
            "circuit breaker open, skipping provider"
        );
        true
    }

    /// Record a successful request. Closes the circuit if it was open.
    pub fn record_success(&self, provider: &str) {
        let mut states = self.states.lock().unwrap();
        let state = states.entry(provider.to_string()).or_default();
        state.last_success_time = Some(Instant::now());
        state.consecutive_failures = 0;
        state.total_requests += 1;

        if state.is_open {
            state.is_open = false;
            tracing::info!(provider = %provider, "circuit breaker closed after successful probe");
        }
    }

    /// Record a failed request. Opens the circuit at the threshold; while
    /// already open only the counters advance.
    pub fn record_failure(&self, provider: &str, error: Option<&str>) {
        let mut states = self.states.lock().unwrap();
        let state = states.entry(provider.to_string()).or_default();
        state.consecutive_failures += 1;
        state.total_failures += 1;
        state.total_requests += 1;
        state.last_failure_time = Some(Instant::now());

        if state.consecutive_failures >= self.config.failure_threshold && !state.is_open {
            state.is_open = true;
            tracing::warn!(
                provider = %provider,
                consecutive_failures = state.consecutive_failures,
                error = error.unwrap_or("unknown"),
                "circuit breaker opened"
            );
        }
    }

    /// Manually reset one provider's circuit.
    pub fn reset(&self, provider: &str) {
        let mut states = self.states.lock().unwrap();
        if states.remove(provider).is_some() {
            tracing::info!(provider = %provider, "circuit breaker reset");
        }
    }

    pub fn reset_all(&self) {
        self.states.lock().unwrap().clear();
        tracing::info!("all circuit breakers reset");
    }

    pub fn status(&self, provider: &str) -> ProviderStatus {
        let states = self.states.lock().unwrap();
        let state = states.get(provider).cloned().unwrap_or_default();
        Self::status_from(provider, &state)
    }

    pub fn all_status(&self) -> Vec<ProviderStatus> {
        let states = self.states.lock().unwrap();
        states
            .iter()
            .map(|(provider, state)| Self::status_from(provider, state))
            .collect()
    }

    /// Providers whose circuits are currently open.
    pub fn open_circuits(&self) -> Vec<String> {
        let states = self.states.lock().unwrap();
        states
            .iter()
            .filter(|(_, s)| s.is_open)
            .map(|(p, _)| p.clone())
            .collect()
    }

    fn status_from(provider: &str, state: &ProviderState) -> ProviderStatus {
        ProviderStatus {
            provider: provider.to_string(),
            is_open: state.is_open,
            consecutive_failures: state.consecutive_failures,
            total_failures: state.total_failures,
            total_requests: state.total_requests,
            failure_rate: if state.total_requests > 0 {
                state.total_failures as f64 / state.total_requests as f64
            } else {
                0.0
            },
            seconds_since_last_failure: state.last_failure_time.map(|t| t.elapsed().as_secs_f64()),
            seconds_since_last_success: state.last_success_time.map(|t| t.elapsed().as_secs_f64()),
        }
    }
}

/// Per-provider "skip until" deadlines from upstream Retry-After headers.
#[derive(Default)]
pub struct RetryAfterMap {
    deadlines: Mutex<HashMap<String, Instant>>,
}

impl RetryAfterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Honor a Retry-After from an upstream 429.
    pub fn set_deadline(&self, provider: &str, retry_after: Duration) {
        let mut deadlines = self.deadlines.lock().unwrap();
        deadlines.insert(provider.to_string(), Instant::now() + retry_after);
        tracing::warn!(
            provider = %provider,
            retry_after_s = retry_after.as_secs_f64(),
            "provider rate-limited, honoring Retry-After"
        );
    }

    /// Remaining skip time for a provider. Elapsed deadlines are removed.
    pub fn remaining(&self, provider: &str) -> Option<Duration> {
        let mut deadlines = self.deadlines.lock().unwrap();
        match deadlines.get(provider) {
            Some(deadline) => {
                let now = Instant::now();
                if *deadline > now {
                    Some(*deadline - now)
                } else {
                    deadlines.remove(provider);
                    None
                }
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery: Duration) -> ProviderCircuitBreaker {
        ProviderCircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: recovery,
            success_threshold: 1,
        })
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let cb = breaker(3, Duration::from_secs(60));

        cb.record_failure("openrouter", Some("timeout"));
        cb.record_failure("openrouter", Some("timeout"));
        assert!(!cb.should_skip("openrouter"));

        cb.record_failure("openrouter", Some("timeout"));
        assert!(cb.should_skip("openrouter"));
        assert_eq!(cb.open_circuits(), vec!["openrouter".to_string()]);
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let cb = breaker(3, Duration::from_secs(60));

        cb.record_failure("groq", None);
        cb.record_failure("groq", None);
        cb.record_success("groq");
        cb.record_failure("groq", None);
        cb.record_failure("groq", None);
        assert!(!cb.should_skip("groq"));
    }

    #[test]
    fn test_half_open_probe_then_close() {
        let cb = breaker(1, Duration::from_millis(20));

        cb.record_failure("together", None);
        assert!(cb.should_skip("together"));

        std::thread::sleep(Duration::from_millis(30));
        // Recovery elapsed: the next check is the probe
        assert!(!cb.should_skip("together"));

        cb.record_success("together");
        assert!(!cb.should_skip("together"));
        assert!(cb.open_circuits().is_empty());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker(1, Duration::from_millis(20));

        cb.record_failure("nebius", None);
        std::thread::sleep(Duration::from_millis(30));
        assert!(!cb.should_skip("nebius"));

        // Probe fails: circuit re-opens with a fresh deadline
        cb.record_failure("nebius", Some("still down"));
        assert!(cb.should_skip("nebius"));
    }

    #[test]
    fn test_failure_while_open_only_updates_counters() {
        let cb = breaker(1, Duration::from_secs(60));

        cb.record_failure("xai", None);
        assert!(cb.should_skip("xai"));

        cb.record_failure("xai", None);
        let status = cb.status("xai");
        assert!(status.is_open);
        assert_eq!(status.total_failures, 2);
    }

    #[test]
    fn test_success_after_close_is_noop_on_state() {
        let cb = breaker(3, Duration::from_secs(60));
        cb.record_success("fireworks");
        cb.record_success("fireworks");
        let status = cb.status("fireworks");
        assert!(!status.is_open);
        assert_eq!(status.total_requests, 2);
        assert_eq!(status.failure_rate, 0.0);
    }

    #[test]
    fn test_retry_after_deadline_expires() {
        let map = RetryAfterMap::new();
        map.set_deadline("alibaba", Duration::from_millis(20));
        assert!(map.remaining("alibaba").is_some());

        std::thread::sleep(Duration::from_millis(30));
        assert!(map.remaining("alibaba").is_none());
        // Cleared after expiry
        assert!(map.remaining("alibaba").is_none());
    }
}
