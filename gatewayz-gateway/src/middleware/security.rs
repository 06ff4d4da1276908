//! # Behavioral Rate Limiter
//!
//! Front-line defense against bot traffic, IP rotation, and error-spike
//! abuse, running before authentication:
//!
//! - **Tiered IP limits** over a sliding one-minute window: residential
//!   IPs get the standard budget, datacenter-shaped traffic (scripting
//!   user agents, proxy headers, configured ASN keywords) a stricter one.
//! - **Behavioral fingerprinting**: a stable 16-hex-char SHA-256 prefix
//!   over (user-agent, accept-language, accept-encoding) catches bots that
//!   rotate IPs while reusing the same client stack, limited across all
//!   IPs combined.
//! - **Velocity mode**: when system errors (5xx, or 499s slower than five
//!   seconds) exceed a quarter of the traffic in the rolling window with
//!   at least 100 outcomes observed, every limit is halved (minimum 1) for
//!   three minutes.
//!
//! Requests carrying a well-formed gateway key bypass the IP and
//! fingerprint limits; the per-key limits handle those. Counters live in
//! Redis (bucketed INCR + EXPIRE) when configured, else in an in-process
//! map with a periodic sweep.

use crate::config::SecurityConfig;
use crate::gateway_error::{GatewayError, RateLimitKind};
use crate::metrics::metrics;
use crate::server::AppState;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Paths skipped entirely; monitoring must never be rate limited.
const SKIP_PATHS: &[&str] = &["/health", "/metrics", "/ready", "/favicon.ico"];

/// Scripting tools that mark datacenter-shaped traffic.
const SCRIPTING_AGENTS: &[&str] = &["python-requests", "aiohttp", "curl", "postman"];

/// Ring capacity for the velocity outcome record; comfortably above the
/// engagement threshold.
const OUTCOME_RING: usize = 512;

/// A 499 slower than this counts as a system error for velocity purposes.
const SLOW_CANCEL_THRESHOLD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
struct Outcome {
    at: Instant,
    status: u16,
    duration: Duration,
}

impl Outcome {
    fn is_system_error(&self) -> bool {
        self.status >= 500 || (self.status == 499 && self.duration > SLOW_CANCEL_THRESHOLD)
    }
}

/// Bucketed counter backend: Redis when available, in-process otherwise.
pub struct RateLimitStore {
    redis: Option<redis::aio::ConnectionManager>,
    memory: DashMap<String, u32>,
    last_sweep: Mutex<Instant>,
}

impl RateLimitStore {
    pub fn in_memory() -> Self {
        Self {
            redis: None,
            memory: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    pub fn with_redis(conn: redis::aio::ConnectionManager) -> Self {
        Self {
            redis: Some(conn),
            memory: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Increment the counter for `key` in the current window bucket and
    /// return the new count.
    async fn incr(&self, key: &str, window_secs: u64) -> u64 {
        let bucket = unix_now() / window_secs;
        let full_key = format!("sec_rl:{key}:{bucket}");

        if let Some(conn) = &self.redis {
            match Self::incr_redis(conn.clone(), &full_key, window_secs).await {
                Ok(count) => return count,
                Err(e) => {
                    tracing::error!(error = %e, "redis rate-limit backend error, using in-process fallback");
                }
            }
        }

        self.sweep_if_due(bucket, window_secs);
        let mut entry = self.memory.entry(full_key).or_insert(0);
        *entry += 1;
        *entry as u64
    }

    async fn incr_redis(
        mut conn: redis::aio::ConnectionManager,
        key: &str,
        window_secs: u64,
    ) -> redis::RedisResult<u64> {
        let count: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        if count == 1 {
            let _: () = redis::cmd("EXPIRE")
                .arg(key)
                .arg(window_secs * 2)
                .query_async(&mut conn)
                .await?;
        }
        Ok(count as u64)
    }

    /// Drop buckets older than the previous window every five minutes.
    fn sweep_if_due(&self, current_bucket: u64, _window_secs: u64) {
        let mut last = self.last_sweep.lock().unwrap();
        if last.elapsed() < Duration::from_secs(300) {
            return;
        }
        *last = Instant::now();
        drop(last);

        self.memory.retain(|key, _| {
            key.rsplit(':')
                .next()
                .and_then(|b| b.parse::<u64>().ok())
                .map(|bucket| bucket + 1 >= current_bucket)
                .unwrap_or(false)
        });
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

pub struct SecurityLimiter {
    config: SecurityConfig,
    store: RateLimitStore,
    outcomes: Mutex<VecDeque<Outcome>>,
    velocity_until: Mutex<Option<Instant>>,
}

impl SecurityLimiter {
    pub fn new(config: SecurityConfig, store: RateLimitStore) -> Self {
        Self {
            config,
            store,
            outcomes: Mutex::new(VecDeque::with_capacity(OUTCOME_RING)),
            velocity_until: Mutex::new(None),
        }
    }

    /// Stable request "DNA": bots rotating IPs tend to keep the same
    /// client stack, which keeps this stable across their fleet.
    pub fn fingerprint(headers: &HeaderMap) -> String {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("none")
        };
        let raw = format!(
            "{}|{}|{}",
            get("user-agent"),
            get("accept-language"),
            get("accept-encoding")
        );
        let digest = Sha256::digest(raw.as_bytes());
        hex_prefix(&digest, 16)
    }

    /// First hop of X-Forwarded-For when present, else the peer address.
    pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            if let Some(first) = forwarded.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
        peer.map(|p| p.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Datacenter indicators: scripting user agents, proxy headers, or the
    /// configured ASN/keyword list.
    pub fn is_datacenter(&self, headers: &HeaderMap) -> bool {
        let ua = headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();

        if SCRIPTING_AGENTS.iter().any(|tool| ua.contains(tool)) {
            return true;
        }
        if headers.contains_key("x-proxy-id") || headers.contains_key("via") {
            return true;
        }
        self.config
            .datacenter_keywords
            .iter()
            .any(|kw| ua.contains(kw.as_str()))
    }

    /// Record one request outcome for velocity evaluation.
    pub fn record_outcome(&self, status: u16, duration: Duration) {
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.len() == OUTCOME_RING {
            outcomes.pop_front();
        }
        outcomes.push_back(Outcome {
            at: Instant::now(),
            status,
            duration,
        });
    }

    /// Whether velocity mode is currently engaged, engaging it when the
    /// rolling window crosses the error threshold.
    pub fn velocity_engaged(&self) -> bool {
        {
            let until = self.velocity_until.lock().unwrap();
            if let Some(until) = *until {
                if Instant::now() < until {
                    return true;
                }
            }
        }

        let window = self.config.velocity.window;
        let (total, errors) = {
            let mut outcomes = self.outcomes.lock().unwrap();
            while let Some(front) = outcomes.front() {
                if front.at.elapsed() > window {
                    outcomes.pop_front();
                } else {
                    break;
                }
            }
            let total = outcomes.len();
            let errors = outcomes.iter().filter(|o| o.is_system_error()).count();
            (total, errors)
        };

        if total >= self.config.velocity.min_requests
            && errors as f64 > self.config.velocity.error_ratio * total as f64
        {
            let until = Instant::now() + self.config.velocity.duration;
            *self.velocity_until.lock().unwrap() = Some(until);
            tracing::warn!(
                total,
                errors,
                duration_s = self.config.velocity.duration.as_secs(),
                "velocity mode engaged, tightening all limits"
            );
            return true;
        }
        false
    }

    fn effective_limit(&self, limit: u32) -> u32 {
        if self.velocity_engaged() {
            ((limit as f64 * self.config.velocity.multiplier) as u32).max(1)
        } else {
            limit
        }
    }

    /// Run the IP-tier and fingerprint checks for one request.
    pub async fn check(
        &self,
        ip: &str,
        fingerprint: &str,
        is_datacenter: bool,
        authenticated: bool,
    ) -> Result<(), GatewayError> {
        if !self.config.enabled || authenticated {
            return Ok(());
        }

        let ip_limit = self.effective_limit(if is_datacenter {
            self.config.datacenter_limit
        } else {
            self.config.residential_limit
        });
        let ip_count = self.store.incr(&format!("ip:{ip}"), 60).await;
        if ip_count > ip_limit as u64 {
            metrics().inc_rate_limited("security_ip_tier");
            tracing::warn!(ip = %ip, limit = ip_limit, "blocked aggressive IP");
            return Err(GatewayError::RateLimited {
                message: "Too many requests from this IP address.".to_string(),
                kind: RateLimitKind::SecurityLimit,
                limit: ip_limit,
                retry_after_secs: 60,
            });
        }

        let fp_limit = self.effective_limit(self.config.fingerprint_limit);
        let fp_count = self.store.incr(&format!("fp:{fingerprint}"), 60).await;
        if fp_count > fp_limit as u64 {
            metrics().inc_rate_limited("security_fingerprint");
            tracing::warn!(
                fingerprint = %fingerprint,
                limit = fp_limit,
                "blocked bot fingerprint rotating IPs"
            );
            return Err(GatewayError::RateLimited {
                message: "Suspicious request patterns detected.".to_string(),
                kind: RateLimitKind::BehavioralLimit,
                limit: fp_limit,
                retry_after_secs: 60,
            });
        }

        Ok(())
    }
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}

pub async fn security_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if SKIP_PATHS.contains(&path) {
        return next.run(req).await;
    }

    let headers = req.headers();
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0);
    let ip = SecurityLimiter::client_ip(headers, peer);
    let fingerprint = SecurityLimiter::fingerprint(headers);
    let is_datacenter = state.security.is_datacenter(headers);
    let authenticated = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| crate::auth::AuthService::extract_api_key(Some(h)))
        .map(|key| crate::auth::looks_like_gateway_key(&key))
        .unwrap_or(false);

    if let Err(limited) = state
        .security
        .check(&ip, &fingerprint, is_datacenter, authenticated)
        .await
    {
        return limited.into_response();
    }

    let start = Instant::now();
    let response = next.run(req).await;
    state
        .security
        .record_outcome(response.status().as_u16(), start.elapsed());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn limiter(config: SecurityConfig) -> SecurityLimiter {
        SecurityLimiter::new(config, RateLimitStore::in_memory())
    }

    fn headers(ua: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("user-agent", HeaderValue::from_str(ua).unwrap());
        h.insert("accept-language", HeaderValue::from_static("en-US"));
        h.insert("accept-encoding", HeaderValue::from_static("gzip"));
        h
    }

    #[test]
    fn test_fingerprint_stable_and_sized() {
        let a = SecurityLimiter::fingerprint(&headers("Mozilla/5.0"));
        let b = SecurityLimiter::fingerprint(&headers("Mozilla/5.0"));
        let c = SecurityLimiter::fingerprint(&headers("python-requests/2.31"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_client_ip_first_hop() {
        let mut h = HeaderMap::new();
        h.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(SecurityLimiter::client_ip(&h, None), "203.0.113.7");

        let peer: SocketAddr = "198.51.100.4:443".parse().unwrap();
        assert_eq!(
            SecurityLimiter::client_ip(&HeaderMap::new(), Some(peer)),
            "198.51.100.4"
        );
    }

    #[test]
    fn test_datacenter_detection() {
        let limiter = limiter(SecurityConfig::default());
        assert!(limiter.is_datacenter(&headers("python-requests/2.31")));
        assert!(limiter.is_datacenter(&headers("curl/8.4.0")));

        let mut proxied = headers("Mozilla/5.0");
        proxied.insert("via", HeaderValue::from_static("1.1 proxy"));
        assert!(limiter.is_datacenter(&proxied));

        assert!(!limiter.is_datacenter(&headers("Mozilla/5.0 (Macintosh)")));
    }

    #[tokio::test]
    async fn test_ip_limit_blocks_after_threshold() {
        let config = SecurityConfig {
            residential_limit: 3,
            ..Default::default()
        };
        let limiter = limiter(config);

        for _ in 0..3 {
            limiter.check("203.0.113.7", "fp1", false, false).await.unwrap();
        }
        let err = limiter
            .check("203.0.113.7", "fp1", false, false)
            .await
            .unwrap_err();
        match err {
            GatewayError::RateLimited { kind, .. } => {
                assert_eq!(kind, RateLimitKind::SecurityLimit)
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fingerprint_limit_across_ips() {
        let config = SecurityConfig {
            fingerprint_limit: 2,
            ..Default::default()
        };
        let limiter = limiter(config);

        limiter.check("203.0.113.1", "same-fp", false, false).await.unwrap();
        limiter.check("203.0.113.2", "same-fp", false, false).await.unwrap();
        let err = limiter
            .check("203.0.113.3", "same-fp", false, false)
            .await
            .unwrap_err();
        match err {
            GatewayError::RateLimited { kind, .. } => {
                assert_eq!(kind, RateLimitKind::BehavioralLimit)
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_authenticated_requests_bypass() {
        let config = SecurityConfig {
            residential_limit: 1,
            fingerprint_limit: 1,
            ..Default::default()
        };
        let limiter = limiter(config);

        for _ in 0..10 {
            limiter.check("203.0.113.7", "fp1", false, true).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_velocity_mode_engages_and_halves_limits() {
        // 120 outcomes, 36 of them 5xx (30% > 25%): velocity engages and
        // the residential limit drops from 300 to 150
        let limiter = limiter(SecurityConfig::default());
        for i in 0..120 {
            let status = if i < 36 { 502 } else { 200 };
            limiter.record_outcome(status, Duration::from_millis(100));
        }

        assert!(limiter.velocity_engaged());
        assert_eq!(limiter.effective_limit(300), 150);
        assert_eq!(limiter.effective_limit(100), 50);
        assert_eq!(limiter.effective_limit(1), 1);
    }

    #[tokio::test]
    async fn test_velocity_needs_minimum_traffic() {
        // 50 outcomes all 5xx: ratio is high but volume is below 100
        let limiter = limiter(SecurityConfig::default());
        for _ in 0..50 {
            limiter.record_outcome(500, Duration::from_millis(100));
        }
        assert!(!limiter.velocity_engaged());
    }

    #[tokio::test]
    async fn test_slow_499_counts_as_system_error() {
        let fast = Outcome {
            at: Instant::now(),
            status: 499,
            duration: Duration::from_secs(1),
        };
        let slow = Outcome {
            at: Instant::now(),
            status: 499,
            duration: Duration::from_secs(6),
        };
        assert!(!fast.is_system_error());
        assert!(slow.is_system_error());
    }

    #[tokio::test]
    async fn test_bucket_boundary_resets_count() {
        // Two requests in different minute buckets both pass a limit of 1:
        // exercise the store directly with a tiny window so the bucket
        // rolls over between increments
        let store = RateLimitStore::in_memory();
        let first = store.incr("ip:test", 1).await;
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let second = store.incr("ip:test", 1).await;
        assert_eq!(first, 1);
        assert_eq!(second, 1);
    }
}
