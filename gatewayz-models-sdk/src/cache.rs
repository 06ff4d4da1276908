//! # Per-Gateway Cache with Stale-While-Revalidate
//!
//! Each upstream gateway owns one typed [`GatewayCache`] entry. Reads are
//! classified into a discriminated state rather than a bare `Option`, so
//! callers can distinguish a fresh hit from stale-but-servable data and from
//! an active error backoff:
//!
//! - **Fresh** (`age < ttl`): serve directly.
//! - **Stale** (`ttl <= age < stale_ttl`): serve, and schedule one background
//!   refresh. The `refreshing` flag guarantees at most one refresh in flight
//!   per gateway at a time.
//! - **ErrorBackoff**: the last fetch failed and its backoff has not elapsed.
//!   Stale data, when still inside the stale window, rides along so callers
//!   can degrade gracefully instead of hammering a failing upstream. Quota
//!   errors use long backoffs (15 minutes for Alibaba-style quota responses)
//!   independent of the data TTL.
//! - **Empty**: nothing servable; the caller must fetch synchronously.
//!
//! Writers are only the fetchers: a successful fetch stamps the timestamp and
//! clears the error state; a failed fetch records the error without touching
//! the stale data underneath.
//!
//! Background refreshes run on a small dedicated [`RefreshPool`] (default 4
//! workers) so a thundering herd of stale reads cannot exhaust the runtime.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Result of a cache read, discriminated by data freshness and error state.
#[derive(Debug, Clone)]
pub enum CacheRead<T> {
    /// Data younger than the TTL
    Fresh(Arc<T>),
    /// Data between TTL and stale-TTL; caller should trigger a refresh
    Stale(Arc<T>),
    /// Last fetch failed and the backoff has not elapsed
    ErrorBackoff {
        message: String,
        /// Stale data still inside the stale window, if any
        stale: Option<Arc<T>>,
    },
    /// Nothing servable
    Empty,
}

impl<T> CacheRead<T> {
    /// Any servable data regardless of freshness.
    pub fn data(&self) -> Option<Arc<T>> {
        match self {
            CacheRead::Fresh(d) | CacheRead::Stale(d) => Some(Arc::clone(d)),
            CacheRead::ErrorBackoff { stale, .. } => stale.clone(),
            CacheRead::Empty => None,
        }
    }
}

#[derive(Debug)]
struct ErrorState {
    message: String,
    until: Instant,
}

#[derive(Debug)]
struct Slot<T> {
    data: Option<Arc<T>>,
    fetched_at: Option<Instant>,
    error: Option<ErrorState>,
    refreshing: bool,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            data: None,
            fetched_at: None,
            error: None,
            refreshing: false,
        }
    }
}

/// Typed cache entry for one gateway.
pub struct GatewayCache<T> {
    slot: Mutex<Slot<T>>,
    ttl: Duration,
    stale_ttl: Duration,
}

impl<T> GatewayCache<T> {
    /// Create a cache entry. `stale_ttl` must be at least `ttl`; the stale
    /// window is the span between them.
    pub fn new(ttl: Duration, stale_ttl: Duration) -> Self {
        Self {
            slot: Mutex::new(Slot::default()),
            ttl,
            stale_ttl: stale_ttl.max(ttl),
        }
    }

    /// Classify the current contents.
    pub fn read(&self) -> CacheRead<T> {
        let mut slot = self.slot.lock().unwrap();
        let now = Instant::now();

        // Expired backoffs are cleared lazily on the next read
        if let Some(err) = &slot.error {
            if now < err.until {
                let stale = match (&slot.data, slot.fetched_at) {
                    (Some(data), Some(at)) if now.duration_since(at) < self.stale_ttl => {
                        Some(Arc::clone(data))
                    }
                    _ => None,
                };
                return CacheRead::ErrorBackoff {
                    message: err.message.clone(),
                    stale,
                };
            }
            slot.error = None;
        }

        match (&slot.data, slot.fetched_at) {
            (Some(data), Some(at)) => {
                let age = now.duration_since(at);
                if age < self.ttl {
                    CacheRead::Fresh(Arc::clone(data))
                } else if age < self.stale_ttl {
                    CacheRead::Stale(Arc::clone(data))
                } else {
                    CacheRead::Empty
                }
            }
            _ => CacheRead::Empty,
        }
    }

    /// Store fresh data. Stamps the timestamp and clears any error state.
    pub fn set(&self, data: T) {
        let mut slot = self.slot.lock().unwrap();
        slot.data = Some(Arc::new(data));
        slot.fetched_at = Some(Instant::now());
        slot.error = None;
    }

    /// Record a fetch failure with its own backoff. Stale data is untouched.
    pub fn set_error(&self, message: impl Into<String>, backoff: Duration) {
        let mut slot = self.slot.lock().unwrap();
        slot.error = Some(ErrorState {
            message: message.into(),
            until: Instant::now() + backoff,
        });
    }

    pub fn clear(&self) {
        let mut slot = self.slot.lock().unwrap();
        *slot = Slot::default();
    }

    /// Claim the single refresh slot. Returns `false` when a refresh is
    /// already in flight for this gateway.
    pub fn try_begin_refresh(&self) -> bool {
        let mut slot = self.slot.lock().unwrap();
        if slot.refreshing {
            false
        } else {
            slot.refreshing = true;
            true
        }
    }

    pub fn end_refresh(&self) {
        self.slot.lock().unwrap().refreshing = false;
    }

    /// Age of the cached data, if any.
    pub fn age(&self) -> Option<Duration> {
        self.slot
            .lock()
            .unwrap()
            .fetched_at
            .map(|at| at.elapsed())
    }
}

/// Bounded worker pool for background cache revalidation.
#[derive(Clone)]
pub struct RefreshPool {
    permits: Arc<Semaphore>,
}

impl RefreshPool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Run a refresh task when a worker slot frees up.
    pub fn spawn<F>(&self, gateway: String, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire().await else {
                return;
            };
            tracing::debug!(gateway = %gateway, "background revalidation started");
            task.await;
            tracing::debug!(gateway = %gateway, "background revalidation completed");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_then_stale_then_empty() {
        let cache = GatewayCache::new(Duration::from_millis(30), Duration::from_millis(60));
        cache.set(vec![1, 2, 3]);

        assert!(matches!(cache.read(), CacheRead::Fresh(_)));

        std::thread::sleep(Duration::from_millis(40));
        assert!(matches!(cache.read(), CacheRead::Stale(_)));

        std::thread::sleep(Duration::from_millis(40));
        assert!(matches!(cache.read(), CacheRead::Empty));
    }

    #[test]
    fn test_error_backoff_preserves_stale_data() {
        let cache = GatewayCache::new(Duration::from_millis(10), Duration::from_secs(60));
        cache.set(vec![42]);
        std::thread::sleep(Duration::from_millis(20));

        cache.set_error("quota exceeded", Duration::from_secs(30));
        match cache.read() {
            CacheRead::ErrorBackoff { message, stale } => {
                assert_eq!(message, "quota exceeded");
                assert_eq!(*stale.unwrap(), vec![42]);
            }
            other => panic!("expected ErrorBackoff, got {other:?}"),
        }
    }

    #[test]
    fn test_expired_backoff_clears_lazily() {
        let cache: GatewayCache<Vec<u8>> =
            GatewayCache::new(Duration::from_secs(60), Duration::from_secs(120));
        cache.set_error("transient", Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(cache.read(), CacheRead::Empty));
    }

    #[test]
    fn test_set_clears_error_state() {
        let cache = GatewayCache::new(Duration::from_secs(60), Duration::from_secs(120));
        cache.set_error("boom", Duration::from_secs(60));
        cache.set(vec![1]);
        assert!(matches!(cache.read(), CacheRead::Fresh(_)));
    }

    #[test]
    fn test_single_refresh_in_flight() {
        let cache: GatewayCache<Vec<u8>> =
            GatewayCache::new(Duration::from_secs(1), Duration::from_secs(2));
        assert!(cache.try_begin_refresh());
        assert!(!cache.try_begin_refresh());
        cache.end_refresh();
        assert!(cache.try_begin_refresh());
    }
}
