//! Keyed token-bucket admission built atop `governor`.
//!
//! Every distinct key (caller identity or address) owns an independent bucket holding
//! at most `burst_capacity` tokens and refilled at `replenish_rate` tokens per second.
//! Buckets are created on first use, full.
//!
//! At most `max_tracked_keys` buckets exist at any time. Once the map is full, a new key
//! first triggers a sweep of idle buckets (at most once per refill period); if the map
//! is still full it is admitted against a single overflow bucket shared by every
//! untracked key. A bucket is idle once it has had time to refill completely, at which
//! point it is indistinguishable from a fresh one.
use std::{
    net::SocketAddr,
    num::NonZeroU32,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use governor::{
    DefaultDirectRateLimiter, Quota, RateLimiter,
    clock::{Clock, DefaultClock},
};
use http::{HeaderMap, HeaderName};
use scc::{HashMap, hash_map::Entry};

use crate::config::models::{KeyResolverKind, RateLimitConfig};

pub const DEFAULT_USER_HEADER: &str = "x-user-id";
pub const ANONYMOUS_KEY: &str = "anonymous";
pub const UNKNOWN_ADDR_KEY: &str = "unknown";

/// Derives the rate limit key of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyResolver {
    UserHeader(HeaderName),
    RemoteAddr,
}

impl KeyResolver {
    pub fn from_config(config: &RateLimitConfig) -> Result<Self, String> {
        match config.key_resolver {
            KeyResolverKind::UserHeader => {
                let name = config.header_name.as_deref().unwrap_or(DEFAULT_USER_HEADER);
                let header = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| format!("Invalid header_name '{name}': {e}"))?;
                Ok(KeyResolver::UserHeader(header))
            }
            KeyResolverKind::RemoteAddr => Ok(KeyResolver::RemoteAddr),
        }
    }

    /// Never fails: callers without an identity share a sentinel key.
    pub fn resolve(&self, headers: &HeaderMap, client_addr: Option<SocketAddr>) -> String {
        match self {
            KeyResolver::UserHeader(header) => headers
                .get(header)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .unwrap_or(ANONYMOUS_KEY)
                .to_string(),
            KeyResolver::RemoteAddr => client_addr
                .map(|addr| addr.ip().to_string())
                .unwrap_or_else(|| UNKNOWN_ADDR_KEY.to_string()),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

struct Bucket {
    limiter: DefaultDirectRateLimiter,
    last_seen: Instant,
}

pub struct RequestRateLimiter {
    resolver: KeyResolver,
    quota: Quota,
    buckets: HashMap<String, Bucket>,
    // Entry count, kept alongside the map so the bound is checked in O(1)
    tracked: AtomicUsize,
    overflow: DefaultDirectRateLimiter,
    clock: DefaultClock,
    max_tracked_keys: usize,
    idle_after: Duration,
    last_sweep: Mutex<Instant>,
}

impl RequestRateLimiter {
    /// Build a limiter from a `RateLimitConfig` definition.
    pub fn new(config: &RateLimitConfig) -> Result<Self, String> {
        let replenish_rate = NonZeroU32::new(config.replenish_rate)
            .ok_or_else(|| "Rate limit 'replenish_rate' must be greater than 0".to_string())?;
        let burst_capacity = NonZeroU32::new(config.burst_capacity)
            .ok_or_else(|| "Rate limit 'burst_capacity' must be greater than 0".to_string())?;
        if config.max_tracked_keys == 0 {
            return Err("Rate limit 'max_tracked_keys' must be greater than 0".to_string());
        }
        let resolver = KeyResolver::from_config(config)?;

        tracing::info!(
            resolver = ?resolver,
            replenish_rate = config.replenish_rate,
            burst_capacity = config.burst_capacity,
            max_tracked_keys = config.max_tracked_keys,
            "Creating rate limiter"
        );

        let quota = Quota::per_second(replenish_rate).allow_burst(burst_capacity);
        Ok(Self {
            resolver,
            quota,
            buckets: HashMap::new(),
            tracked: AtomicUsize::new(0),
            overflow: RateLimiter::direct(quota),
            clock: DefaultClock::default(),
            max_tracked_keys: config.max_tracked_keys,
            idle_after: quota.replenish_interval() * burst_capacity.get(),
            last_sweep: Mutex::new(Instant::now()),
        })
    }

    pub fn resolver(&self) -> &KeyResolver {
        &self.resolver
    }

    pub fn key_for(&self, headers: &HeaderMap, client_addr: Option<SocketAddr>) -> String {
        self.resolver.resolve(headers, client_addr)
    }

    /// Consume one token from `key`'s bucket.
    pub fn admit(&self, key: &str) -> Admission {
        let now = Instant::now();

        if let Some(mut bucket) = self.buckets.get_sync(key) {
            bucket.get_mut().last_seen = now;
            return self.check(&bucket.get().limiter);
        }

        if self.tracked.load(Ordering::Acquire) >= self.max_tracked_keys {
            self.sweep_if_due(now);
        }

        match self.buckets.entry_sync(key.to_string()) {
            Entry::Occupied(mut bucket) => {
                bucket.get_mut().last_seen = now;
                self.check(&bucket.get().limiter)
            }
            Entry::Vacant(slot) => {
                if !self.reserve_slot() {
                    tracing::debug!(key, "Rate limiter key map full, using overflow bucket");
                    return self.check(&self.overflow);
                }
                let bucket = slot.insert_entry(Bucket {
                    limiter: RateLimiter::direct(self.quota),
                    last_seen: now,
                });
                self.check(&bucket.get().limiter)
            }
        }
    }

    fn check(&self, limiter: &DefaultDirectRateLimiter) -> Admission {
        match limiter.check() {
            Ok(()) => Admission::Allowed,
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                Admission::Denied {
                    retry_after: wait.max(Duration::from_secs(1)),
                }
            }
        }
    }

    fn reserve_slot(&self) -> bool {
        self.tracked
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tracked| {
                (tracked < self.max_tracked_keys).then_some(tracked + 1)
            })
            .is_ok()
    }

    /// Sweep on the request path at most once per refill period.
    fn sweep_if_due(&self, now: Instant) {
        let Ok(mut last_sweep) = self.last_sweep.try_lock() else {
            return;
        };
        if now.duration_since(*last_sweep) < self.idle_after {
            return;
        }
        *last_sweep = now;
        drop(last_sweep);
        self.evict_idle();
    }

    /// Drop buckets that have had time to refill completely.
    pub fn evict_idle(&self) {
        let now = Instant::now();
        let mut evicted = 0usize;
        self.buckets.retain_sync(|_, bucket| {
            let idle = now.duration_since(bucket.last_seen) >= self.idle_after;
            if idle {
                evicted += 1;
            }
            !idle
        });
        if evicted > 0 {
            self.tracked.fetch_sub(evicted, Ordering::AcqRel);
            tracing::debug!(
                evicted,
                remaining = self.tracked.load(Ordering::Acquire),
                "Evicted idle rate limit keys"
            );
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.tracked.load(Ordering::Acquire)
    }
}

/// Whole seconds for a `Retry-After` header, rounded up.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn config(replenish_rate: u32, burst_capacity: u32) -> RateLimitConfig {
        RateLimitConfig {
            key_resolver: KeyResolverKind::UserHeader,
            header_name: None,
            replenish_rate,
            burst_capacity,
            max_tracked_keys: 100,
        }
    }

    #[test]
    fn test_rejects_zero_rates() {
        assert!(RequestRateLimiter::new(&config(0, 10)).is_err());
        assert!(RequestRateLimiter::new(&config(10, 0)).is_err());

        let mut invalid_header = config(10, 10);
        invalid_header.header_name = Some("bad header".to_string());
        assert!(RequestRateLimiter::new(&invalid_header).is_err());
    }

    #[test]
    fn test_burst_then_denied() {
        let limiter = RequestRateLimiter::new(&config(1, 3)).unwrap();

        for _ in 0..3 {
            assert!(limiter.admit("alice").is_allowed());
        }
        match limiter.admit("alice") {
            Admission::Denied { retry_after } => assert!(retry_after >= Duration::from_secs(1)),
            Admission::Allowed => panic!("fourth request should be denied"),
        }
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RequestRateLimiter::new(&config(1, 1)).unwrap();

        assert!(limiter.admit("alice").is_allowed());
        assert!(!limiter.admit("alice").is_allowed());
        assert!(limiter.admit("bob").is_allowed());
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[tokio::test]
    async fn test_tokens_replenish_over_time() {
        let limiter = RequestRateLimiter::new(&config(10, 1)).unwrap();

        assert!(limiter.admit("alice").is_allowed());
        assert!(!limiter.admit("alice").is_allowed());

        // One refill period buys exactly one more request
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(limiter.admit("alice").is_allowed());
        assert!(!limiter.admit("alice").is_allowed());
    }

    #[test]
    fn test_key_churn_never_exceeds_bound() {
        let mut cfg = config(1, 5);
        cfg.max_tracked_keys = 2;
        let limiter = RequestRateLimiter::new(&cfg).unwrap();

        let admitted = (0..50)
            .filter(|i| limiter.admit(&format!("spoofed-{i}")).is_allowed())
            .count();

        assert_eq!(limiter.tracked_keys(), 2);
        // Two tracked buckets plus the shared overflow burst
        assert_eq!(admitted, 2 + 5);
        // Tracked keys keep their own buckets
        assert!(limiter.admit("spoofed-0").is_allowed());
        assert!(!limiter.admit("spoofed-49").is_allowed());
    }

    #[tokio::test]
    async fn test_full_map_reclaims_idle_slots() {
        let mut cfg = config(20, 1);
        cfg.max_tracked_keys = 1;
        let limiter = RequestRateLimiter::new(&cfg).unwrap();

        assert!(limiter.admit("alice").is_allowed());
        tokio::time::sleep(Duration::from_millis(200)).await;

        // alice has refilled, so bob takes her slot instead of the overflow bucket
        assert!(limiter.admit("bob").is_allowed());
        assert_eq!(limiter.tracked_keys(), 1);
        assert!(limiter.admit("carol").is_allowed());
        assert!(!limiter.admit("dave").is_allowed());
    }

    #[tokio::test]
    async fn test_evict_idle_drops_refilled_buckets() {
        let limiter = RequestRateLimiter::new(&config(20, 1)).unwrap();
        limiter.admit("alice");
        limiter.admit("bob");
        assert_eq!(limiter.tracked_keys(), 2);

        tokio::time::sleep(Duration::from_millis(200)).await;
        limiter.evict_idle();
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_user_header_resolution() {
        let resolver = KeyResolver::from_config(&config(1, 1)).unwrap();

        let mut headers = HeaderMap::new();
        assert_eq!(resolver.resolve(&headers, None), ANONYMOUS_KEY);

        headers.insert("x-user-id", HeaderValue::from_static("  "));
        assert_eq!(resolver.resolve(&headers, None), ANONYMOUS_KEY);

        headers.insert("x-user-id", HeaderValue::from_static("user-42"));
        assert_eq!(resolver.resolve(&headers, None), "user-42");
    }

    #[test]
    fn test_remote_addr_resolution() {
        let mut cfg = config(1, 1);
        cfg.key_resolver = KeyResolverKind::RemoteAddr;
        let resolver = KeyResolver::from_config(&cfg).unwrap();

        let addr: SocketAddr = "10.1.2.3:55000".parse().unwrap();
        assert_eq!(resolver.resolve(&HeaderMap::new(), Some(addr)), "10.1.2.3");
        assert_eq!(resolver.resolve(&HeaderMap::new(), None), UNKNOWN_ADDR_KEY);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_millis(100)), 1);
        assert_eq!(retry_after_secs(Duration::from_secs(2)), 2);
        assert_eq!(retry_after_secs(Duration::from_millis(2100)), 3);
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
    }
}
