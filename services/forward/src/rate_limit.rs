//! Per-client admission control.
//!
//! A `RateLimiter` hands out one `Limiter` per key (the client IP). Each
//! limiter is a token bucket backed by `governor`; buckets are created
//! lazily on first use and kept for the life of the process.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use serde::Deserialize;

/// A single admission bucket.
pub trait Limiter: Send + Sync {
    /// Take `n` tokens; `false` means the caller must be refused.
    fn allow(&self, n: u32) -> bool;
}

/// Source of per-key limiters.
pub trait RateLimiter: Send + Sync {
    /// Limiter for `key`, or `None` when the key is not limited.
    fn limiter(&self, key: &str) -> Option<Arc<dyn Limiter>>;
}

/// Limiter key for a client address: its IP without the port.
pub fn rate_limit_key(addr: SocketAddr) -> String {
    addr.ip().to_string()
}

/// Token rate and burst size.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RateLimit {
    /// Tokens refilled per second.
    pub rate: f64,
    /// Bucket capacity; defaults to one second of refill.
    #[serde(default)]
    pub burst: u32,
}

impl RateLimit {
    pub fn new(rate: f64, burst: u32) -> Self {
        Self { rate, burst }
    }

    /// Governor quota, or `None` when the rate disables limiting or its
    /// refill period does not fit in a `Duration`.
    pub fn quota(&self) -> Option<Quota> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return None;
        }
        let period = Duration::try_from_secs_f64(1.0 / self.rate).ok()?;
        let burst = if self.burst > 0 {
            self.burst
        } else {
            self.rate.ceil().min(u32::MAX as f64) as u32
        };
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        Quota::with_period(period).map(|q| q.allow_burst(burst))
    }
}

/// Token bucket over a direct governor limiter.
pub struct TokenBucketLimiter {
    inner: GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl TokenBucketLimiter {
    pub fn new(quota: Quota) -> Self {
        Self {
            inner: GovernorRateLimiter::direct(quota),
        }
    }
}

impl Limiter for TokenBucketLimiter {
    fn allow(&self, n: u32) -> bool {
        match NonZeroU32::new(n) {
            None => true,
            Some(n) => matches!(self.inner.check_n(n), Ok(Ok(()))),
        }
    }
}

/// Rate limiter keyed by client IP, with optional per-key overrides.
pub struct KeyedRateLimiter {
    default: Option<Quota>,
    overrides: HashMap<String, Option<Quota>>,
    limiters: DashMap<String, Arc<TokenBucketLimiter>>,
}

impl KeyedRateLimiter {
    /// Limit every key to `default`.
    pub fn new(default: RateLimit) -> Self {
        Self {
            default: default.quota(),
            overrides: HashMap::new(),
            limiters: DashMap::new(),
        }
    }

    /// Only keys given an override are limited.
    pub fn unlimited() -> Self {
        Self {
            default: None,
            overrides: HashMap::new(),
            limiters: DashMap::new(),
        }
    }

    /// Use `limit` for `key` instead of the default. A non-positive rate
    /// exempts the key.
    pub fn with_override(mut self, key: impl Into<String>, limit: RateLimit) -> Self {
        self.overrides.insert(key.into(), limit.quota());
        self
    }

    /// Number of buckets created so far.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    fn quota_for(&self, key: &str) -> Option<Quota> {
        match self.overrides.get(key) {
            Some(quota) => *quota,
            None => self.default,
        }
    }
}

impl RateLimiter for KeyedRateLimiter {
    fn limiter(&self, key: &str) -> Option<Arc<dyn Limiter>> {
        let quota = self.quota_for(key)?;
        let limiter = self
            .limiters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(TokenBucketLimiter::new(quota)))
            .clone();
        Some(limiter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0.0, 0)]
    #[case(-1.0, 5)]
    #[case(f64::NAN, 5)]
    #[case(f64::INFINITY, 5)]
    fn test_non_positive_rate_disables(#[case] rate: f64, #[case] burst: u32) {
        assert!(RateLimit::new(rate, burst).quota().is_none());
    }

    #[rstest]
    #[case(1e-30)]
    #[case(f64::MIN_POSITIVE)]
    fn test_out_of_range_rate_has_no_quota(#[case] rate: f64) {
        assert!(RateLimit::new(rate, 1).quota().is_none());
    }

    #[test]
    fn test_burst_then_refuse() {
        let limiter = TokenBucketLimiter::new(RateLimit::new(0.5, 3).quota().unwrap());
        assert!(limiter.allow(1));
        assert!(limiter.allow(1));
        assert!(limiter.allow(1));
        assert!(!limiter.allow(1));
    }

    #[test]
    fn test_zero_tokens_always_allowed() {
        let limiter = TokenBucketLimiter::new(RateLimit::new(0.5, 1).quota().unwrap());
        assert!(limiter.allow(1));
        assert!(limiter.allow(0));
    }

    #[test]
    fn test_request_above_capacity_refused() {
        let limiter = TokenBucketLimiter::new(RateLimit::new(1.0, 2).quota().unwrap());
        assert!(!limiter.allow(3));
        assert!(limiter.allow(2));
    }

    #[test]
    fn test_burst_defaults_to_rate() {
        let limiter = TokenBucketLimiter::new(RateLimit::new(2.0, 0).quota().unwrap());
        assert!(limiter.allow(1));
        assert!(limiter.allow(1));
        assert!(!limiter.allow(1));
    }

    #[test]
    fn test_keys_have_independent_buckets() {
        let limiters = KeyedRateLimiter::new(RateLimit::new(0.1, 1));
        let a = limiters.limiter("10.0.0.1").unwrap();
        let b = limiters.limiter("10.0.0.2").unwrap();

        assert!(a.allow(1));
        assert!(!a.allow(1));
        assert!(b.allow(1));

        // Same key shares its bucket.
        assert!(!limiters.limiter("10.0.0.1").unwrap().allow(1));
        assert_eq!(limiters.len(), 2);
    }

    #[test]
    fn test_overrides() {
        let limiters = KeyedRateLimiter::unlimited()
            .with_override("10.0.0.9", RateLimit::new(0.1, 1))
            .with_override("10.0.0.10", RateLimit::new(0.0, 0));

        assert!(limiters.limiter("10.0.0.1").is_none());
        assert!(limiters.limiter("10.0.0.10").is_none());

        let limited = limiters.limiter("10.0.0.9").unwrap();
        assert!(limited.allow(1));
        assert!(!limited.allow(1));
    }

    #[test]
    fn test_key_is_ip_only() {
        let addr: SocketAddr = "192.0.2.7:51000".parse().unwrap();
        assert_eq!(rate_limit_key(addr), "192.0.2.7");
        let addr: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        assert_eq!(rate_limit_key(addr), "2001:db8::1");
    }
}
