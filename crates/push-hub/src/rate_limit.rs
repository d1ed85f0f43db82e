//! Per-key emission throttling.
//!
//! Keys are user ids or `admin_broadcast`. Each key gets a bucket of
//! `MAX_EVENTS` tokens refilled every `WINDOW`; events over the limit
//! are dropped silently by the hub.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// Events allowed per key per window
pub const MAX_EVENTS: u32 = 20;

/// Throttle window
pub const WINDOW: Duration = Duration::from_millis(1000);

/// Buckets idle longer than this are garbage-collected
const BUCKET_IDLE_TTL: Duration = Duration::from_secs(300);

struct Bucket {
    window_start: Instant,
    count: u32,
}

/// Fixed-window rate limiter keyed by string
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Record an emission attempt for `key`. Returns `false` when the
    /// event must be dropped.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            window_start: now,
            count: 0,
        });

        if now.duration_since(bucket.window_start) >= WINDOW {
            bucket.window_start = now;
            bucket.count = 0;
        }

        if bucket.count >= MAX_EVENTS {
            debug!("Rate limit hit for key {}", key);
            return false;
        }
        bucket.count += 1;
        true
    }

    /// Drop buckets idle past the TTL. Called by the hub's sweeper.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        buckets.retain(|_, bucket| now.duration_since(bucket.window_start) < BUCKET_IDLE_TTL);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.buckets.lock().len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit_then_drops() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        for _ in 0..MAX_EVENTS {
            assert!(limiter.allow_at("7", now));
        }
        assert!(!limiter.allow_at("7", now));
    }

    #[test]
    fn window_reset_refills() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        for _ in 0..MAX_EVENTS {
            assert!(limiter.allow_at("7", start));
        }
        assert!(!limiter.allow_at("7", start));
        assert!(limiter.allow_at("7", start + WINDOW));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        for _ in 0..MAX_EVENTS {
            assert!(limiter.allow_at("a", now));
        }
        assert!(!limiter.allow_at("a", now));
        assert!(limiter.allow_at("admin_broadcast", now));
    }

    #[test]
    fn sweep_reclaims_idle_buckets() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow("stale"));
        assert_eq!(limiter.len(), 1);
        // A fresh bucket survives the sweep
        limiter.sweep();
        assert_eq!(limiter.len(), 1);
    }
}
