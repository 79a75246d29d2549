//! Per-source token bucket admission control

use dashmap::DashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Token bucket rate limiter keyed by request source
///
/// Buckets refill continuously at `refill_per_sec` up to `capacity`; an empty
/// bucket rejects. Sources the limiter has never seen start full.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: DashMap<String, Mutex<Bucket>>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Creates a limiter with the given bucket shape
    #[must_use]
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity.max(1.0),
            refill_per_sec: refill_per_sec.max(0.001),
            buckets: DashMap::new(),
        }
    }

    /// Takes one token for the source; false means rate limited
    pub fn try_admit(&self, source: &str) -> bool {
        let bucket = self
            .buckets
            .entry(source.to_string())
            .or_insert_with(|| {
                Mutex::new(Bucket {
                    tokens: self.capacity,
                    last_refill: Instant::now(),
                })
            });
        let mut bucket = bucket
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_source_starts_full() {
        let limiter = RateLimiter::new(3.0, 1.0);
        assert!(limiter.try_admit("alice"));
        assert!(limiter.try_admit("alice"));
        assert!(limiter.try_admit("alice"));
        assert!(!limiter.try_admit("alice"));
    }

    #[test]
    fn sources_are_independent() {
        let limiter = RateLimiter::new(1.0, 0.001);
        assert!(limiter.try_admit("alice"));
        assert!(!limiter.try_admit("alice"));
        assert!(limiter.try_admit("bob"));
    }

    #[test]
    fn bucket_refills_over_time() {
        let limiter = RateLimiter::new(1.0, 1000.0);
        assert!(limiter.try_admit("alice"));
        assert!(!limiter.try_admit("alice"));
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(limiter.try_admit("alice"));
    }
}
