use dashmap::DashMap;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateCheck {
    pub allowed: bool,
    pub remaining: f64,
    pub reset_in_ms: u64,
    pub fill_level: f64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_activity: Instant,
}

/// Per-client token bucket rate limiter. Buckets are sharded in a
/// concurrent map so two different client keys never contend; each bucket's
/// own operations are serialized by the map's per-shard lock.
pub struct RateLimiter {
    max_requests: f64,
    window: Duration,
    burst: f64,
    buckets: DashMap<String, StdMutex<Bucket>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window_ms: u64) -> Self {
        Self {
            max_requests: max_requests as f64,
            window: Duration::from_millis(window_ms.max(1)),
            burst: max_requests as f64,
            buckets: DashMap::new(),
        }
    }

    fn refill_rate_per_ms(&self) -> f64 {
        self.max_requests / self.window.as_millis().max(1) as f64
    }

    /// Consumes one token if available.
    pub fn check(&self, client_id: &str) -> RateCheck {
        self.check_internal(client_id, true)
    }

    /// Inspects the bucket without mutating it.
    pub fn peek(&self, client_id: &str) -> RateCheck {
        self.check_internal(client_id, false)
    }

    fn check_internal(&self, client_id: &str, consume: bool) -> RateCheck {
        let now = Instant::now();
        let entry = self
            .buckets
            .entry(client_id.to_string())
            .or_insert_with(|| {
                StdMutex::new(Bucket {
                    tokens: self.burst,
                    last_refill: now,
                    last_activity: now,
                })
            });
        let mut bucket = entry.lock().expect("rate limiter bucket mutex poisoned");

        let elapsed_ms = now.saturating_duration_since(bucket.last_refill).as_millis() as f64;
        let refilled = (bucket.tokens + elapsed_ms * self.refill_rate_per_ms()).min(self.burst);
        let allowed = refilled >= 1.0;

        // `peek` must never mutate: only a consuming `check` persists the
        // refill progress and activity timestamp back into the bucket.
        let remaining = if consume {
            bucket.tokens = if allowed { refilled - 1.0 } else { refilled };
            bucket.last_refill = now;
            bucket.last_activity = now;
            bucket.tokens
        } else {
            refilled
        };

        let tokens_needed = 1.0 - remaining;
        let reset_in_ms = if tokens_needed <= 0.0 {
            0
        } else {
            (tokens_needed / self.refill_rate_per_ms()).ceil() as u64
        };

        RateCheck {
            allowed,
            remaining,
            reset_in_ms,
            fill_level: remaining / self.burst,
        }
    }

    /// Evicts buckets idle for at least `2 * window`. Intended to run from
    /// a periodic background sweep; cheap and non-blocking when the bucket
    /// map is empty.
    pub fn sweep_idle(&self) {
        let idle_cutoff = self.window * 2;
        let now = Instant::now();
        self.buckets.retain(|_, bucket| {
            let bucket = bucket.lock().expect("rate limiter bucket mutex poisoned");
            now.saturating_duration_since(bucket.last_activity) < idle_cutoff
        });
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_request_from_idle_client_is_always_admitted() {
        let limiter = RateLimiter::new(1, 1000);
        let result = limiter.check("client-a");
        assert!(result.allowed);
    }

    #[test]
    fn second_request_within_window_is_denied_with_reset_in_bound() {
        let limiter = RateLimiter::new(1, 1000);
        assert!(limiter.check("client-a").allowed);
        let second = limiter.check("client-a");
        assert!(!second.allowed);
        assert!(second.reset_in_ms > 0 && second.reset_in_ms <= 1000);
    }

    #[test]
    fn different_clients_never_contend() {
        let limiter = RateLimiter::new(1, 1000);
        assert!(limiter.check("client-a").allowed);
        assert!(limiter.check("client-b").allowed);
    }

    #[test]
    fn peek_never_mutates() {
        let limiter = RateLimiter::new(1, 1000);
        let before = limiter.peek("client-a");
        assert!(before.allowed);
        let after = limiter.peek("client-a");
        assert_eq!(before, after);
        assert!(limiter.check("client-a").allowed);
    }

    #[test]
    fn sweep_evicts_only_stale_buckets() {
        let limiter = RateLimiter::new(1, 1);
        limiter.check("client-a");
        std::thread::sleep(Duration::from_millis(5));
        limiter.sweep_idle();
        assert_eq!(limiter.bucket_count(), 0);
    }
}
