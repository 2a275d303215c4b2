//! Admission control for the proxy hot path
//!
//! Two independent limits, checked in order of cheapness:
//!
//! 1. A global concurrency cap (semaphore). A request waits at most a
//!    short bounded interval for a slot, then is refused with 503 —
//!    never an unbounded queue.
//! 2. A per-token token bucket (requests per minute, continuous refill).
//!    Refusals carry the time until the next token so the handler can
//!    set `Retry-After`.
//!
//! Buckets live in a concurrent map keyed by token id and are evicted
//! once idle for longer than the refill window.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::RateLimitConfig;

struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

/// Refill tokens based on elapsed time and try to consume one.
/// Returns `Ok(())` on consume, `Err(wait)` with the time until a token
/// would be available.
fn refill_and_try_consume(bucket: &mut TokenBucket, window: Duration) -> Result<(), Duration> {
    let now = Instant::now();
    let elapsed = now.duration_since(bucket.last_refill);
    let refill = (elapsed.as_secs_f64() / window.as_secs_f64()) * bucket.max_tokens;
    bucket.tokens = (bucket.tokens + refill).min(bucket.max_tokens);
    bucket.last_refill = now;
    bucket.last_used = now;

    if bucket.tokens >= 1.0 {
        bucket.tokens -= 1.0;
        Ok(())
    } else {
        let deficit = 1.0 - bucket.tokens;
        let wait = window.as_secs_f64() * deficit / bucket.max_tokens;
        Err(Duration::from_secs_f64(wait))
    }
}

/// Holding one of these means the request occupies a global slot; the
/// slot frees when it drops.
pub struct ConcurrencyPermit {
    _permit: OwnedSemaphorePermit,
}

/// Why a request was not admitted.
#[derive(Debug, PartialEq, Eq)]
pub enum LimitExceeded {
    /// Global concurrency cap; no slot freed within the bounded wait.
    Overloaded,
    /// Per-token bucket empty; retry after the given delay.
    RateLimited { retry_after: Duration },
}

/// Per-token and global admission limits.
pub struct RateLimiter {
    buckets: DashMap<String, TokenBucket>,
    global: Arc<Semaphore>,
    admission_wait: Duration,
    window: Duration,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_window(config, Duration::from_secs(60))
    }

    /// Same limiter with a custom refill window. Production uses a
    /// one-minute window; tests shrink it.
    pub fn with_window(config: &RateLimitConfig, window: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            global: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            admission_wait: config.admission_wait,
            window,
        }
    }

    /// Acquire a global concurrency slot, waiting at most the configured
    /// bounded interval.
    pub async fn admit(&self) -> Result<ConcurrencyPermit, LimitExceeded> {
        match tokio::time::timeout(self.admission_wait, self.global.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(ConcurrencyPermit { _permit: permit }),
            // acquire_owned only errors when the semaphore is closed,
            // which we never do; treat it as overload regardless
            Ok(Err(_)) | Err(_) => Err(LimitExceeded::Overloaded),
        }
    }

    /// Consume one token from the bucket for `token_id`, creating the
    /// bucket on first sight with `per_minute` capacity.
    pub fn check_token(&self, token_id: &str, per_minute: u32) -> Result<(), LimitExceeded> {
        let max_tokens = per_minute.max(1) as f64;
        let mut entry = self
            .buckets
            .entry(token_id.to_string())
            .or_insert_with(|| TokenBucket {
                tokens: max_tokens,
                max_tokens,
                last_refill: Instant::now(),
                last_used: Instant::now(),
            });

        refill_and_try_consume(entry.value_mut(), self.window)
            .map_err(|retry_after| LimitExceeded::RateLimited { retry_after })
    }

    /// Drop buckets idle for longer than the refill window (they would
    /// be full again anyway). Returns how many were evicted.
    pub fn evict_idle(&self) -> usize {
        let cutoff = self.window;
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| bucket.last_used.elapsed() < cutoff);
        before - self.buckets.len()
    }

    /// Number of live buckets (for the health endpoint).
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Free slots under the global cap (for the health endpoint).
    pub fn available_slots(&self) -> usize {
        self.global.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_concurrent: usize, per_minute: u32) -> RateLimitConfig {
        RateLimitConfig {
            max_concurrent_requests: max_concurrent,
            admission_wait: Duration::from_millis(20),
            default_per_minute: per_minute,
        }
    }

    #[test]
    fn test_bucket_allows_burst_then_rejects() {
        let limiter = RateLimiter::new(&config(10, 3));
        assert!(limiter.check_token("t1", 3).is_ok());
        assert!(limiter.check_token("t1", 3).is_ok());
        assert!(limiter.check_token("t1", 3).is_ok());
        match limiter.check_token("t1", 3) {
            Err(LimitExceeded::RateLimited { retry_after }) => {
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_secs(21));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[test]
    fn test_buckets_are_independent() {
        let limiter = RateLimiter::new(&config(10, 1));
        assert!(limiter.check_token("a", 1).is_ok());
        assert!(limiter.check_token("b", 1).is_ok());
        assert!(limiter.check_token("a", 1).is_err());
    }

    #[tokio::test]
    async fn test_bucket_refills_over_window() {
        let limiter = RateLimiter::with_window(&config(10, 2), Duration::from_millis(100));
        assert!(limiter.check_token("t", 2).is_ok());
        assert!(limiter.check_token("t", 2).is_ok());
        assert!(limiter.check_token("t", 2).is_err());
        // Half a window refills one token
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.check_token("t", 2).is_ok());
    }

    #[tokio::test]
    async fn test_global_cap_and_bounded_wait() {
        let limiter = RateLimiter::new(&config(2, 100));
        let p1 = limiter.admit().await.unwrap();
        let _p2 = limiter.admit().await.unwrap();
        assert_eq!(limiter.available_slots(), 0);

        let started = Instant::now();
        let refused = limiter.admit().await;
        assert!(matches!(refused, Err(LimitExceeded::Overloaded)));
        // Bounded: waited roughly admission_wait, not forever
        assert!(started.elapsed() < Duration::from_millis(200));

        drop(p1);
        assert!(limiter.admit().await.is_ok());
    }

    #[tokio::test]
    async fn test_idle_eviction() {
        let limiter = RateLimiter::with_window(&config(10, 5), Duration::from_millis(30));
        limiter.check_token("old", 5).unwrap();
        assert_eq!(limiter.bucket_count(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        limiter.check_token("fresh", 5).unwrap();
        assert_eq!(limiter.evict_idle(), 1);
        assert_eq!(limiter.bucket_count(), 1);
    }
}
