//! Point-denominated token bucket shared by every upstream request.

use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Bucket size in points.
    pub capacity: u32,
    pub refill_per_second: f64,
    /// Pause applied when a rate-limit signal carries no reset hint.
    pub default_penalty_secs: u64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    /// Refill accrues from here; may sit in the future while penalized.
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, capacity: f64, rate: f64) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }
}

/// Waiters are served strictly in arrival order: the turnstile is a fair async mutex and only
/// its holder may debit the bucket.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_second: f64,
    default_penalty: Duration,
    turnstile: tokio::sync::Mutex<()>,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let capacity = f64::from(config.capacity.max(1));
        Self {
            capacity,
            refill_per_second: config.refill_per_second.max(f64::MIN_POSITIVE),
            default_penalty: Duration::from_secs(config.default_penalty_secs),
            turnstile: tokio::sync::Mutex::new(()),
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn bucket(&self) -> std::sync::MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Tokens currently available.
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket();
        bucket.refill(Instant::now(), self.capacity, self.refill_per_second);
        bucket.tokens
    }

    /// Wait until `cost` points are available and debit them. Costs above capacity are clamped
    /// so an oversized request waits for a full bucket instead of forever.
    pub async fn acquire(&self, cost: u32) {
        let cost = f64::from(cost).min(self.capacity);
        let _turn = self.turnstile.lock().await;
        loop {
            let wait = {
                let mut bucket = self.bucket();
                let now = Instant::now();
                bucket.refill(now, self.capacity, self.refill_per_second);
                if now >= bucket.last_refill && bucket.tokens >= cost {
                    bucket.tokens -= cost;
                    return;
                }
                let paused = bucket.last_refill.saturating_duration_since(now);
                let deficit = (cost - bucket.tokens).max(0.0);
                paused + Duration::from_secs_f64(deficit / self.refill_per_second)
            };
            debug!(wait_ms = wait.as_millis() as u64, cost, "rate limiter waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Empty the bucket and hold refill until `retry_after` has elapsed.
    pub fn penalize(&self, retry_after: Option<Duration>) {
        let pause = retry_after.unwrap_or(self.default_penalty);
        let resume_at = Instant::now() + pause;
        let mut bucket = self.bucket();
        bucket.tokens = 0.0;
        if resume_at > bucket.last_refill {
            bucket.last_refill = resume_at;
        }
        warn!(pause_ms = pause.as_millis() as u64, "upstream rate limit hit; bucket drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(capacity: u32, rate: f64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            capacity,
            refill_per_second: rate,
            default_penalty_secs: 30,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill() {
        let limiter = limiter(10, 2.0);
        let start = Instant::now();
        limiter.acquire(10).await;
        limiter.acquire(4).await;
        assert_eq!(start.elapsed().as_secs(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_cost_is_clamped_to_capacity() {
        let limiter = limiter(5, 1.0);
        let start = Instant::now();
        limiter.acquire(500).await;
        limiter.acquire(500).await;
        assert_eq!(start.elapsed().as_secs(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn penalty_drains_and_pauses_refill() {
        let limiter = limiter(10, 10.0);
        limiter.penalize(Some(Duration::from_secs(7)));
        assert_eq!(limiter.available(), 0.0);

        let start = Instant::now();
        limiter.acquire(1).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(7), "waited {waited:?}");
        assert!(waited < Duration::from_secs(8), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn penalty_without_hint_uses_default() {
        let limiter = limiter(10, 10.0);
        limiter.penalize(None);
        let start = Instant::now();
        limiter.acquire(1).await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_served_in_arrival_order() {
        let limiter = Arc::new(limiter(1, 1.0));
        limiter.acquire(1).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for id in 0..4 {
            let limiter = limiter.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire(1).await;
                order.lock().expect("order").push(id);
            }));
            // let each task reach the turnstile before spawning the next
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.expect("join");
        }
        assert_eq!(*order.lock().expect("order"), vec![0, 1, 2, 3]);
    }
}
