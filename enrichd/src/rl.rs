//! Rate Limiter & Work Pool (§4.6): per-provider token bucket gating a
//! bounded-concurrency pool. Every cross-stage fan-out goes through one of
//! these; no stage blocks the request-handling context beyond the
//! progressive budget.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::errors::Error;

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self { tokens: burst as f64, capacity: burst as f64, rate_per_sec, last_refill: Instant::now() }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_to_next_token(&self) -> Duration {
        if self.rate_per_sec <= 0.0 {
            return Duration::from_secs(1);
        }
        Duration::from_secs_f64((1.0 - self.tokens.max(0.0)) / self.rate_per_sec)
    }
}

/// A provider-scoped gate: token bucket for sustained rate, semaphore for
/// `inflight_cap`. `submit` is the sole entry point other components use —
/// no stage acquires either primitive directly.
pub struct RateLimiter {
    name: &'static str,
    bucket: Mutex<TokenBucket>,
    semaphore: Arc<Semaphore>,
    max_queue_wait: Duration,
}

impl RateLimiter {
    pub fn new(name: &'static str, config: RateLimitConfig) -> Self {
        Self {
            name,
            bucket: Mutex::new(TokenBucket::new(config.rate_per_sec, config.burst)),
            semaphore: Arc::new(Semaphore::new(config.concurrency)),
            max_queue_wait: Duration::from_secs(30),
        }
    }

    /// High-water mark for back-pressure: when nearly every permit is taken,
    /// callers that aren't already in flight should back off (§4.7/§5).
    pub fn queue_depth(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn is_saturated(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    async fn acquire_token(&self) -> Result<(), Error> {
        let deadline = Instant::now() + self.max_queue_wait;
        loop {
            {
                let mut bucket = self.bucket.lock().await;
                if bucket.try_take() {
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    return Err(Error::SystemUnavailable(format!("{} rate limiter: try again later", self.name)));
                }
                let wait = bucket.time_to_next_token().min(Duration::from_millis(250));
                drop(bucket);
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// Runs `task` once both the token bucket and the concurrency semaphore
    /// admit it. Cross-stage fan-out MUST route through this, never call the
    /// collaborator directly (§4.6).
    pub async fn submit<F, Fut, T>(&self, task: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire_token().await?;
        let permit = tokio::time::timeout(self.max_queue_wait, self.semaphore.acquire())
            .await
            .map_err(|_| Error::SystemUnavailable(format!("{} pool: try again later", self.name)))?
            .map_err(|_| Error::SystemUnavailable(format!("{} pool closed", self.name)))?;
        let result = task().await;
        drop(permit);
        Ok(result)
    }
}

/// Named rate limiters for every RL-governed stage, wired once at startup
/// and shared process-wide (§5 "Worker counts and rate limits are
/// process-wide, not per request").
pub struct RateLimiters {
    pub classifier: RateLimiter,
    pub address_validator: RateLimiter,
    pub merchant_search: RateLimiter,
    pub supplier_cache: RateLimiter,
}

impl RateLimiters {
    pub fn new(config: &crate::config::Config) -> Self {
        Self {
            classifier: RateLimiter::new("classifier", config.classifier.rate),
            address_validator: RateLimiter::new("address_validator", config.address_validator.rate),
            merchant_search: RateLimiter::new("merchant_search", config.merchant_search.rate),
            supplier_cache: RateLimiter::new("supplier_cache", config.supplier_cache),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn respects_burst_then_throttles() {
        let rl = RateLimiter::new("test", RateLimitConfig { rate_per_sec: 1000.0, burst: 2, concurrency: 10 });
        assert!(rl.submit(|| async { 1 }).await.is_ok());
        assert!(rl.submit(|| async { 1 }).await.is_ok());
    }

    #[tokio::test]
    async fn concurrency_cap_limits_inflight() {
        let rl = Arc::new(RateLimiter::new("test", RateLimitConfig { rate_per_sec: 1000.0, burst: 100, concurrency: 1 }));
        assert_eq!(rl.queue_depth(), 1);
        let rl2 = rl.clone();
        let handle = tokio::spawn(async move { rl2.submit(|| async { tokio::time::sleep(Duration::from_millis(50)).await }).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(rl.is_saturated());
        handle.await.unwrap().unwrap();
    }
}
