//! Token-bucket rate limiting for the exchange REST API.
//!
//! Requests never get rejected for rate reasons; callers are delayed until
//! the bucket has refilled enough to cover the requested cost.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Weight usage above this ratio puts the limiter in the warning zone;
/// callers should self-throttle non-critical work.
pub const WARNING_THRESHOLD: f64 = 0.80;
/// Weight usage above this ratio trips the circuit breaker; the strategy
/// must skip non-essential buys until usage drains.
pub const CIRCUIT_BREAKER_THRESHOLD: f64 = 0.95;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket refilled at a fixed rate. Acquiring more tokens than are
/// available waits for the deficit to refill instead of failing.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }

    /// Consumes `cost` tokens, sleeping until the bucket can cover them.
    pub async fn acquire(&self, cost: f64) {
        loop {
            let wait = {
                let mut state = self.state.lock().expect("bucket lock poisoned");
                self.refill(&mut state);
                if state.tokens >= cost {
                    state.tokens -= cost;
                    return;
                }
                let deficit = cost - state.tokens;
                deficit / self.refill_rate
            };
            tracing::warn!(cost, wait_secs = wait, "rate limit reached, waiting for refill");
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }

    /// Current usage ratio in `[0.0, 1.0]`; 1.0 means the bucket is drained.
    pub fn usage_ratio(&self) -> f64 {
        let mut state = self.state.lock().expect("bucket lock poisoned");
        self.refill(&mut state);
        if self.capacity <= 0.0 {
            return 0.0;
        }
        1.0 - state.tokens / self.capacity
    }

    /// Clamps the bucket to `capacity - used` when the exchange reports the
    /// authoritative used amount. Only ever lowers the local token count.
    pub fn calibrate(&self, used: f64) {
        let remaining = self.capacity - used;
        if remaining >= 0.0 {
            let mut state = self.state.lock().expect("bucket lock poisoned");
            if remaining < state.tokens {
                state.tokens = remaining;
                tracing::debug!(used, tokens = state.tokens, "calibrated token bucket");
            }
        }
    }
}

/// Per-credential rate limiter with two independent buckets:
/// request weight per rolling minute and order submissions per 10 seconds.
pub struct RateLimiter {
    weight_bucket: TokenBucket,
    order_bucket: TokenBucket,
}

impl RateLimiter {
    /// Official limit is 6,000 weight per minute; keep headroom for other
    /// consumers of the same credential.
    pub const DEFAULT_WEIGHT_CAPACITY: u32 = 5000;
    /// Official limit is 100 orders per 10 seconds.
    pub const DEFAULT_ORDER_CAPACITY: u32 = 80;

    pub fn new() -> Self {
        Self::with_capacity(
            Self::DEFAULT_WEIGHT_CAPACITY,
            Self::DEFAULT_ORDER_CAPACITY,
        )
    }

    pub fn with_capacity(weight_capacity: u32, order_capacity: u32) -> Self {
        tracing::info!(
            weight_capacity,
            order_capacity,
            "rate limiter initialised"
        );
        Self {
            // Weight bucket: capacity per minute -> capacity/60 per second.
            weight_bucket: TokenBucket::new(
                weight_capacity as f64,
                weight_capacity as f64 / 60.0,
            ),
            // Order bucket: capacity per 10 seconds -> capacity/10 per second.
            order_bucket: TokenBucket::new(
                order_capacity as f64,
                order_capacity as f64 / 10.0,
            ),
        }
    }

    /// Consumes API weight, waiting if the budget is exhausted.
    pub async fn acquire_weight(&self, weight: u32) {
        self.weight_bucket.acquire(weight as f64).await;
    }

    /// Consumes one order-submission slot.
    pub async fn acquire_order_slot(&self) {
        self.order_bucket.acquire(1.0).await;
    }

    /// Calibrates the weight bucket from the `X-MBX-USED-WEIGHT-1M` header.
    pub fn calibrate_weight(&self, used_weight: u64) {
        self.weight_bucket.calibrate(used_weight as f64);
    }

    pub fn usage_ratio(&self) -> f64 {
        self.weight_bucket.usage_ratio()
    }

    /// Weight usage >= 80%: callers should defer non-critical requests.
    pub fn is_in_warning_zone(&self) -> bool {
        self.usage_ratio() >= WARNING_THRESHOLD
    }

    /// Weight usage >= 95%: skip everything that is not a sell or a stop.
    pub fn is_in_circuit_breaker(&self) -> bool {
        self.usage_ratio() >= CIRCUIT_BREAKER_THRESHOLD
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

    #[tokio::test(start_paused = true)]
    async fn acquire_on_full_bucket_is_immediate() {
        let bucket = TokenBucket::new(100.0, 10.0);
        let before = Instant::now();
        bucket.acquire(50.0).await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_no_longer_than_deficit_over_rate() {
        let bucket = TokenBucket::new(100.0, 10.0);
        bucket.acquire(100.0).await;

        // Bucket empty; 40 tokens at 10/s must wait ~4s, never much more.
        let before = Instant::now();
        bucket.acquire(40.0).await;
        let waited = before.elapsed();
        assert!(waited >= Duration::from_secs_f64(3.9), "waited {waited:?}");
        assert!(waited <= Duration::from_secs_f64(4.2), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn calibrate_only_lowers_tokens() {
        let limiter = RateLimiter::with_capacity(1000, 10);
        limiter.calibrate_weight(900);
        assert!(limiter.usage_ratio() > 0.85);

        // A lower used-weight report must not refund tokens.
        limiter.calibrate_weight(0);
        assert!(limiter.usage_ratio() > 0.85);
    }

    #[tokio::test(start_paused = true)]
    async fn thresholds_track_usage() {
        let limiter = RateLimiter::with_capacity(100, 10);
        assert!(!limiter.is_in_warning_zone());

        limiter.acquire_weight(85).await;
        assert!(limiter.is_in_warning_zone());
        assert!(!limiter.is_in_circuit_breaker());

        limiter.acquire_weight(11).await;
        assert!(limiter.is_in_circuit_breaker());

        // Refill drains usage back below the thresholds.
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!limiter.is_in_warning_zone());
    }
}
