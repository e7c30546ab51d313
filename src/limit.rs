//! A token-bucket rate limiter used to cap the upload direction of tunneled connections.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket with `capacity` tokens refilled at `refill_rate` tokens per second. For
/// upload limiting both are set to the configured bytes/second.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: u64, refill_rate: u64) -> Self {
        TokenBucket {
            capacity: capacity as f64,
            refill_rate: refill_rate as f64,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Waits until `amount` tokens are available and consumes them. Requests larger than the
    /// capacity are clamped so they can eventually be satisfied.
    pub async fn wait_for_tokens(&self, amount: usize) {
        let amount = (amount as f64).min(self.capacity);
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
                state.last_refill = now;
                if state.tokens >= amount {
                    state.tokens -= amount;
                    return;
                }
                (amount - state.tokens) / self.refill_rate
            };
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_tokens_within_capacity_pass_immediately() {
        let bucket = TokenBucket::new(1024, 1024);
        let start = Instant::now();
        bucket.wait_for_tokens(512).await;
        bucket.wait_for_tokens(512).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drained_bucket_waits_for_refill() {
        let bucket = TokenBucket::new(1000, 1000);
        bucket.wait_for_tokens(1000).await;
        let start = Instant::now();
        bucket.wait_for_tokens(500).await;
        // 500 tokens at 1000/s is half a second
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(start.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_request_is_clamped_to_capacity() {
        let bucket = TokenBucket::new(100, 100);
        // Without clamping this would never complete
        bucket.wait_for_tokens(10_000).await;
    }
}
