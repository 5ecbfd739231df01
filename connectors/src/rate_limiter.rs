use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket throttle bounding outbound request rate for one connector
/// instance. Never shared across connectors, even against the same tenant.
pub struct RateLimiter {
    state: Mutex<BucketState>,
    max_tokens: f64,
    tokens_per_ms: f64,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        let max_tokens = requests_per_minute.max(1) as f64;
        Self {
            state: Mutex::new(BucketState {
                tokens: max_tokens,
                last_refill: Instant::now(),
            }),
            max_tokens,
            tokens_per_ms: max_tokens / 60_000.0,
        }
    }

    /// Consume one token, suspending until the bucket has refilled enough.
    pub async fn wait_for_slot(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap();
                let now = Instant::now();
                let elapsed_ms = now.duration_since(state.last_refill).as_millis() as f64;
                state.tokens =
                    (state.tokens + elapsed_ms * self.tokens_per_ms).min(self.max_tokens);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                let deficit = 1.0 - state.tokens;
                Duration::from_millis((deficit / self.tokens_per_ms).ceil() as u64)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_within_capacity_is_immediate() {
        let limiter = RateLimiter::new(3);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.wait_for_slot().await;
        }
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn exceeding_capacity_blocks_until_refill() {
        // 2 rpm refills one token every 30 virtual seconds.
        let limiter = RateLimiter::new(2);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.wait_for_slot().await;
        }
        assert!(start.elapsed() >= Duration::from_secs(29));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_never_exceeds_capacity() {
        let limiter = RateLimiter::new(2);
        // Idle far longer than a full refill; only 2 tokens may accumulate.
        tokio::time::sleep(Duration::from_secs(600)).await;
        let start = Instant::now();
        limiter.wait_for_slot().await;
        limiter.wait_for_slot().await;
        assert!(start.elapsed() < Duration::from_millis(10));
        limiter.wait_for_slot().await;
        assert!(start.elapsed() >= Duration::from_secs(29));
    }
}
