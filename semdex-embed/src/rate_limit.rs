//! Token bucket limiting provider calls per minute.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Shared by every batch of a pipeline run, or across runs when handed to
/// [`EmbeddingPipeline::with_rate_limiter`](crate::pipeline::EmbeddingPipeline::with_rate_limiter).
///
/// The bucket holds one second's worth of calls (at least one) and refills
/// continuously at `rate_per_minute / 60` tokens per second.
#[derive(Debug)]
pub struct RateLimiter {
    tokens_per_second: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// `None` when `rate_per_minute` is 0, meaning unlimited.
    pub fn per_minute(rate_per_minute: u32) -> Option<Self> {
        if rate_per_minute == 0 {
            return None;
        }
        let tokens_per_second = f64::from(rate_per_minute) / 60.0;
        let capacity = tokens_per_second.max(1.0);
        Some(Self {
            tokens_per_second,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.tokens_per_second).min(self.capacity);
        bucket.last_refill = now;
    }

    /// Take a token if one is available right now.
    pub async fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                (1.0 - bucket.tokens) / self.tokens_per_second
            };
            tracing::trace!(wait_secs = wait, "rate limit reached, waiting");
            tokio::time::sleep(Duration::from_secs_f64(wait.max(0.001))).await;
        }
    }
}
