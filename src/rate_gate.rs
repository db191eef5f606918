use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket admission control in front of every broker call. One shared
/// gate per process; per-endpoint gates are out of scope. Adapted from the
/// sliding-window HTTP rate limiter's config/accounting split into a single
/// async admission gate with continuous refill.
pub struct RateGate {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateGate {
    pub fn new(rate_per_second: f64, burst: u32) -> Self {
        Self {
            rate: rate_per_second,
            burst: burst as f64,
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Blocks until a token is available or `cancel` fires. Returns `false`
    /// on cancellation without consuming a token.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return true;
                }
                let deficit = 1.0 - bucket.tokens;
                Duration::from_secs_f64(deficit / self.rate)
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => continue,
                _ = cancel.cancelled() => return false,
            }
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;
    }
}
