//! Speed limiting using a token bucket
//!
//! One [`SpeedLimiter`] is shared by every block of a downloader, so the limit
//! applies to the transfer as a whole and the blocks split the bandwidth
//! between them according to demand.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Bandwidth limiter shared across the blocks of a transfer
///
/// Tokens are bytes. The bucket refills at `limit_bps` and holds at most one
/// second worth of tokens. A chunk larger than the available tokens is let
/// through immediately and leaves the bucket in debt; the caller then sleeps
/// until the debt is paid. This keeps the average rate at the limit without
/// splitting chunks. Without a limit every `acquire` passes at once.
#[derive(Clone, Debug)]
pub struct SpeedLimiter {
    bucket: Arc<Mutex<Bucket>>,
}

#[derive(Debug)]
struct Bucket {
    limit_bps: Option<u64>,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        let Some(limit_bps) = self.limit_bps else {
            return;
        };
        let capacity = limit_bps as f64;
        self.tokens = (self.tokens + elapsed * capacity).min(capacity);
    }
}

impl SpeedLimiter {
    /// Create a limiter for `limit_bps` bytes per second
    ///
    /// The bucket starts full, so the first second of traffic is not delayed.
    ///
    /// ```
    /// use segment_dl::speed_limiter::SpeedLimiter;
    ///
    /// // 10 MB/s across all blocks
    /// let limiter = SpeedLimiter::new(10 * 1024 * 1024);
    /// ```
    #[must_use]
    pub fn new(limit_bps: u64) -> Self {
        Self::with_limit(Some(limit_bps))
    }

    /// Create a limiter from an optional limit (None = unlimited)
    #[must_use]
    pub fn with_limit(limit_bps: Option<u64>) -> Self {
        let limit_bps = limit_bps.map(|l| l.max(1));
        Self {
            bucket: Arc::new(Mutex::new(Bucket {
                limit_bps,
                tokens: limit_bps.unwrap_or(0) as f64,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Change the limit; takes effect on the next `acquire`
    ///
    /// Lifting the limit and setting it again starts from a full bucket.
    pub async fn set_limit(&self, limit_bps: Option<u64>) {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(Instant::now());
        match limit_bps.map(|l| l.max(1)) {
            Some(limit) => {
                let tokens = match bucket.limit_bps {
                    Some(_) => bucket.tokens,
                    None => limit as f64,
                };
                bucket.limit_bps = Some(limit);
                bucket.tokens = tokens.min(limit as f64);
            }
            None => {
                bucket.limit_bps = None;
                bucket.tokens = 0.0;
            }
        }
    }

    /// Current limit in bytes per second (None = unlimited)
    pub async fn limit_bps(&self) -> Option<u64> {
        self.bucket.lock().await.limit_bps
    }

    /// Wait until `bytes` may be transferred
    pub async fn acquire(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }

        let wait = {
            let mut bucket = self.bucket.lock().await;
            let Some(limit_bps) = bucket.limit_bps else {
                return;
            };
            bucket.refill(Instant::now());
            bucket.tokens -= bytes as f64;
            if bucket.tokens >= 0.0 {
                return;
            }
            Duration::from_secs_f64(-bucket.tokens / limit_bps as f64)
        };

        tracing::trace!(bytes, wait_ms = wait.as_millis() as u64, "Throttling chunk");
        tokio::time::sleep(wait).await;
    }
}
