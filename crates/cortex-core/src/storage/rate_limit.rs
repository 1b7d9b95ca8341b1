use crate::config::RateLimitConfig;
use crate::error::{CortexError, Result};
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Process-wide token bucket. One token per read or write.
///
/// Independent of per-file locks: callers take a token before the file lock,
/// so a throttled caller never sits on a lock.
pub struct RateLimiter {
    enabled: bool,
    rate: f64,
    capacity: f64,
    max_wait: Duration,
    state: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("enabled", &self.enabled)
            .field("rate", &self.rate)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let capacity = f64::from(config.burst.max(1));
        Self {
            enabled: config.enabled,
            rate: config.ops_per_second.max(f64::MIN_POSITIVE),
            capacity,
            max_wait: Duration::from_millis(config.max_wait_ms),
            state: Mutex::new(Bucket {
                tokens: capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(&RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        })
    }

    /// Take one token, waiting up to `max_wait`.
    pub fn acquire(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let started = Instant::now();
        loop {
            let wait = {
                let mut bucket = self.state.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
                bucket.refilled_at = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate)
            };

            let waited = started.elapsed();
            if waited + wait > self.max_wait {
                return Err(CortexError::RateLimited { waited });
            }
            std::thread::sleep(wait);
        }
    }
}
