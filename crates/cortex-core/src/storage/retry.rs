use crate::config::RetryConfig;
use crate::error::is_transient_io;
use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff for transient I/O.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, with up to 50% random jitter.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_delay);
        let jitter_ms = exp.as_millis() as u64 / 2;
        if jitter_ms == 0 {
            return exp;
        }
        exp + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Run `op`, retrying while it fails with a transient I/O error.
    /// Any other error, or the last transient one, is returned as is.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> std::io::Result<T>
    where
        F: FnMut() -> std::io::Result<T>,
    {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if is_transient_io(&e) && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    log::debug!(
                        "{} failed transiently ({}), retry {}/{} in {:?}",
                        what,
                        e,
                        attempt + 1,
                        self.max_attempts - 1,
                        delay
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}
