use std::thread;
use std::time::Duration;

use rand::Rng;

use crate::error::HarvestError;

/// Bounded retry with exponential backoff and additive random jitter. Every
/// registry fetch and file download runs under the same policy: 5 attempts,
/// waits of `base * multiplier^n` plus a uniform jitter draw between waits.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub tries: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub jitter_secs: (u64, u64),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            tries: 5,
            base_delay: Duration::from_secs(5),
            multiplier: 2,
            jitter_secs: (2, 9),
        }
    }
}

impl RetryPolicy {
    /// Same attempt budget as the default policy with zero waits. Intended
    /// for tests and for callers that handle pacing themselves.
    pub fn immediate() -> Self {
        Self {
            tries: 5,
            base_delay: Duration::ZERO,
            multiplier: 2,
            jitter_secs: (0, 0),
        }
    }

    fn wait_before(&self, retry_index: u32) -> Duration {
        let backoff = self.base_delay * self.multiplier.saturating_pow(retry_index);
        let (low, high) = self.jitter_secs;
        let jitter = if high > low {
            rand::thread_rng().gen_range(low..=high)
        } else {
            low
        };
        backoff + Duration::from_secs(jitter)
    }

    /// Runs `op` until it succeeds or the attempt budget is exhausted; the
    /// final error is returned unchanged. An explicit loop, never recursion.
    pub fn run<T, F>(&self, mut op: F) -> Result<T, HarvestError>
    where
        F: FnMut() -> Result<T, HarvestError>,
    {
        let tries = self.tries.max(1);
        let mut attempt = 0u32;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= tries {
                        return Err(err);
                    }
                    thread::sleep(self.wait_before(attempt - 1));
                }
            }
        }
    }
}
