// Retry strategy implementations used by the ledger client's transport retry budget.

use std::time::Duration;

/// Retry strategy trait for calculating retry delays.
pub trait RetryStrategy: Send + Sync {
    /// Calculate the delay before the next retry attempt.
    /// Returns None if max retries exceeded.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    /// Check if more retries are allowed.
    fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries()
    }

    /// The maximum number of retries this strategy allows.
    fn max_retries(&self) -> u32;
}

/// Fixed delay retry strategy. The ledger client uses this with
/// `max_retries = 3` and `delay = 4s`, matching the spec's retry budget for
/// transport errors and malformed JSON.
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
    max_retries: u32,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_retries: u32) -> Self {
        Self { delay, max_retries }
    }
}

impl RetryStrategy for FixedDelay {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        Some(self.delay)
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}
