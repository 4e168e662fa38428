//! # Retry Policy
//!
//! Bounded exponential backoff applied per record.
//!
//! ```text
//! attempt index n (0-based)   0      1      2
//! delay before retry          5 s    10 s   (none, budget of 3 spent)
//! ```
//!
//! The attempt budget is a lifetime budget: `attempts` is stored on the
//! record and survives requeueing. A delivery resumes the schedule at the
//! record's stored attempt count.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;

use crate::config::SyncSettings;

/// Exponential backoff with a bounded attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        RetryPolicy {
            max_retries,
            base_delay,
        }
    }

    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self::new(settings.max_retries, settings.retry_delay())
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns true if a record with `attempts` invocations may be called again.
    pub fn allows_attempt(&self, attempts: i64) -> bool {
        attempts < i64::from(self.max_retries)
    }

    /// Delay before retrying after the failed attempt with index `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.ceiling())
    }

    /// Delays a record with a fresh budget would wait, in order.
    pub fn schedule(&self) -> Vec<Duration> {
        let mut backoff = self.backoff_from(0);
        (1..self.max_retries).map(|_| backoff.next_delay()).collect()
    }

    /// Backoff for one delivery of a record that has already used
    /// `attempts` calls. The first delay it yields follows the next call.
    pub fn backoff_from(&self, attempts: i64) -> RecordBackoff {
        let index = u32::try_from(attempts.max(0)).unwrap_or(u32::MAX);
        let ceiling = self.ceiling();
        RecordBackoff {
            inner: ExponentialBackoff {
                current_interval: self.delay_for(index),
                initial_interval: self.base_delay,
                randomization_factor: 0.0,
                multiplier: 2.0,
                max_interval: ceiling,
                max_elapsed_time: None,
                ..Default::default()
            },
        }
    }

    fn ceiling(&self) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << self.max_retries.min(16))
            .max(self.base_delay)
    }
}

/// Backoff state of a single delivery.
pub struct RecordBackoff {
    inner: ExponentialBackoff,
}

impl RecordBackoff {
    /// Next delay, doubling on every call.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self
            .inner
            .next_backoff()
            .unwrap_or(self.inner.max_interval);
        // Drops the sub-millisecond jitter the backoff adds on top of zero
        // randomization.
        Duration::from_millis(delay.as_millis() as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&SyncSettings::default())
    }
}
