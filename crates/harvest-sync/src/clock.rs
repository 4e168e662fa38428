//! # Scheduler
//!
//! Time source and sleeping for the engine. Backoff and batch pacing only
//! suspend the current task; nothing in the engine blocks a thread.
//!
//! [`VirtualScheduler`] never waits: each `sleep` advances its clock and is
//! recorded, so tests can assert the exact backoff schedule.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Source of "now" plus a way to wait.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspends the calling task for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Production scheduler backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

#[async_trait]
impl Scheduler for TokioScheduler {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug)]
struct VirtualState {
    now: DateTime<Utc>,
    sleeps: Vec<Duration>,
}

/// Deterministic scheduler for tests.
#[derive(Debug, Clone)]
pub struct VirtualScheduler {
    state: Arc<Mutex<VirtualState>>,
}

impl VirtualScheduler {
    /// Starts at the current wall-clock time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(now: DateTime<Utc>) -> Self {
        VirtualScheduler {
            state: Arc::new(Mutex::new(VirtualState {
                now,
                sleeps: Vec::new(),
            })),
        }
    }

    /// Moves the clock forward without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        let mut state = self.lock();
        state.now += to_chrono(duration);
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.lock().sleeps.clone()
    }

    /// Sum of all recorded sleeps.
    pub fn total_slept(&self) -> Duration {
        self.lock().sleeps.iter().sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VirtualState> {
        // A poisoned lock only means a test panicked mid-sleep.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for VirtualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scheduler for VirtualScheduler {
    fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }

    async fn sleep(&self, duration: Duration) {
        {
            let mut state = self.lock();
            state.now += to_chrono(duration);
            state.sleeps.push(duration);
        }
        tokio::task::yield_now().await;
    }
}

/// Converts a std duration, saturating at chrono's maximum.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_virtual_sleep_advances_clock() {
        let start = Utc::now();
        let scheduler = VirtualScheduler::starting_at(start);

        scheduler.sleep(Duration::from_secs(5)).await;
        scheduler.sleep(Duration::from_secs(10)).await;

        assert_eq!(
            scheduler.sleeps(),
            vec![Duration::from_secs(5), Duration::from_secs(10)]
        );
        assert_eq!(scheduler.now() - start, chrono::Duration::seconds(15));
    }

    #[tokio::test]
    async fn test_advance_is_not_a_sleep() {
        let start = Utc::now();
        let scheduler = VirtualScheduler::starting_at(start);

        scheduler.advance(Duration::from_secs(11));

        assert!(scheduler.sleeps().is_empty());
        assert_eq!(scheduler.now() - start, chrono::Duration::seconds(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_sleeps() {
        let before = tokio::time::Instant::now();
        TokioScheduler.sleep(Duration::from_secs(3)).await;
        assert!(before.elapsed() >= Duration::from_secs(3));
    }
}
