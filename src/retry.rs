// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delayed Retries
//!
//! Failed deliveries are republished after an exponential backoff. Each pending
//! republish is a tracked task that `cancel_all` stops, so shutting the bus
//! down leaves no timers behind.

use std::{future::Future, sync::Mutex, time::Duration};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::debug;

/// Backoff and attempt budget for failed deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Deliveries a message gets before it is dead-lettered.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        RetryPolicy {
            max_retries,
            base_delay,
        }
    }

    /// Delay before the redelivery that follows a failure at `retry_count`:
    /// `base_delay * 2^retry_count`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Retry count of the next delivery after a failure at `retry_count`, or
    /// `None` once the budget is spent.
    pub fn next_attempt(&self, retry_count: u32) -> Option<u32> {
        let next = retry_count.saturating_add(1);
        (next < self.max_retries).then_some(next)
    }
}

pub(crate) struct RetryScheduler {
    tracker: TaskTracker,
    token: Mutex<CancellationToken>,
}

impl Default for RetryScheduler {
    fn default() -> Self {
        RetryScheduler {
            tracker: TaskTracker::new(),
            token: Mutex::new(CancellationToken::new()),
        }
    }
}

impl RetryScheduler {
    /// Runs `task` after `delay`. Cancellation stops it while waiting or
    /// running.
    pub(crate) fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.current_token();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!("pending retry cancelled"),
                _ = async {
                    tokio::time::sleep(delay).await;
                    task.await
                } => {}
            }
        });
    }

    pub(crate) fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Cancels every pending retry. Retries scheduled afterwards run normally.
    pub(crate) fn cancel_all(&self) -> usize {
        let pending = self.pending();
        let mut token = self.token.lock().unwrap_or_else(|p| p.into_inner());
        token.cancel();
        *token = CancellationToken::new();
        pending
    }

    fn current_token(&self) -> CancellationToken {
        self.token
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert!(policy.backoff(64) >= policy.backoff(2));
    }

    #[test]
    fn budget_allows_three_deliveries() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        assert_eq!(policy.next_attempt(0), Some(1));
        assert_eq!(policy.next_attempt(1), Some(2));
        assert_eq!(policy.next_attempt(2), None);
        assert_eq!(policy.next_attempt(7), None);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_tasks_run_after_delay() {
        let scheduler = RetryScheduler::default();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        scheduler.schedule(Duration::from_secs(2), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_drops_pending_tasks() {
        let scheduler = RetryScheduler::default();
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = runs.clone();
            scheduler.schedule(Duration::from_secs(5), async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(scheduler.cancel_all(), 3);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
