// src/poll.rs
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Bounded, cancellable polling of an idempotent read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready(T),
    /// Every attempt came back empty.
    Exhausted,
    Cancelled,
}

impl RetryPolicy {
    /// User-operation receipts: 30 polls, 2 s apart.
    pub const USER_OP_RECEIPT: RetryPolicy = RetryPolicy {
        max_attempts: 30,
        interval: Duration::from_secs(2),
    };

    /// Upper bound on the time spent before giving up.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts
    }

    /// Wait one interval, then call `attempt` with the 1-based attempt number;
    /// repeat until it yields a value, attempts run out, or `cancel` fires.
    pub async fn poll<T, F, Fut>(&self, cancel: &CancellationToken, mut attempt: F) -> PollOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        for n in 1..=self.max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => return PollOutcome::Cancelled,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return PollOutcome::Cancelled,
                result = attempt(n) => result,
            };

            if let Some(value) = result {
                return PollOutcome::Ready(value);
            }
        }

        PollOutcome::Exhausted
    }
}
