//! Deadline tracking for multi-step operations.
//!
//! A [`TimeoutHelper`] is created once per public operation and threaded
//! through every await point so the steps share a single budget.

use std::{future::Future, time::Duration};

use tokio::time::{Instant, timeout_at};

use crate::error::CommunicationError;

/// Tracks the remaining budget of an operation.
#[derive(Clone, Copy, Debug)]
pub struct TimeoutHelper {
    budget: Duration,
    deadline: Option<Instant>,
}

impl TimeoutHelper {
    /// Start tracking `budget` from now.
    ///
    /// Budgets too large to represent as an instant never expire.
    #[must_use]
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            deadline: Instant::now().checked_add(budget),
        }
    }

    /// The budget the helper was created with.
    #[must_use]
    pub fn budget(&self) -> Duration { self.budget }

    /// Time left before the deadline, saturating at zero.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline
            .map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()))
    }

    /// Returns true once the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool { self.deadline.is_some_and(|d| d <= Instant::now()) }

    /// Build the error reported when `operation` runs out of time.
    #[must_use]
    pub fn elapsed(&self, operation: &'static str) -> CommunicationError {
        CommunicationError::timeout(operation, self.budget)
    }

    /// Drive `fut` to completion or fail with a timeout naming `operation`.
    ///
    /// # Errors
    ///
    /// Returns [`CommunicationError::Timeout`] if the deadline passes first.
    pub async fn run<F: Future>(
        &self,
        operation: &'static str,
        fut: F,
    ) -> Result<F::Output, CommunicationError> {
        match self.deadline {
            Some(deadline) => timeout_at(deadline, fut)
                .await
                .map_err(|_| self.elapsed(operation)),
            None => Ok(fut.await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn run_times_out_after_budget() {
        let helper = TimeoutHelper::new(Duration::from_millis(50));
        let result = helper
            .run("send", tokio::time::sleep(Duration::from_secs(1)))
            .await;
        match result {
            Err(CommunicationError::Timeout { operation, budget }) => {
                assert_eq!(operation, "send");
                assert_eq!(budget, Duration::from_millis(50));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(helper.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_shrinks_as_time_passes() {
        let helper = TimeoutHelper::new(Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(helper.remaining(), Duration::from_secs(6));
    }

    #[tokio::test]
    async fn unbounded_budget_never_expires() {
        let helper = TimeoutHelper::new(Duration::MAX);
        assert!(!helper.is_expired());
        assert_eq!(helper.remaining(), Duration::MAX);
        let value = helper.run("receive", async { 7 }).await.expect("no deadline");
        assert_eq!(value, 7);
    }
}
