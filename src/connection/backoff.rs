//! Retry delays for the connection acceptor.

use std::time::Duration;

/// Exponential back-off applied after failed accepts.
///
/// The acceptor waits `initial_delay` after the first failure and doubles
/// the wait on each consecutive failure, up to `max_delay`. A successful
/// accept resets the delay.
///
/// # Default Values
/// - `initial_delay`: 10 milliseconds
/// - `max_delay`: 1 second
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Wait after the first failure.
    pub initial_delay: Duration,
    /// Upper bound on the wait.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl BackoffConfig {
    /// Raise both delays to at least one millisecond and order them.
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use corewcf::connection::BackoffConfig;
    ///
    /// let backoff = BackoffConfig {
    ///     initial_delay: Duration::from_millis(5),
    ///     max_delay: Duration::ZERO,
    /// }
    /// .normalized();
    /// assert_eq!(backoff.initial_delay, Duration::from_millis(1));
    /// assert_eq!(backoff.max_delay, Duration::from_millis(5));
    /// ```
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.initial_delay = self.initial_delay.max(Duration::from_millis(1));
        self.max_delay = self.max_delay.max(Duration::from_millis(1));
        if self.initial_delay > self.max_delay {
            std::mem::swap(&mut self.initial_delay, &mut self.max_delay);
        }
        self
    }

    /// Delay following `current`.
    #[must_use]
    pub fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).clamp(self.initial_delay, self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_up_to_the_cap() {
        let backoff = BackoffConfig {
            initial_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(1),
        };
        let second = backoff.next(backoff.initial_delay);
        assert_eq!(second, Duration::from_millis(600));
        assert_eq!(backoff.next(second), Duration::from_secs(1));
    }
}
