//! Retry back-off policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the delay grows with the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time.
    Fixed,
    /// `base * attempt²`
    #[default]
    Quadratic,
}

/// Retry policy applied by the store when a job fails transiently.
///
/// The default reproduces the queue's historical schedule: 5, 20 and 45
/// minutes for attempts 1..=3, three retries per job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Assigned to jobs enqueued without an explicit `max_retries`.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5 * 60),
            max_delay: Duration::from_secs(24 * 60 * 60),
            strategy: BackoffStrategy::Quadratic,
        }
    }
}

impl RetryPolicy {
    /// Every failure escalates.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Delay before retry number `attempt`, counting from 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = match (self.strategy, attempt) {
            (_, 0) => 0,
            (BackoffStrategy::Fixed, _) => 1,
            (BackoffStrategy::Quadratic, n) => n.saturating_mul(n),
        };
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Same as [`delay_for_attempt`](Self::delay_for_attempt), as a chrono duration.
    pub fn backoff(&self, attempt: u32) -> chrono::Duration {
        chrono::Duration::from_std(self.delay_for_attempt(attempt))
            .unwrap_or_else(|_| chrono::Duration::days(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn default_schedule_is_5_20_45_minutes() {
        let policy = RetryPolicy::default();
        let delays: Vec<Duration> = (1..=3).map(|n| policy.delay_for_attempt(n)).collect();

        assert_eq!(delays, vec![5 * MINUTE, 20 * MINUTE, 45 * MINUTE]);
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.backoff(2), chrono::Duration::minutes(20));
    }

    #[test]
    fn fixed_policy_ignores_attempt_number() {
        let policy = RetryPolicy::fixed(2, Duration::from_secs(30));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(30));
    }

    #[test]
    fn delay_is_capped_and_never_overflows() {
        let policy = RetryPolicy {
            max_delay: 60 * MINUTE,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(3), 45 * MINUTE);
        assert_eq!(policy.delay_for_attempt(4), 60 * MINUTE);
        assert_eq!(policy.delay_for_attempt(u32::MAX), 60 * MINUTE);
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(RetryPolicy::no_retry().max_retries, 0);
    }
}
