//! Backoff for failed jobs.
//!
//! Stateless, like the interpreter's other policy helpers: everything is
//! derived from the configuration and the attempt number.

use chrono::{DateTime, Duration, Utc};
use tokenflow_types::config::JobExecutorConfig;

/// Exponential backoff with an upper bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_secs: u64,
    pub max_secs: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &JobExecutorConfig) -> Self {
        Self {
            base_secs: config.retry_backoff_secs,
            max_secs: config.max_backoff_secs,
        }
    }

    /// Delay before the next attempt after the `attempt`-th failure
    /// (1-based): `base * 2^(attempt - 1)`, capped at `max_secs`.
    pub fn backoff_secs(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(63);
        self.base_secs
            .saturating_mul(1u64 << exponent)
            .min(self.max_secs)
    }

    /// When a job that failed for the `attempt`-th time becomes due again.
    pub fn next_due(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        let secs = i64::try_from(self.backoff_secs(attempt)).unwrap_or(i64::MAX);
        Duration::try_seconds(secs)
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&JobExecutorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = RetryPolicy {
            base_secs: 10,
            max_secs: 60,
        };
        assert_eq!(policy.backoff_secs(1), 10);
        assert_eq!(policy.backoff_secs(2), 20);
        assert_eq!(policy.backoff_secs(3), 40);
        assert_eq!(policy.backoff_secs(4), 60);
        assert_eq!(policy.backoff_secs(200), 60);
    }

    #[test]
    fn next_due_is_in_the_future() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        assert_eq!(policy.next_due(now, 1), now + Duration::seconds(10));
    }

    #[test]
    fn huge_backoff_does_not_overflow() {
        let policy = RetryPolicy {
            base_secs: u64::MAX,
            max_secs: u64::MAX,
        };
        assert_eq!(policy.next_due(Utc::now(), 5), DateTime::<Utc>::MAX_UTC);
    }
}
