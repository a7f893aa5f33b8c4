//! Exponential backoff for failed deliveries.

use chrono::Duration;

use herald_common::config::AppConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts per job, the first one included.
    pub max_attempts: u32,
    /// Delay after the first failure; doubled for every further failure.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.retry_max_attempts,
            Duration::milliseconds(config.retry_base_delay_ms as i64),
        )
    }

    /// What to do after `attempts_made` failed attempts.
    pub fn decide(&self, attempts_made: u32) -> RetryDecision {
        if attempts_made >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        let exponent = attempts_made.saturating_sub(1).min(16);
        RetryDecision::RetryAfter(self.base_delay * 2i32.pow(exponent))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::seconds(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(1), RetryDecision::RetryAfter(Duration::seconds(10)));
        assert_eq!(policy.decide(2), RetryDecision::RetryAfter(Duration::seconds(20)));
        assert_eq!(policy.decide(3), RetryDecision::GiveUp);
        assert_eq!(policy.decide(7), RetryDecision::GiveUp);
    }

    #[test]
    fn test_single_attempt_never_retries() {
        let policy = RetryPolicy::new(1, Duration::seconds(10));
        assert_eq!(policy.decide(1), RetryDecision::GiveUp);
    }

    #[test]
    fn test_longer_schedule() {
        let policy = RetryPolicy::new(5, Duration::seconds(1));
        assert_eq!(policy.decide(4), RetryDecision::RetryAfter(Duration::seconds(8)));
    }
}
