//! Retry with exponential backoff for retryable errors (a held lock).

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;

/// Backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Multiplier applied per attempt
    pub backoff_factor: f64,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    /// Delay after attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// A config that tries once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Run `operation`, retrying while it fails with a retryable error.
///
/// Non-retryable errors return immediately; after the last attempt the last
/// error is returned.
pub fn with_retry<T, F>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() || attempt + 1 >= attempts => return Err(e),
            Err(e) => {
                let delay = config.delay_for_attempt(attempt);
                log::debug!(
                    "Attempt {}/{} failed: {e}. Retrying in {:?}",
                    attempt + 1,
                    attempts,
                    delay
                );
                thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::cell::Cell;

    fn conflict() -> Error {
        Error::LockConflict {
            pid: 1,
            operation: "apply".into(),
            created_at: "now".into(),
        }
    }

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig::new(max_attempts, Duration::from_millis(1))
    }

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(5),
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(5));
    }

    #[test]
    fn test_success_first_try() {
        let result = with_retry(&RetryConfig::no_retry(), || Ok::<_, Error>(7));
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn test_non_retryable_error_returns_immediately() {
        let calls = Cell::new(0);
        let result: Result<()> = with_retry(&fast(5), || {
            calls.set(calls.get() + 1);
            Err(Error::Other("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_retryable_error_is_retried() {
        let calls = Cell::new(0);
        let result = with_retry(&fast(3), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(conflict())
            } else {
                Ok("acquired")
            }
        });
        assert_eq!(result.unwrap(), "acquired");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_exhausted_returns_last_error() {
        let calls = Cell::new(0);
        let result: Result<()> = with_retry(&fast(2), || {
            calls.set(calls.get() + 1);
            Err(conflict())
        });
        assert!(matches!(result, Err(Error::LockConflict { .. })));
        assert_eq!(calls.get(), 2);
    }
}
