//! Retry and backoff logic shared by the Backstop storage tiers
//!
//! Every network or disk call in the backup lifecycle is wrapped in one of the
//! helpers below. Errors classify themselves through [`RetryableError`]: transient
//! failures are retried with exponential backoff up to a small attempt budget,
//! anything else is returned to the caller on the first occurrence.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;
use tracing::{debug, warn};

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Bounded exponential backoff policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: usize,
    /// Delay before the first retry
    #[serde(with = "millis")]
    pub initial_interval: Duration,
    /// Upper bound for a single delay
    #[serde(with = "millis")]
    pub max_interval: Duration,
    /// Growth factor applied after every retry
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy tuned for object storage round trips
    pub fn cloud_storage() -> Self {
        Self {
            max_attempts: 4,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            multiplier: 1.5,
        }
    }

    /// Policy for local filesystem operations (shorter delays)
    pub fn local_storage() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }

    /// Retries without sleeping. Meant for tests and dry runs.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// A single attempt, no retries
    pub fn none() -> Self {
        Self::immediate(1)
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_multiplier(self.multiplier)
            .with_max_elapsed_time(None)
            .build()
    }

    fn next_delay(&self, backoff: &mut ExponentialBackoff) -> Duration {
        if self.initial_interval.is_zero() {
            return Duration::ZERO;
        }
        backoff.next_backoff().unwrap_or(self.max_interval)
    }
}

/// Execute `f` until it succeeds, fails permanently, or the attempt budget runs out.
///
/// The closure receives the 1-based attempt number. The last error is returned
/// unchanged so callers keep their own error taxonomy.
pub fn retry<T, E, F>(op_name: &str, policy: &RetryPolicy, mut f: F) -> Result<T, E>
where
    E: RetryableError + Display,
    F: FnMut(usize) -> Result<T, E>,
{
    let mut backoff = policy.backoff();
    let mut attempt = 1;

    loop {
        debug!(operation = op_name, attempt, "attempting operation");
        match f(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = op_name, attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_permanent() => return Err(err),
            Err(err) => {
                if attempt >= policy.max_attempts.max(1) {
                    warn!(operation = op_name, attempt, error = %err, "retry budget exhausted");
                    return Err(err);
                }
                let delay = policy.next_delay(&mut backoff);
                warn!(
                    operation = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                attempt += 1;
            }
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug)]
    enum TestError {
        Flaky,
        Fatal,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl RetryableError for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, TestError::Flaky)
        }
    }

    #[test]
    fn test_successful_operation() {
        let result: Result<&str, TestError> =
            retry("test_op", &RetryPolicy::immediate(3), |_| Ok("success"));
        assert_eq!(result.unwrap(), "success");
    }

    #[test]
    fn test_transient_failure_then_success() {
        let calls = Cell::new(0);
        let result = retry("test_op", &RetryPolicy::immediate(3), |attempt| {
            calls.set(calls.get() + 1);
            if attempt < 3 {
                Err(TestError::Flaky)
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_permanent_failure_is_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), TestError> = retry("test_op", &RetryPolicy::immediate(5), |_| {
            calls.set(calls.get() + 1);
            Err(TestError::Fatal)
        });
        assert!(matches!(result, Err(TestError::Fatal)));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_budget_exhausted_returns_last_error() {
        let calls = Cell::new(0);
        let result: Result<(), TestError> = retry("test_op", &RetryPolicy::immediate(4), |_| {
            calls.set(calls.get() + 1);
            Err(TestError::Flaky)
        });
        assert!(matches!(result, Err(TestError::Flaky)));
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn test_backoff_delays_grow_and_are_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(400),
            multiplier: 2.0,
        };
        let mut backoff = policy.backoff();
        let delays: Vec<Duration> = (0..6).map(|_| policy.next_delay(&mut backoff)).collect();
        // randomization keeps every delay within 1.5x of the cap
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(600)));
        assert!(delays.iter().all(|d| !d.is_zero()));
    }
}
