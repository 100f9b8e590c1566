//! Retry scheduling for failed task executions
//!
//! Pure functions: nothing here sleeps or touches the broker. The executor
//! asks for a [`RetryDecision`] after each failure and acts on it.

use crate::protocol::RetryPolicy;
use std::time::Duration;

/// What to do after a task attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run the task again as `attempt` after waiting `delay`
    Retry { attempt: u32, delay: Duration },
    /// Retries are exhausted or not allowed; report the failure
    GiveUp { attempts: u32 },
}

/// Computes retry delays from a producer-supplied policy
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryScheduler;

impl RetryScheduler {
    /// Delay before retry number `attempt + 1`
    ///
    /// The whole stepped range from `interval_start` to `interval_max` is
    /// covered once per attempt, so the delay grows linearly with the attempt
    /// number. Non-finite or non-positive results yield zero.
    pub fn calculate_timeout(policy: &RetryPolicy, attempt: u32) -> Duration {
        let span = policy.interval_max - policy.interval_start;
        let total_intervals = (span / policy.interval_step).ceil();
        let total_time = total_intervals * policy.interval_step;
        let millis = total_time * 1000.0 * (f64::from(attempt) + 1.0);

        if !millis.is_finite() || millis <= 0.0 {
            return Duration::ZERO;
        }
        // f64 -> u64 casts saturate, fractional milliseconds are truncated
        Duration::from_millis(millis as u64)
    }

    /// Decide whether the failed `attempt` is retried
    ///
    /// `retries_allowed` is the retry count from the message headers. A
    /// missing policy means the task is not retried.
    pub fn decide(
        retries_allowed: u32,
        attempt: u32,
        policy: Option<&RetryPolicy>,
    ) -> RetryDecision {
        match policy {
            Some(policy) if retries_allowed > attempt => RetryDecision::Retry {
                attempt: attempt + 1,
                delay: Self::calculate_timeout(policy, attempt),
            },
            _ => RetryDecision::GiveUp {
                attempts: attempt + 1,
            },
        }
    }
}
