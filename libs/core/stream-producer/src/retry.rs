//! Retry policy for log writes
//!
//! Transient failures are retried with capped exponential backoff and jitter;
//! permanent failures and exhausted budgets end the attempt sequence. A record
//! is never requeued.

use crate::error::{ErrorCategory, PipelineError, WriteError};
use std::time::Duration;

/// Retry configuration for publish attempts
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per record, including the first one
    pub max_attempts: u32,

    /// Delay after the first failed attempt
    pub base_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,

    /// Randomize each delay to 50-100% of its value
    pub use_jitter: bool,
}

impl RetryPolicy {
    /// Create a retry policy with defaults
    ///
    /// Defaults:
    /// - max_attempts: 5
    /// - base_delay: 100ms
    /// - max_delay: 10s
    /// - use_jitter: true
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_attempts == 0 {
            return Err(PipelineError::config("retry max attempts must be at least 1"));
        }
        if self.base_delay > self.max_delay {
            return Err(PipelineError::config(format!(
                "retry base delay ({:?}) exceeds backoff cap ({:?})",
                self.base_delay, self.max_delay
            )));
        }
        Ok(())
    }

    /// Un-jittered delay after `failures` failed attempts (1-based).
    ///
    /// base, 2*base, 4*base, ... capped at `max_delay`.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn next_delay(&self, failures: u32) -> Duration {
        let delay = self.backoff_delay(failures);
        if self.use_jitter {
            apply_jitter(delay)
        } else {
            delay
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            use_jitter: true,
        }
    }
}

/// Why a record stopped being retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    /// The log service rejected the record outright
    Permanent,
    /// Every allowed attempt failed transiently
    Exhausted,
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the delay, then attempt again
    Retry(Duration),
    /// Terminal; the record is counted as permanently failed
    GiveUp(GiveUpReason),
}

/// Per-record retry bookkeeping; lives for one publish.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    attempts: u32,
    last_error: Option<ErrorCategory>,
    next_delay: Option<Duration>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start of an attempt; returns its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<ErrorCategory> {
        self.last_error
    }

    pub fn next_delay(&self) -> Option<Duration> {
        self.next_delay
    }

    /// Record the failure of the current attempt and decide what happens next.
    pub fn record_failure(&mut self, error: &WriteError, policy: &RetryPolicy) -> RetryDecision {
        let category = error.category();
        self.last_error = Some(category);

        let decision = if !category.should_retry() {
            RetryDecision::GiveUp(GiveUpReason::Permanent)
        } else if self.attempts >= policy.max_attempts {
            RetryDecision::GiveUp(GiveUpReason::Exhausted)
        } else {
            RetryDecision::Retry(policy.next_delay(self.attempts))
        };

        self.next_delay = match decision {
            RetryDecision::Retry(delay) => Some(delay),
            RetryDecision::GiveUp(_) => None,
        };
        decision
    }
}

/// Apply jitter to a delay to spread out resubmissions across workers
///
/// Uses a random value between 50% and 100% of the original delay
fn apply_jitter(delay: Duration) -> Duration {
    let factor = 0.5 + rand::random::<f64>() * 0.5;
    delay.mul_f64(factor)
}
