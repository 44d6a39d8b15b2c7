use std::time::Duration;

use rand::Rng;

/// How an error should be treated by retrying callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Aborts the entire run (invalid credentials, unrecoverable config).
    Fatal,
    /// Worth another attempt after backing off.
    Retryable,
    /// Retried once, then terminal.
    Timeout,
    /// Recorded against the repository, never retried.
    Terminal,
}

/// Bounds for exponential backoff. All fields are configurable defaults,
/// not fixed contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the attempt after `attempt` (1-based) failed.
    /// Doubles per attempt up to `max_delay`, plus up to 50% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.saturating_sub(1).min(20));
        let capped = exp.min(self.max_delay.as_millis() as u64);
        let jitter = rand::rng().random_range(0..=capped / 2);
        Duration::from_millis(capped + jitter)
    }

    /// Whether another attempt is allowed after `attempt` attempts of an
    /// error with the given class.
    pub fn allows(&self, class: ErrorClass, attempt: u32) -> bool {
        match class {
            ErrorClass::Fatal | ErrorClass::Terminal => false,
            ErrorClass::Timeout => attempt < 2,
            ErrorClass::Retryable => attempt < self.max_attempts,
        }
    }
}

/// Retry bookkeeping attached to a task as an explicit value, kept out of
/// the call stack so it can be inspected and tested in isolation.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt: u32,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self { Self { policy, attempt: 0 } }

    /// Attempts recorded so far.
    pub fn attempts(&self) -> u32 { self.attempt }

    /// Record the start of an attempt, returning its 1-based number.
    pub fn begin(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    /// After a failure of the given class: the backoff to sleep before the
    /// next attempt, or `None` when the task must be given up.
    pub fn backoff(&self, class: ErrorClass) -> Option<Duration> {
        self.policy.allows(class, self.attempt).then(|| self.policy.delay(self.attempt))
    }
}
