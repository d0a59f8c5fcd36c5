//! Retry decisions, kept free of I/O so the backoff math can be tested
//! against synthetic error sequences.

use std::time::Duration;

use crate::error::ErrorKind;

/// What the scheduler should do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

/// Exponential backoff with a per-kind attempt budget.
///
/// Delay schedule for a failed attempt `n` (zero-based):
/// `min(base_delay * 2^n, max_delay)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed for transient failures.
    pub max_attempts: u32,
    /// Total attempts allowed for failures of unknown cause.
    pub unknown_max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            unknown_max_attempts: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_unknown_max_attempts(mut self, max_attempts: u32) -> Self {
        self.unknown_max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, base: Duration, cap: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = cap;
        self
    }

    /// Backoff before retrying after attempt `attempt` failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(31);
        std::cmp::min(self.base_delay.saturating_mul(factor), self.max_delay)
    }

    /// Attempt budget for a failure kind.
    pub fn max_attempts_for(&self, kind: ErrorKind) -> u32 {
        match kind {
            ErrorKind::Transient => self.max_attempts,
            ErrorKind::Unknown => self.unknown_max_attempts.min(self.max_attempts),
            ErrorKind::Permanent => 1,
        }
    }

    /// Decides the fate of a job whose attempt `attempt` (zero-based) just
    /// failed with `kind`.
    pub fn decide(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        if kind == ErrorKind::Permanent {
            return RetryDecision::GiveUp;
        }
        if attempt.saturating_add(1) >= self.max_attempts_for(kind) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay_for_attempt(attempt))
    }
}
