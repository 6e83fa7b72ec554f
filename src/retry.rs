//! Retry configuration for activity execution.

use std::time::Duration;

/// Delay applied between failed attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Retry immediately.
    None,
    /// Same delay before every retry.
    Fixed { delay: Duration },
    /// `base * attempt`, capped at `max`.
    Linear { base: Duration, max: Duration },
    /// `base * multiplier^(attempt - 1)`, capped at `max`.
    Exponential {
        base: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffStrategy {
    /// Delay to wait after `attempt` (1-based) failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Linear { base, max } => base.saturating_mul(attempt).min(*max),
            BackoffStrategy::Exponential { base, multiplier, max } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let nanos = base.as_nanos() as f64 * multiplier.powi(exponent);
                if !nanos.is_finite() || nanos >= max.as_nanos() as f64 {
                    *max
                } else {
                    Duration::from_nanos(nanos.round() as u64)
                }
            }
        }
    }
}

/// Bounded retry policy for an activity.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    /// Per-attempt timeout. A timed out attempt counts as a retryable failure.
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::default(),
            timeout: None,
        }
    }
}

impl RetryPolicy {
    /// # Panics
    ///
    /// Panics if `max_attempts` is zero.
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self::new(1).with_backoff(BackoffStrategy::None)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }
}
