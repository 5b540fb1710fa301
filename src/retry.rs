//! Retry policies and backoff timing for recovery attempts

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Strategy for growing the wait time between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Constant wait time for all attempts
    Fixed,
    /// Wait time grows linearly with the number of completed attempts
    Linear,
    /// Wait time grows by `multiplier` per completed attempt
    Exponential { multiplier: f64 },
}

impl BackoffStrategy {
    /// Calculate the raw wait time after `completed` attempts (1-based:
    /// the wait before the second attempt has `completed == 1`).
    /// The result is clamped to `[0, max_wait]` by the caller's policy.
    fn duration(&self, completed: u32, initial_wait: Duration) -> Duration {
        match self {
            Self::Fixed => initial_wait,
            Self::Linear => initial_wait.saturating_mul(completed),
            Self::Exponential { multiplier } => {
                let factor = multiplier.powi(completed.saturating_sub(1) as i32);
                let millis = initial_wait.as_millis() as f64 * factor;
                if millis.is_finite() && millis >= 0.0 {
                    Duration::from_millis(millis.min(u64::MAX as f64) as u64)
                } else {
                    Duration::MAX
                }
            }
        }
    }
}

/// Retry timing and budget configuration.
///
/// A policy is an immutable value: it computes wait times and carries the
/// attempt and total-time ceilings that [`crate::recovery::RecoveryAttempt`]
/// enforces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Wait before the second attempt
    pub initial_wait: Duration,
    /// Ceiling for any single inter-attempt wait
    pub max_wait: Duration,
    /// Budget for the whole retry sequence
    pub max_total_time: Duration,
    /// How the wait grows between attempts
    pub backoff: BackoffStrategy,
    /// Whether wait times are randomized
    pub jitter_enabled: bool,
    /// Jitter amplitude as a fraction of the computed wait (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_policy()
    }
}

impl RetryPolicy {
    /// Standard policy: 3 attempts, 1s initial wait doubling up to 1 minute,
    /// 5 minute total budget, no jitter.
    pub fn default_policy() -> Self {
        Self {
            max_attempts: 3,
            initial_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(60),
            max_total_time: Duration::from_secs(300),
            backoff: BackoffStrategy::Exponential { multiplier: 2.0 },
            jitter_enabled: false,
            jitter_factor: 0.1,
        }
    }

    /// Fast, persistent retrying for failures expected to clear quickly.
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 10,
            initial_wait: Duration::from_millis(100),
            max_wait: Duration::from_secs(10),
            max_total_time: Duration::from_secs(120),
            backoff: BackoffStrategy::Exponential { multiplier: 1.5 },
            jitter_enabled: true,
            jitter_factor: 0.2,
        }
    }

    /// Slow, reluctant retrying for failures that are expensive to repeat.
    pub fn conservative() -> Self {
        Self {
            max_attempts: 2,
            initial_wait: Duration::from_secs(5),
            max_wait: Duration::from_secs(120),
            max_total_time: Duration::from_secs(600),
            backoff: BackoffStrategy::Exponential { multiplier: 3.0 },
            jitter_enabled: false,
            jitter_factor: 0.1,
        }
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_wait: Duration::ZERO,
            max_wait: Duration::ZERO,
            max_total_time: Duration::ZERO,
            backoff: BackoffStrategy::Fixed,
            jitter_enabled: false,
            jitter_factor: 0.0,
        }
    }

    /// Wait time before the given attempt (1-based).
    ///
    /// Returns zero before the first attempt. Afterwards the backoff
    /// function is applied to the number of completed attempts, clamped to
    /// `max_wait`, and optionally perturbed by up to ± `jitter_factor` of
    /// the computed wait, floored at zero.
    pub fn wait_time(&self, attempt_number: u32) -> Duration {
        if attempt_number <= 1 {
            return Duration::ZERO;
        }

        let completed = attempt_number - 1;
        let mut wait = self.backoff.duration(completed, self.initial_wait);
        if wait > self.max_wait {
            wait = self.max_wait;
        }

        if self.jitter_enabled {
            wait = self.apply_jitter(wait);
        }

        wait
    }

    fn apply_jitter(&self, wait: Duration) -> Duration {
        let range = wait.as_secs_f64() * self.jitter_factor;
        if range <= 0.0 {
            return wait;
        }

        let jitter = rand::rng().random_range(-range..=range);
        Duration::from_secs_f64((wait.as_secs_f64() + jitter).max(0.0))
    }
}
