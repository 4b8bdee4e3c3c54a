//! Retry policy with capped exponential backoff and jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::{ActionError, ErrorClass, SchedulerError};
use crate::util::serde::duration_ms;

/// Outcome of consulting a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after this delay.
    Retry {
        /// Delay before the next attempt, jitter included.
        after: Duration,
    },
    /// Stop retrying this invocation.
    GiveUp,
}

/// Stateless retry policy. The scheduler keeps the attempt count on the run.
///
/// `delay(attempt) = min(base * 2^(attempt - 1), max_delay)`, plus a uniform
/// jitter in `[0, delay * jitter]`. Attempts beyond `max_retries` and
/// permanent errors give up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    #[serde(with = "duration_ms", rename = "base_ms")]
    pub base: Duration,
    /// Upper bound for the un-jittered delay.
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Failed attempts that may still be retried; attempt `max_retries + 1`
    /// failing gives up.
    pub max_retries: u32,
    /// Jitter fraction in `[0, 1]`.
    #[serde(default)]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), Duration::from_secs(60), 3)
    }
}

impl RetryPolicy {
    /// Exponential backoff without jitter.
    pub const fn exponential(base: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max_delay,
            max_retries,
            jitter: 0.0,
        }
    }

    /// Never retry.
    pub const fn none() -> Self {
        Self::exponential(Duration::ZERO, Duration::ZERO, 0)
    }

    /// Set the jitter fraction (clamped to `[0, 1]`).
    #[must_use]
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Validate the policy values.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Configuration` describing the problem.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(SchedulerError::Configuration(format!(
                "retry jitter must be within [0, 1], got {}",
                self.jitter
            )));
        }
        if self.max_delay < self.base {
            return Err(SchedulerError::Configuration(
                "retry max_delay must not be smaller than base".into(),
            ));
        }
        Ok(())
    }

    /// Un-jittered delay for a failed `attempt` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 2u32.checked_pow(exponent);
        factor
            .and_then(|f| self.base.checked_mul(f))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Decide what to do after `attempt` failed with `error`, using the
    /// thread-local RNG for jitter.
    pub fn next_attempt(&self, attempt: u32, error: &ActionError) -> RetryDecision {
        self.next_attempt_with(attempt, error, &mut rand::rng())
    }

    /// Same as [`RetryPolicy::next_attempt`] with a caller-supplied RNG.
    pub fn next_attempt_with<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        error: &ActionError,
        rng: &mut R,
    ) -> RetryDecision {
        if error.class == ErrorClass::Permanent || attempt > self.max_retries {
            return RetryDecision::GiveUp;
        }
        let delay = self.base_delay(attempt);
        let fraction = self.jitter.clamp(0.0, 1.0) * rng.random_range(0.0..=1.0);
        // f64 rounding can push a product past `delay` near `Duration::MAX`.
        let jitter = if fraction > 0.0 {
            Duration::try_from_secs_f64(delay.as_secs_f64() * fraction)
                .map_or(delay, |jitter| jitter.min(delay))
        } else {
            Duration::ZERO
        };
        RetryDecision::Retry {
            after: delay.saturating_add(jitter),
        }
    }
}
