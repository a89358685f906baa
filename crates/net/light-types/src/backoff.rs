//! Reconnect backoff for servers that misbehaved or could not be reached.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The largest exponent applied to the minimum backoff.
///
/// `2^31` times any sensible minimum already saturates the maximum.
const MAX_BACKOFF_EXPONENT: u32 = 31;

/// Exponential backoff capped at a maximum, with bounded jitter.
///
/// The backoff is a pure function of the number of consecutive failures, wall clock time is only
/// involved when the caller turns it into a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Backoff applied after a disconnect without prior failures.
    #[serde(with = "humantime_serde")]
    pub min: Duration,
    /// Upper bound of any backoff.
    #[serde(with = "humantime_serde")]
    pub max: Duration,
    /// Fraction of the backoff added as random jitter, must be in `[0, 1)`.
    pub jitter: f64,
}

impl BackoffConfig {
    /// Returns the backoff for the given number of consecutive failures.
    ///
    /// This doubles with every failure, starting at [`BackoffConfig::min`] for zero failures, and
    /// is capped at [`BackoffConfig::max`].
    pub fn backoff(&self, consecutive_failures: u32) -> Duration {
        let factor = 1u32 << consecutive_failures.min(MAX_BACKOFF_EXPONENT);
        self.min.saturating_mul(factor).min(self.max)
    }

    /// Returns the backoff with jitter applied.
    ///
    /// `sample` is expected to be uniformly distributed in `[0, 1)`. Since the jitter fraction is
    /// below `1` and the base doubles, the result never decreases for more failures.
    pub fn jittered(&self, consecutive_failures: u32, sample: f64) -> Duration {
        let base = self.backoff(consecutive_failures);
        let fraction = (self.jitter.clamp(0.0, 0.99) * sample.clamp(0.0, 1.0)).min(0.99);
        base.saturating_add(base.mul_f64(fraction)).min(self.max)
    }

    /// Returns durations for testing.
    #[cfg(any(test, feature = "test-utils"))]
    pub const fn test() -> Self {
        Self { min: Duration::from_millis(100), max: Duration::from_secs(2), jitter: 0.0 }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { min: Duration::from_secs(5), max: Duration::from_secs(60 * 60), jitter: 0.25 }
    }
}
