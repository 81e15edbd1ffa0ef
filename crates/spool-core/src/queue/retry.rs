//! Retry policy: attempt budget and backoff delays.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::WaitExpr;

/// Retry policy applied when a job asks to be retried without saying how.
///
/// `max_attempts` is the default `limit`, `next_delay` the default `wait`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Claims allowed before a retry request turns into `failed`.
    pub max_attempts: u32,

    /// Base delay for the first retry.
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound for a single delay.
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,

    /// Add up to 10% random jitter on top of the computed delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60 * 60),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the next try, given the attempts made so far (1-indexed).
    ///
    /// `base_delay * multiplier^(attempts - 1)`, capped at `max_delay`.
    /// With base=2s, multiplier=2.0: 2s, 4s, 8s, 16s, ...
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());

        let secs = if self.jitter {
            capped + capped * 0.1 * rand::random::<f64>()
        } else {
            capped
        };

        // powi が inf/NaN を返しても、巨大な max_delay でも panic しないように
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }

    /// `next_delay` as a wait expression (whole seconds, rounded up).
    pub fn next_wait(&self, attempts: u32) -> WaitExpr {
        let delay = self.next_delay(attempts);
        let secs = delay.as_secs() + u64::from(delay.subsec_nanos() > 0);
        WaitExpr::from_std(Duration::from_secs(secs))
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
