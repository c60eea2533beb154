//! Retry delays for transient processing failures.
//!
//! The delay for attempt `n` is `first × factor^n`, clamped to `max`, plus a
//! random jitter in `[0, jitter]`. The base is derived from the attempt number
//! only, so jitter never compounds.

use std::time::Duration;

use rand::Rng;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_secs(1),
            max: Duration::from_secs(60),
            factor: 2.0,
            jitter: Duration::from_millis(250),
        }
    }
}

impl BackoffPolicy {
    /// Delay without jitter.
    pub fn base(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    pub fn next(&self, attempt: u32) -> Duration {
        let base = self.base(attempt);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}
