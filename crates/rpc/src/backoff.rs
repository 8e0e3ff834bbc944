//! Bounded exponential reconnect delay.

use std::time::Duration;

/// Growth factor between consecutive attempts.
const FACTOR: f64 = 1.5;

/// Reconnect delay policy: `min * 1.5^attempt`, clamped to `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    min: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before reconnect attempt number `attempt` (zero-based).
    pub fn next(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.min.as_secs_f64() * FACTOR.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max.max(self.min);
        }
        Duration::from_secs_f64(secs).max(self.min)
    }
}
