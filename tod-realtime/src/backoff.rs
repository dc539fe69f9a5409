//! Capped exponential backoff with jitter

use std::time::Duration;

use rand::Rng;

/// Reconnect delay schedule
///
/// `delay(n) = min(base * 2^(n-1), cap)`, scaled by a random factor in
/// `[0.5, 1.0]` when jitter is enabled.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: bool,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            jitter: true,
            attempt: 0,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Advance to the next attempt and return its delay
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);

        let factor = 2u32.saturating_pow(self.attempt - 1);
        let delay = self.base.saturating_mul(factor).min(self.cap);

        if self.jitter {
            delay.mul_f64(rand::rng().random_range(0.5..=1.0))
        } else {
            delay
        }
    }
}
