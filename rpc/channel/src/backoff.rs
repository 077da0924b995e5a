//! Exponential backoff with jitter for connection and resolution retries.

use rand::Rng;
use std::time::Duration;

/// Backoff tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct BackoffOptions {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
            multiplier: 1.6,
            jitter: 0.2,
        }
    }
}

/// Exponential backoff state. Each failure widens the next delay up to the
/// maximum; success resets to the initial delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    options: BackoffOptions,
    next_delay: Duration,
}

impl Backoff {
    pub fn new(options: BackoffOptions) -> Self {
        Self {
            options,
            next_delay: options.initial_delay,
        }
    }

    /// Take the current delay (with jitter applied) and widen the next one.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next_delay;
        let widened = base.as_secs_f64() * self.options.multiplier;
        self.next_delay = Duration::from_secs_f64(
            widened.min(self.options.max_delay.as_secs_f64()),
        );

        let jitter_factor = if self.options.jitter > 0.0 {
            rand::rng().random_range(-self.options.jitter..=self.options.jitter)
        } else {
            0.0
        };
        Duration::from_secs_f64((base.as_secs_f64() * (1.0 + jitter_factor)).max(0.0))
    }

    /// Reset after a successful attempt.
    pub fn reset(&mut self) {
        self.next_delay = self.options.initial_delay;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffOptions::default())
    }
}
