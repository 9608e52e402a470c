//! Exponential backoff for retrying failed jobs.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter.
///
/// Delay for attempt `n` is `min(max_delay, base * 2^n)` plus a random
/// jitter of up to `jitter_factor` of the capped delay in either direction.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max_delay: Duration,
    jitter_factor: f64,
    attempt: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 0.1)
    }
}

impl ExponentialBackoff {
    /// Create a backoff starting at `base` and capped at `max_delay`.
    /// Negative jitter factors are clamped to zero.
    pub fn new(base: Duration, max_delay: Duration, jitter_factor: f64) -> Self {
        Self {
            base,
            max_delay,
            jitter_factor: jitter_factor.max(0.0),
            attempt: 0,
        }
    }

    /// Delay for the current attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.max_delay);
        self.attempt = self.attempt.saturating_add(1);

        let spread = exp.as_secs_f64() * self.jitter_factor;
        if spread <= 0.0 {
            return exp;
        }
        let jitter = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((exp.as_secs_f64() + jitter).max(0.0))
    }

    /// Reset after a successful attempt.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
