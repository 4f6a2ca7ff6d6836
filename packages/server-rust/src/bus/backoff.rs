//! Exponential reconnect backoff, owned per connection.

use std::time::Duration;

use rand::Rng;

/// Reconnect backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed (0.0 disables jitter).
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

/// Attempt counter producing capped exponential delays.
///
/// Each bus client owns its own `Backoff`; the counter is reset on every
/// successful connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Number of delays handed out since the last reset.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Returns the delay for the next retry and advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        self.attempt = self.attempt.saturating_add(1);

        let max = self.config.max.as_secs_f64();
        let raw = self.config.base.as_secs_f64() * self.config.multiplier.powi(exponent);
        let capped = if raw.is_finite() { raw.min(max) } else { max };

        let jittered = if self.config.jitter > 0.0 {
            let spread = capped * self.config.jitter;
            capped + rand::rng().random_range(-spread..=spread)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.clamp(0.0, max))
    }
}
