//! Retry timing
//!
//! Delay before the n-th consecutive retry from `disconnected` grows linearly
//! over the first few attempts and then plateaus at twice the configured delay.
//! Every delay is then shortened by a random fraction of up to `jitter` of its
//! length.

use rand::Rng;
use std::time::Duration;
use tether_core::ConnectionConfig;

/// Upper bound on the backoff coefficient
const MAX_BACKOFF_COEFFICIENT: f64 = 2.0;

/// Retry delays for the disconnected and suspended states
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    disconnected_delay: Duration,
    suspended_delay: Duration,
    jitter: f64,
}

impl RetryPolicy {
    /// Policy with explicit delays and jitter ratio in `[0, 1)`
    pub fn new(disconnected_delay: Duration, suspended_delay: Duration, jitter: f64) -> Self {
        Self {
            disconnected_delay,
            suspended_delay,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Policy taken from a connection configuration
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(
            config.disconnected_retry_delay,
            config.suspended_retry_delay,
            config.retry_jitter,
        )
    }

    /// Backoff multiplier for the 1-based `attempt`
    pub fn backoff_coefficient(attempt: u32) -> f64 {
        let attempt = f64::from(attempt.max(1));
        ((attempt + 2.0) / 3.0).min(MAX_BACKOFF_COEFFICIENT)
    }

    fn jittered<R: Rng + ?Sized>(&self, base: Duration, rng: &mut R) -> Duration {
        if self.jitter == 0.0 {
            return base;
        }
        let factor = 1.0 - rng.gen::<f64>() * self.jitter;
        base.mul_f64(factor)
    }

    /// Delay before the 1-based `attempt` while disconnected
    pub fn disconnected_delay(&self, attempt: u32) -> Duration {
        self.disconnected_delay_with(attempt, &mut rand::thread_rng())
    }

    /// [`RetryPolicy::disconnected_delay`] with an explicit RNG
    pub fn disconnected_delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self
            .disconnected_delay
            .mul_f64(Self::backoff_coefficient(attempt));
        self.jittered(base, rng)
    }

    /// Delay before each retry while suspended
    pub fn suspended_delay(&self) -> Duration {
        self.suspended_delay_with(&mut rand::thread_rng())
    }

    /// [`RetryPolicy::suspended_delay`] with an explicit RNG
    pub fn suspended_delay_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        self.jittered(self.suspended_delay, rng)
    }
}
