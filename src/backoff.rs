//! Reconnect delay policy: capped exponential backoff plus jitter.

use rand::Rng;
use std::time::Duration;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_JITTER: Duration = Duration::from_millis(500);

/// Largest doubling exponent we compute before the cap takes over anyway.
const MAX_EXPONENT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            cap: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base: Duration, cap: Duration, jitter: Duration) -> Self {
        Self { base, cap, jitter }
    }

    /// Deterministic part of the delay for the `attempt`-th consecutive
    /// failure (1-based): `min(base * 2^(attempt - 1), cap)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
        self.base.saturating_mul(1u32 << exponent).min(self.cap)
    }

    /// Delay with a caller-supplied jitter fraction in `[0, 1]`.
    pub fn delay_with_jitter(&self, attempt: u32, fraction: f64) -> Duration {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.backoff(attempt) + self.jitter.mul_f64(fraction)
    }

    /// Delay with uniformly random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let fraction = rand::thread_rng().gen_range(0.0..=1.0);
        self.delay_with_jitter(attempt, fraction)
    }

    /// Largest delay this policy can produce
    pub fn max_delay(&self) -> Duration {
        self.cap + self.jitter
    }
}
