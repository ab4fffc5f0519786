//! Backoff strategies for retries.
//!
//! # Components
//!
//! - [`ExponentialBackoff`]: stateless `base * 2^attempt` calculator, capped
//! - [`JitteringExponentialBackoff`]: full jitter on top of it, the default
//!   strategy of [`Retry`](super::retry::Retry)

use std::time::Duration;

use crate::simulation::SimulationRng;

/// Computes the delay before the next attempt.
pub trait RetryStrategy {
    /// Delay after `attempt` attempts have been made (1 after the first send).
    fn next_delay(&mut self, attempt: u32) -> Duration;
}

/// Stateless exponential backoff delay calculator.
///
/// For attempt `n` the delay is `base * 2^n`, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Returns `base * 2^attempt`, capped at `max`.
    #[inline]
    pub fn delay(&self, attempt: u32) -> Duration {
        // 2^31 times any non-zero base already saturates realistic caps
        let exponent = attempt.min(31);
        let delay = self.base.saturating_mul(1u32 << exponent);
        delay.min(self.max)
    }

    #[inline]
    pub fn base(&self) -> Duration {
        self.base
    }

    #[inline]
    pub fn max(&self) -> Duration {
        self.max
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&mut self, attempt: u32) -> Duration {
        self.delay(attempt)
    }
}

/// Full jitter exponential backoff: the delay for attempt `n` is drawn
/// uniformly from `[0, min(max, base * 2^n)]`.
///
/// With jitter disabled it degrades to the upper bound.
#[derive(Debug, Clone)]
pub struct JitteringExponentialBackoff {
    bounds: ExponentialBackoff,
    jitter: bool,
    rng: SimulationRng,
}

impl JitteringExponentialBackoff {
    pub fn new(base: Duration, max: Duration, rng: SimulationRng) -> Self {
        Self {
            bounds: ExponentialBackoff::new(base, max),
            jitter: true,
            rng,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Upper bound of the delay for `attempt`.
    pub fn upper_bound(&self, attempt: u32) -> Duration {
        self.bounds.delay(attempt)
    }
}

impl RetryStrategy for JitteringExponentialBackoff {
    fn next_delay(&mut self, attempt: u32) -> Duration {
        let upper = self.bounds.delay(attempt);
        if self.jitter {
            self.rng.gen_duration_up_to(upper)
        } else {
            upper
        }
    }
}
