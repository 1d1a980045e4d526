//! Backoff for establishing mesh connections while peers are still starting up.
//!
//! Protocol requests are never retried; this only paces `connect` attempts.

use rand::{thread_rng, Rng};
use std::time::Duration;

/// Doubling backoff with an optional cap and symmetric jitter.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Option<Duration>,
    jitter: f64,
}

impl RetryPolicy {
    pub fn exponential(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: None,
            jitter: 0.0,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = (!max_delay.is_zero()).then_some(max_delay);
        self
    }

    /// Spreads each delay uniformly over `delay * (1 ± fraction)`.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Starts counting attempts. The first attempt is assumed to be under way.
    pub fn handle(&self) -> RetryHandle {
        RetryHandle {
            policy: self.clone(),
            attempts: 1,
        }
    }

    fn backoff(&self, retry: usize) -> Duration {
        let shift = retry.saturating_sub(1).min(31) as u32;
        let mut delay = self.base_delay.saturating_mul(1u32 << shift);
        if let Some(cap) = self.max_delay {
            delay = delay.min(cap);
        }
        if delay.is_zero() || self.jitter == 0.0 {
            return delay;
        }
        let factor = thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        delay.mul_f64(factor)
    }
}

pub struct RetryHandle {
    policy: RetryPolicy,
    attempts: usize,
}

impl RetryHandle {
    /// Delay to sleep before another attempt, or `None` once the policy is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        let delay = self.policy.backoff(self.attempts);
        self.attempts += 1;
        Some(delay)
    }

    /// Attempts started so far, including the first.
    pub fn attempts(&self) -> usize {
        self.attempts
    }
}
