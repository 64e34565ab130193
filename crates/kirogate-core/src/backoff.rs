use std::time::Duration;

use http::StatusCode;
use rand::Rng;

/// Exponential backoff with jitter and a bounded attempt count
///
/// Pure policy: it decides whether and how long to wait, callers own the
/// loop. Kept free of I/O so it can be tested in isolation.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl BackoffPolicy {
    /// Build a policy; `jitter` is clamped to `[0, 1]` and at least one attempt is made
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, 0.0)
    }

    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt is allowed after `attempts_made` attempts
    pub const fn has_attempts_left(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Statuses worth retrying: 429 and any 5xx
    pub fn is_retryable_status(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }

    /// Un-jittered delay before retry number `retry` (zero-based)
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let factor = 1_u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay for a jitter sample in `[-1, 1]`, capped at the maximum delay
    pub fn delay_with_sample(&self, retry: u32, sample: f64) -> Duration {
        let factor = self.jitter.mul_add(sample.clamp(-1.0, 1.0), 1.0);
        self.nominal_delay(retry).mul_f64(factor).min(self.max_delay)
    }

    /// Randomized delay before retry number `retry`
    pub fn delay(&self, retry: u32) -> Duration {
        let sample = rand::rng().random_range(-1.0..=1.0);
        self.delay_with_sample(retry, sample)
    }

    /// Delay honoring a server-supplied hint, capped at the maximum delay
    pub fn delay_with_hint(&self, retry: u32, hint: Option<Duration>) -> Duration {
        hint.map_or_else(|| self.delay(retry), |hint| hint.min(self.max_delay))
    }
}
