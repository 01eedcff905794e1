//! Pluggable reconnection policy.

use crate::error::ChannelError;
use rand::Rng;
use std::time::Duration;

/// A decision returned by a [`ReconnectPolicy`]: whether to retry, and
/// after how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    pub fn retry_after(delay: Duration) -> Self {
        Self { should_retry: true, delay }
    }

    pub fn give_up() -> Self {
        Self { should_retry: false, delay: Duration::ZERO }
    }
}

/// `(last_error, attempt_number) -> (should_retry, delay)`. Attempt
/// numbering starts at 0 and resets to 0 on a successful connect.
pub trait ReconnectPolicy: Send + Sync {
    fn decide(&self, last_error: &ChannelError, attempt_number: u32) -> RetryDecision;
}

/// Constant delay between attempts, unconditionally retrying unless
/// `max_retries` (handled by the caller) is exhausted.
#[derive(Debug, Clone, Copy)]
pub struct FixedInterval {
    pub interval: Duration,
}

impl FixedInterval {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl ReconnectPolicy for FixedInterval {
    fn decide(&self, _last_error: &ChannelError, _attempt_number: u32) -> RetryDecision {
        RetryDecision::retry_after(self.interval)
    }
}

/// `delay = min(max_delay, initial * multiplier^attempt)`, with optional
/// ±25% jitter.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self { initial, max_delay, multiplier, jitter: false }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn decide(&self, _last_error: &ChannelError, attempt_number: u32) -> RetryDecision {
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(attempt_number as i32);
        let base = Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()));
        let delay = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.75..=1.25);
            Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
        } else {
            base
        };
        RetryDecision::retry_after(delay)
    }
}

/// Caller-supplied decision function, for when neither fixed-interval nor
/// exponential backoff fits.
pub struct CustomPolicy<F>(pub F)
where
    F: Fn(&ChannelError, u32) -> RetryDecision + Send + Sync;

impl<F> ReconnectPolicy for CustomPolicy<F>
where
    F: Fn(&ChannelError, u32) -> RetryDecision + Send + Sync,
{
    fn decide(&self, last_error: &ChannelError, attempt_number: u32) -> RetryDecision {
        (self.0)(last_error, attempt_number)
    }
}

/// Tracks the attempt counter a reconnection engine drives through a
/// policy: increments on failure, resets to 0 on success.
#[derive(Debug, Default)]
pub struct AttemptCounter(u32);

impl AttemptCounter {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn current(&self) -> u32 {
        self.0
    }

    pub fn record_failure(&mut self) -> u32 {
        let attempt = self.0;
        self.0 = self.0.saturating_add(1);
        attempt
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }
}

/// `max_retries == -1` means unlimited.
pub fn retry_budget_exhausted(attempt_number: u32, max_retries: i32) -> bool {
    max_retries != -1 && (attempt_number as i64) > max_retries as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err() -> ChannelError {
        ChannelError::new(crate::error::ErrorKind::ConnectionRefused, "refused")
    }

    #[test]
    fn fixed_interval_never_gives_up() {
        let policy = FixedInterval::new(Duration::from_millis(50));
        for attempt in 0..5 {
            let d = policy.decide(&err(), attempt);
            assert!(d.should_retry);
            assert_eq!(d.delay, Duration::from_millis(50));
        }
    }

    #[test]
    fn exponential_backoff_caps_at_max_delay() {
        let policy = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1), 2.0);
        let d0 = policy.decide(&err(), 0);
        let d5 = policy.decide(&err(), 5);
        assert_eq!(d0.delay, Duration::from_millis(100));
        assert_eq!(d5.delay, Duration::from_secs(1));
    }

    #[test]
    fn custom_policy_gives_up_after_k_attempts() {
        let policy = CustomPolicy(|_err: &ChannelError, attempt: u32| {
            if attempt < 3 { RetryDecision::retry_after(Duration::from_millis(1)) } else { RetryDecision::give_up() }
        });
        assert!(policy.decide(&err(), 2).should_retry);
        assert!(!policy.decide(&err(), 3).should_retry);
    }

    #[test]
    fn attempt_counter_resets_on_success() {
        let mut counter = AttemptCounter::new();
        assert_eq!(counter.record_failure(), 0);
        assert_eq!(counter.record_failure(), 1);
        assert_eq!(counter.current(), 2);
        counter.reset();
        assert_eq!(counter.current(), 0);
    }

    #[test]
    fn retry_budget() {
        assert!(!retry_budget_exhausted(5, -1));
        assert!(!retry_budget_exhausted(5, 5));
        assert!(retry_budget_exhausted(6, 5));
    }
}
