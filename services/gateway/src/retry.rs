//! Retry policy
//!
//! A policy says how many attempts are allowed and how long to wait between
//! them. [`RetryState`] walks a policy one failure at a time, and
//! [`retry_with_policy`] drives an async operation through it.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Retry error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetryError {
    /// Every allowed attempt failed
    #[error("Gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    /// Retrying was cancelled
    #[error("Retry cancelled")]
    Cancelled,
}

/// Attempt budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempts {
    /// At most this many attempts in total
    Bounded(u32),
    Unbounded,
}

/// Delay between consecutive attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    /// `initial * multiplier^(n-1)` after the n-th failure, capped at `max`
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
    },
}

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub attempts: Attempts,
    pub backoff: Backoff,
    /// Spread delays by ±25%
    pub jitter: bool,
}

impl RetryPolicy {
    /// Limited attempts, doubling delay
    pub fn bounded_exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            attempts: Attempts::Bounded(max_attempts),
            backoff: Backoff::Exponential {
                initial,
                max,
                multiplier: 2.0,
            },
            jitter: false,
        }
    }

    /// Retry forever, same delay every time
    pub fn unbounded_fixed(delay: Duration) -> Self {
        Self {
            attempts: Attempts::Unbounded,
            backoff: Backoff::Fixed(delay),
            jitter: false,
        }
    }

    /// Retry forever, doubling from `min` up to `max`
    pub fn unbounded_exponential(min: Duration, max: Duration) -> Self {
        Self {
            attempts: Attempts::Unbounded,
            backoff: Backoff::Exponential {
                initial: min,
                max,
                multiplier: 2.0,
            },
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after the `failures`-th consecutive failure (1-based)
    pub fn delay_for(&self, failures: u32) -> Duration {
        let mut delay = match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let exponent = failures.saturating_sub(1).min(63) as i32;
                let scaled = initial.as_secs_f64() * multiplier.powi(exponent);
                if scaled.is_finite() && scaled < max.as_secs_f64() {
                    Duration::from_secs_f64(scaled)
                } else {
                    max
                }
            },
        };

        // Add jitter (±25% of delay); inclusive so sub-millisecond delays still sample
        if self.jitter && !delay.is_zero() {
            let base = delay.as_secs_f64();
            let spread = base * 0.25;
            let jitter = rand::thread_rng().gen_range(-spread..=spread);
            delay = Duration::from_secs_f64((base + jitter).max(0.0));
        }

        delay
    }

    /// Whether another attempt is allowed after `failures` failures
    pub fn allows_another(&self, failures: u32) -> bool {
        match self.attempts {
            Attempts::Bounded(max) => failures < max,
            Attempts::Unbounded => true,
        }
    }

    pub fn describe_budget(&self) -> String {
        match self.attempts {
            Attempts::Bounded(max) => max.to_string(),
            Attempts::Unbounded => "∞".to_string(),
        }
    }
}

/// Consecutive-failure counter for one policy
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    failures: u32,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failure; the delay before the next attempt, or `None` if the
    /// budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.policy.allows_another(self.failures) {
            Some(self.policy.delay_for(self.failures))
        } else {
            None
        }
    }

    /// Forget past failures after a success
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Run `op` until it succeeds, the budget is spent, or `cancel` fires
pub async fn retry_with_policy<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut state = RetryState::new(policy.clone());

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let attempt = state.failures() + 1;
        info!(
            attempt,
            "{}: attempt {}/{}",
            label,
            attempt,
            policy.describe_budget()
        );

        let error = tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = op(attempt) => match result {
                Ok(value) => return Ok(value),
                Err(e) => e.to_string(),
            },
        };

        match state.next_delay() {
            Some(delay) => {
                warn!(attempt, "{} failed: {}. Retrying in {:?}", label, error, delay);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {},
                }
            },
            None => {
                warn!(attempt, "{} failed: {}. No attempts left", label, error);
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last_error: error,
                });
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::bounded_exponential(
            5,
            Duration::from_millis(100),
            Duration::from_secs(10),
        );

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
    }

    #[test]
    fn test_max_delay_limit() {
        let policy =
            RetryPolicy::unbounded_exponential(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_gateway_initial_connect_schedule() {
        // 5 s doubling, capped at 60 s, five attempts in total
        let mut state = RetryState::new(RetryPolicy::bounded_exponential(
            5,
            Duration::from_secs(5),
            Duration::from_secs(60),
        ));

        let delays: Vec<_> = std::iter::from_fn(|| state.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(20),
                Duration::from_secs(40),
            ]
        );
        assert_eq!(state.failures(), 5);
    }

    #[test]
    fn test_unbounded_never_exhausts_and_resets() {
        let mut state = RetryState::new(RetryPolicy::unbounded_fixed(Duration::from_secs(2)));
        for _ in 0..1000 {
            assert_eq!(state.next_delay(), Some(Duration::from_secs(2)));
        }
        state.reset();
        assert_eq!(state.failures(), 0);
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let policy =
            RetryPolicy::unbounded_fixed(Duration::from_millis(1000)).with_jitter(true);
        for _ in 0..100 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(750) && delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_jitter_on_sub_millisecond_delay() {
        let policy =
            RetryPolicy::unbounded_fixed(Duration::from_micros(400)).with_jitter(true);
        for _ in 0..100 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_micros(299) && delay <= Duration::from_micros(501));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_budget() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::bounded_exponential(
            3,
            Duration::from_millis(10),
            Duration::from_secs(1),
        );

        let result: Result<(), _> =
            retry_with_policy(&policy, &CancellationToken::new(), "connect", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("refused")
            })
            .await;

        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 3,
                last_error: "refused".to_string()
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let policy = RetryPolicy::bounded_exponential(
            5,
            Duration::from_millis(10),
            Duration::from_secs(1),
        );

        let result = retry_with_policy(&policy, &CancellationToken::new(), "connect", |attempt| async move {
            if attempt < 3 {
                Err("refused")
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_cancelled_during_delay() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::unbounded_fixed(Duration::from_secs(3600));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let result: Result<(), _> =
            retry_with_policy(&policy, &cancel, "connect", |_| async { Err::<(), _>("down") })
                .await;
        assert_eq!(result, Err(RetryError::Cancelled));
    }
}
