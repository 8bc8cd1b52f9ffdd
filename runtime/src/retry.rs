//! Retry policies for failed event handling.
//!
//! A policy decides whether a failed attempt may be retried and how long to
//! wait first. Policies are pure functions of `(error, attempt)`; they hold no
//! mutable state and can be shared by any number of handlers and workers.
//!
//! Three strategies are provided:
//!
//! - [`ExponentialBackoff`]: `min(max_delay, initial_delay * multiplier^attempt)`
//!   with `±randomization` jitter. Never retries cancellation or deadline errors.
//! - [`FixedDelay`]: the same delay for every attempt.
//! - [`LinearBackoff`]: `min(max_delay, initial_delay + attempt * increment)`.
//!
//! # Example
//!
//! ```rust
//! use eventline_runtime::retry::{ExponentialBackoff, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = ExponentialBackoff::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .multiplier(2.0)
//!     .randomization(0.0)
//!     .build();
//!
//! assert_eq!(policy.delay(3), Duration::from_millis(800));
//! ```

use eventline_core::handler::HandlerError;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Strategy deciding retry eligibility and delay.
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    /// Whether attempt number `attempt` (0-based count of retries already
    /// made) may be followed by another try after `err`.
    fn should_retry(&self, err: &HandlerError, attempt: u32) -> bool;

    /// Delay before the retry following `attempt`.
    fn delay(&self, attempt: u32) -> Duration;

    /// Upper bound on retries.
    fn max_retries(&self) -> u32;
}

impl<P: RetryPolicy + ?Sized> RetryPolicy for Arc<P> {
    fn should_retry(&self, err: &HandlerError, attempt: u32) -> bool {
        (**self).should_retry(err, attempt)
    }

    fn delay(&self, attempt: u32) -> Duration {
        (**self).delay(attempt)
    }

    fn max_retries(&self) -> u32 {
        (**self).max_retries()
    }
}

fn capped(delay_ms: f64, max_delay: Duration) -> Duration {
    let max_ms = max_delay.as_secs_f64() * 1000.0;
    if !delay_ms.is_finite() || delay_ms >= max_ms {
        return max_delay;
    }
    Duration::from_secs_f64(delay_ms.max(0.0) / 1000.0)
}

/// Exponential backoff with jitter.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `initial_delay`: 1 second
/// - `max_delay`: 60 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
/// - `randomization`: 0.1 (±10% jitter)
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap applied before and after jitter
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Jitter fraction in `[0, 1]`
    pub randomization: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ExponentialBackoff {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> ExponentialBackoffBuilder {
        ExponentialBackoffBuilder {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            randomization: 0.1,
        }
    }

    /// Delay for `attempt` before jitter, capped at `max_delay`.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms = self.initial_delay.as_secs_f64() * 1000.0 * self.multiplier.powi(exponent);
        capped(delay_ms, self.max_delay)
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn should_retry(&self, err: &HandlerError, attempt: u32) -> bool {
        !err.is_cancellation() && attempt < self.max_retries
    }

    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.randomization <= 0.0 {
            return base;
        }
        let spread = self.randomization.min(1.0);
        let factor = 1.0 + rand::thread_rng().gen_range(-spread..=spread);
        capped(base.as_secs_f64() * 1000.0 * factor, self.max_delay)
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Builder for [`ExponentialBackoff`].
#[derive(Debug, Clone)]
pub struct ExponentialBackoffBuilder {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    randomization: f64,
}

impl ExponentialBackoffBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set initial delay before first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the jitter fraction (`0.1` means ±10%).
    #[must_use]
    pub const fn randomization(mut self, randomization: f64) -> Self {
        self.randomization = randomization;
        self
    }

    /// Build the [`ExponentialBackoff`].
    #[must_use]
    pub const fn build(self) -> ExponentialBackoff {
        ExponentialBackoff {
            max_retries: self.max_retries,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
            randomization: self.randomization,
        }
    }
}

/// Constant delay between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedDelay {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Delay before every retry
    pub delay: Duration,
}

impl FixedDelay {
    /// Create a fixed-delay policy.
    #[must_use]
    pub const fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }
}

impl RetryPolicy for FixedDelay {
    fn should_retry(&self, _err: &HandlerError, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Delay growing by a fixed increment per attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearBackoff {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Added per attempt
    pub increment: Duration,
    /// Cap
    pub max_delay: Duration,
}

impl LinearBackoff {
    /// Create a linear policy.
    #[must_use]
    pub const fn new(
        max_retries: u32,
        initial_delay: Duration,
        increment: Duration,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_retries,
            initial_delay,
            increment,
            max_delay,
        }
    }
}

impl RetryPolicy for LinearBackoff {
    fn should_retry(&self, _err: &HandlerError, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.increment
            .checked_mul(attempt)
            .and_then(|step| self.initial_delay.checked_add(step))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Run `operation` until it succeeds or `policy` gives up, sleeping
/// `policy.delay(attempt)` between tries.
///
/// Returns the first success. When the policy refuses the very first retry
/// the original error is returned unchanged; otherwise the last error is
/// wrapped in [`HandlerError::Exhausted`] with the number of attempts made.
///
/// # Errors
///
/// See above.
///
/// # Example
///
/// ```rust
/// use eventline_runtime::retry::{FixedDelay, retry_with_policy};
/// use eventline_core::handler::HandlerError;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), HandlerError> {
/// let policy = FixedDelay::new(2, Duration::from_millis(10));
/// let value = retry_with_policy(&policy, "example", |_attempt| async { Ok::<_, HandlerError>(42) }).await?;
/// assert_eq!(value, 42);
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_policy<P, F, Fut, T>(
    policy: &P,
    label: &str,
    mut operation: F,
) -> Result<T, HandlerError>
where
    P: RetryPolicy + ?Sized,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, HandlerError>>,
{
    let mut attempt: u32 = 0;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(handler = label, attempt, "Handler succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if !policy.should_retry(&err, attempt) {
                    if attempt == 0 {
                        tracing::warn!(
                            handler = label,
                            error = %err,
                            "Handler error is not retryable, failing immediately"
                        );
                        return Err(err);
                    }
                    tracing::error!(
                        handler = label,
                        attempt,
                        error = %err,
                        "Handler failed after max retries"
                    );
                    return Err(HandlerError::Exhausted {
                        attempts: attempt + 1,
                        last: Box::new(err),
                    });
                }

                let delay = policy.delay(attempt);
                tracing::warn!(
                    handler = label,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Handler failed, retrying"
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter() -> ExponentialBackoff {
        ExponentialBackoff::builder()
            .initial_delay(Duration::from_millis(100))
            .multiplier(2.0)
            .max_delay(Duration::from_secs(10))
            .randomization(0.0)
            .build()
    }

    #[test]
    fn test_exponential_delay_calculation() {
        let policy = no_jitter();

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_exponential_max_delay_cap() {
        let policy = ExponentialBackoff::builder()
            .initial_delay(Duration::from_millis(1000))
            .multiplier(10.0)
            .max_delay(Duration::from_secs(2))
            .build();

        // 1000ms * 10^5 = 100,000,000ms, capped at 2000ms even with jitter
        assert_eq!(policy.base_delay(5), Duration::from_secs(2));
        assert!(policy.delay(5) <= Duration::from_secs(2));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn test_exponential_refuses_cancellation() {
        let policy = ExponentialBackoff::default();
        assert!(policy.should_retry(&HandlerError::failed("x"), 0));
        assert!(!policy.should_retry(&HandlerError::Cancelled, 0));
        assert!(!policy.should_retry(&HandlerError::DeadlineExceeded, 0));
        assert!(!policy.should_retry(&HandlerError::failed("x"), 3));
    }

    #[test]
    fn test_fixed_and_linear() {
        let fixed = FixedDelay::new(2, Duration::from_millis(50));
        assert_eq!(fixed.delay(0), fixed.delay(7));
        assert!(fixed.should_retry(&HandlerError::Cancelled, 1));
        assert!(!fixed.should_retry(&HandlerError::failed("x"), 2));

        let linear = LinearBackoff::new(
            5,
            Duration::from_millis(100),
            Duration::from_millis(50),
            Duration::from_millis(220),
        );
        assert_eq!(linear.delay(0), Duration::from_millis(100));
        assert_eq!(linear.delay(2), Duration::from_millis(200));
        assert_eq!(linear.delay(3), Duration::from_millis(220));
        assert_eq!(linear.delay(u32::MAX), Duration::from_millis(220));
    }

    proptest! {
        #[test]
        fn exponential_base_is_non_decreasing(
            initial_ms in 1_u64..1_000,
            multiplier in 1.0_f64..4.0,
            max_ms in 1_000_u64..120_000,
        ) {
            let policy = ExponentialBackoff::builder()
                .initial_delay(Duration::from_millis(initial_ms))
                .multiplier(multiplier)
                .max_delay(Duration::from_millis(max_ms))
                .build();
            for attempt in 0..20 {
                prop_assert!(policy.base_delay(attempt) <= policy.base_delay(attempt + 1));
                prop_assert!(policy.base_delay(attempt) <= policy.max_delay);
            }
        }

        #[test]
        fn exponential_jitter_stays_within_bounds(
            attempt in 0_u32..8,
            randomization in 0.0_f64..0.5,
        ) {
            let policy = ExponentialBackoff::builder()
                .initial_delay(Duration::from_millis(100))
                .multiplier(2.0)
                .max_delay(Duration::from_secs(3600))
                .randomization(randomization)
                .build();
            let nominal = 100.0 * 2.0_f64.powi(i32::try_from(attempt).unwrap());
            let actual = policy.delay(attempt).as_secs_f64() * 1000.0;
            prop_assert!(actual >= nominal * (1.0 - randomization) - 0.001);
            prop_assert!(actual <= nominal * (1.0 + randomization) + 0.001);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let policy = FixedDelay::new(3, Duration::from_millis(10));
        let counter = AtomicU32::new(0);

        let result = retry_with_policy(&policy, "test", |_| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(HandlerError::failed(format!("attempt {attempt} failed")))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(counter.load(Ordering::SeqCst), 3); // 2 failures + 1 success
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_retries() {
        let policy = FixedDelay::new(2, Duration::from_millis(10));
        let counter = AtomicU32::new(0);

        let result: Result<(), _> = retry_with_policy(&policy, "test", |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(HandlerError::failed("persistent failure")) }
        })
        .await;

        assert_eq!(
            result,
            Err(HandlerError::Exhausted {
                attempts: 3,
                last: Box::new(HandlerError::failed("persistent failure")),
            })
        );
        assert_eq!(counter.load(Ordering::SeqCst), 3); // Initial + 2 retries
    }

    #[tokio::test]
    async fn test_retry_skips_non_retryable() {
        let policy = ExponentialBackoff::default();
        let counter = AtomicU32::new(0);

        let result: Result<(), _> = retry_with_policy(&policy, "test", |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(HandlerError::Cancelled) }
        })
        .await;

        assert_eq!(result, Err(HandlerError::Cancelled));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
