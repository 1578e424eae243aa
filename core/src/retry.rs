//! Retry policy with fixed, linear or exponential backoff
//!
//! Delays are computed per attempt, clamped to `max_delay`, optionally jittered by
//! up to half their length and clamped again. Waiting is raced against the
//! invocation [`Context`], so cancellation interrupts a pending retry immediately.

use crate::{
    context::{Context, ContextError},
    errors::Error,
    pipeline::{Operation, Policy},
};
use rand::Rng;
use std::time::Duration;

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Always `initial_delay`
    Fixed,
    /// `initial_delay × (attempt + 1)`
    Linear,
    /// `initial_delay × 2^attempt`
    #[default]
    Exponential,
}

/// Retry policy configuration
///
/// Zero-valued numeric fields fall back to their defaults, so
/// `RetryConfig { jitter: false, ..Default::default() }` and friends are always usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one
    pub max_attempts: usize,
    /// Base delay fed to the backoff formula
    pub initial_delay: Duration,
    /// Upper bound for any single delay, jitter included
    pub max_delay: Duration,
    pub backoff: Backoff,
    /// Add up to 50% random extra delay to spread out retry storms
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff: Backoff::Exponential,
            jitter: true,
        }
    }
}

impl RetryConfig {
    fn normalized(self) -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: if self.max_attempts == 0 {
                defaults.max_attempts
            } else {
                self.max_attempts
            },
            initial_delay: if self.initial_delay.is_zero() {
                defaults.initial_delay
            } else {
                self.initial_delay
            },
            max_delay: if self.max_delay.is_zero() {
                defaults.max_delay
            } else {
                self.max_delay
            },
            ..self
        }
    }

    /// Deterministic part of the delay before attempt `attempt + 1`, already clamped
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            Backoff::Fixed => self.initial_delay,
            Backoff::Linear => self.initial_delay.saturating_mul(attempt.saturating_add(1)),
            Backoff::Exponential => {
                let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
                self.initial_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    /// Full delay before attempt `attempt + 1`, jitter included
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.backoff_delay(attempt);
        if !self.jitter {
            return delay;
        }

        let half = u64::try_from(delay.as_nanos() / 2).unwrap_or(u64::MAX);
        if half == 0 {
            return delay;
        }

        let extra = Duration::from_nanos(rand::rng().random_range(0..half));
        delay.saturating_add(extra).min(self.max_delay)
    }
}

/// Re-invokes the wrapped operation on failure
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    config: RetryConfig,
}

impl Retry {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config: config.normalized(),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    async fn run<T, E>(config: RetryConfig, next: Operation<T, E>, ctx: Context) -> Result<T, Error<E>>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let mut attempt: u32 = 0;

        loop {
            if let Some(err) = ctx.err() {
                return Err(err.into());
            }

            let err = match next.call(ctx.clone()).await {
                Ok(value) => return Ok(value),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => err,
            };

            let attempts_made = attempt as usize + 1;
            if attempts_made >= config.max_attempts {
                tracing::debug!(attempts = attempts_made, "retry attempts exhausted");
                return Err(err);
            }

            let delay = config.delay(attempt);
            tracing::debug!(
                attempt = attempts_made,
                delay_ms = delay.as_millis() as u64,
                "attempt failed, retrying"
            );

            tokio::select! {
                biased;

                _ = ctx.done() => {
                    return Err(ctx.err().unwrap_or(ContextError::Cancelled).into());
                }
                _ = tokio::time::sleep(delay) => {}
            }

            attempt = attempt.saturating_add(1);
        }
    }
}

impl Default for Retry {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl<T, E> Policy<T, E> for Retry
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn wrap(&self, next: Operation<T, E>) -> Operation<T, E> {
        let config = self.config;
        Operation::from_fn(move |ctx| Self::run(config, next.clone(), ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::execute;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    fn no_jitter(backoff: Backoff, initial_ms: u64) -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(initial_ms),
            backoff,
            jitter: false,
            ..Default::default()
        }
    }

    /// Operation failing `failures` times before succeeding, counting invocations
    fn flaky(failures: usize, calls: Arc<AtomicUsize>) -> Operation<&'static str, String> {
        Operation::new(move |_ctx| {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= failures {
                    Err(format!("failure {}", n))
                } else {
                    Ok("success")
                }
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_successful() {
        let calls = Arc::new(AtomicUsize::new(0));
        let retry = Retry::new(no_jitter(Backoff::Fixed, 10));

        let result = execute(Context::background(), &flaky(0, calls.clone()), &[&retry]).await;

        assert_eq!(result, Ok("success"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_once_then_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let retry = Retry::new(no_jitter(Backoff::Fixed, 10));

        let start = Instant::now();
        let result = execute(Context::background(), &flaky(1, calls.clone()), &[&retry]).await;

        assert_eq!(result, Ok("success"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_attempts_fail_returns_last_error() {
        for max_attempts in 1..=5 {
            let calls = Arc::new(AtomicUsize::new(0));
            let retry = Retry::new(RetryConfig {
                max_attempts,
                ..no_jitter(Backoff::Fixed, 10)
            });

            let result =
                execute(Context::background(), &flaky(usize::MAX, calls.clone()), &[&retry]).await;

            assert_eq!(result, Err(Error::Operation(format!("failure {}", max_attempts))));
            assert_eq!(calls.load(Ordering::SeqCst), max_attempts);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_wait() {
        let calls = Arc::new(AtomicUsize::new(0));
        let retry = Retry::new(no_jitter(Backoff::Fixed, 100));

        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        let start = Instant::now();
        let result = execute(ctx, &flaky(usize::MAX, calls.clone()), &[&retry]).await;

        assert_eq!(result, Err(Error::DeadlineExceeded));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50) && elapsed < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_before_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let retry = Retry::new(no_jitter(Backoff::Fixed, 200));

        let ctx = Context::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = execute(ctx, &flaky(1, calls.clone()), &[&retry]).await;

        assert_eq!(result, Err(Error::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_makes_no_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let retry = Retry::default();

        let ctx = Context::background();
        ctx.cancel();
        let result = execute(ctx, &flaky(0, calls.clone()), &[&retry]).await;

        assert_eq!(result, Err(Error::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    async fn observed_delays(config: RetryConfig, failures: usize) -> Vec<Duration> {
        let stamps = Arc::new(Mutex::new(Vec::<Instant>::new()));
        let stamps_clone = Arc::clone(&stamps);
        let calls = Arc::new(AtomicUsize::new(0));

        let op = Operation::new(move |_ctx| {
            let stamps = Arc::clone(&stamps_clone);
            let calls = Arc::clone(&calls);
            async move {
                stamps.lock().unwrap().push(Instant::now());
                if calls.fetch_add(1, Ordering::SeqCst) < failures {
                    Err("failed")
                } else {
                    Ok("success")
                }
            }
        });

        let _ = execute(Context::background(), &op, &[&Retry::new(config)]).await;

        let stamps = stamps.lock().unwrap();
        stamps.windows(2).map(|pair| pair[1] - pair[0]).collect()
    }

    /// Each observed delay must match its expected value within scheduling tolerance
    fn assert_delays(actual: &[Duration], expected_ms: &[u64]) {
        assert_eq!(actual.len(), expected_ms.len(), "delays: {:?}", actual);
        for (delay, ms) in actual.iter().zip(expected_ms) {
            let expected = Duration::from_millis(*ms);
            assert!(
                *delay >= expected && *delay <= expected + Duration::from_millis(2),
                "expected delay around {:?}, got {:?}",
                expected,
                delay
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_backoff() {
        let delays = observed_delays(no_jitter(Backoff::Exponential, 10), 2).await;
        assert_delays(&delays, &[10, 20]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_backoff() {
        let config = RetryConfig {
            max_attempts: 4,
            ..no_jitter(Backoff::Linear, 10)
        };
        let delays = observed_delays(config, 3).await;
        assert_delays(&delays, &[10, 20, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_backoff() {
        let delays = observed_delays(no_jitter(Backoff::Fixed, 10), 2).await;
        assert_delays(&delays, &[10, 10]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_delay_clamping() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(150),
            backoff: Backoff::Exponential,
            jitter: false,
        };
        let delays = observed_delays(config, usize::MAX).await;
        assert_delays(&delays, &[100, 150, 150, 150]);
    }

    #[test]
    fn test_backoff_formula() {
        let exponential = no_jitter(Backoff::Exponential, 100).normalized();
        assert_eq!(exponential.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(exponential.backoff_delay(3), Duration::from_millis(800));
        assert_eq!(exponential.backoff_delay(200), Duration::from_secs(5));

        let linear = no_jitter(Backoff::Linear, 100).normalized();
        assert_eq!(linear.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(linear.backoff_delay(4), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_bounds() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff: Backoff::Fixed,
            jitter: true,
            ..Default::default()
        };

        for _ in 0..200 {
            let delay = config.delay(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay < Duration::from_millis(150));
        }
    }

    #[test]
    fn test_jitter_capped_by_max_delay() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(120),
            backoff: Backoff::Fixed,
            jitter: true,
            ..Default::default()
        };

        for _ in 0..200 {
            assert!(config.delay(0) <= Duration::from_millis(120));
        }
    }

    #[test]
    fn test_zero_config_uses_defaults() {
        let retry = Retry::new(RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff: Backoff::default(),
            jitter: true,
        });

        assert_eq!(retry.config(), &RetryConfig::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_options() {
        let calls = Arc::new(AtomicUsize::new(0));

        let result = execute(
            Context::background(),
            &flaky(1, calls.clone()),
            &[&Retry::default()],
        )
        .await;

        assert_eq!(result, Ok("success"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inner_cancellation_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let op: Operation<(), &'static str> = Operation::from_fn(move |_ctx| {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Cancelled)
            }
        });

        let result = execute(Context::background(), &op, &[&Retry::default()]).await;

        assert_eq!(result, Err(Error::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_cancel_not_retried_after_deadline_passes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let op: Operation<(), &'static str> = Operation::new(move |_ctx| {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                // Ignores its context and fails late
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err("late failure")
            }
        });

        let parent = Context::background();
        let ctx = parent.with_timeout(Duration::from_millis(10));
        let canceller = parent.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            canceller.cancel();
        });

        let result = execute(ctx, &op, &[&Retry::new(no_jitter(Backoff::Fixed, 5))]).await;

        assert_eq!(result, Err(Error::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
