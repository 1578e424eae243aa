//! Token-bucket rate limiter
//!
//! The bucket holds up to `burst` tokens and refills continuously at `rate` tokens
//! per second. Every admitted call takes one token; when less than one token is left
//! the call is rejected with [`Error::RateLimitExceeded`] instead of waiting.
//!
//! # Example
//!
//! ```rust
//! use resilience_machines::{execute, Context, Error, Operation, RateLimiter, RateLimiterConfig};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let limiter = RateLimiter::new(RateLimiterConfig { rate: 100.0, burst: 1 });
//! let op = Operation::new(|_ctx| async { Ok::<_, std::io::Error>("ok") });
//!
//! assert!(execute(Context::background(), &op, &[&limiter]).await.is_ok());
//! assert!(matches!(
//!     execute(Context::background(), &op, &[&limiter]).await,
//!     Err(Error::RateLimitExceeded)
//! ));
//! # }
//! ```

use crate::{
    clock::{Clock, SystemClock},
    errors::Error,
    pipeline::{Operation, Policy},
};
use std::sync::{Arc, Mutex, PoisonError};

/// Rate limiter configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    /// Tokens added per second
    pub rate: f64,
    /// Bucket capacity, and the number of calls admitted back to back from full
    pub burst: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rate: 10.0,
            burst: 10,
        }
    }
}

impl RateLimiterConfig {
    fn normalized(self) -> Self {
        let defaults = Self::default();
        Self {
            rate: if self.rate.is_finite() && self.rate > 0.0 {
                self.rate
            } else {
                defaults.rate
            },
            burst: if self.burst == 0 {
                defaults.burst
            } else {
                self.burst
            },
        }
    }
}

/// Bucket contents, only ever touched under the lock
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill_at: f64,
}

impl TokenBucket {
    fn refill(&mut self, config: &RateLimiterConfig, now: f64) {
        let elapsed = (now - self.last_refill_at).max(0.0);
        self.tokens = (self.tokens + elapsed * config.rate).min(config.burst as f64);
        self.last_refill_at = now;
    }
}

/// Token-bucket admission gate shared by every call through it
///
/// Clones share the same bucket.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    clock: Arc<dyn Clock>,
    bucket: Arc<Mutex<TokenBucket>>,
}

impl RateLimiter {
    /// Create a limiter driven by the system clock
    pub fn new(config: RateLimiterConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Create a limiter driven by a custom clock; the bucket starts full
    pub fn with_clock(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        let config = config.normalized();
        let bucket = TokenBucket {
            tokens: config.burst as f64,
            last_refill_at: clock.monotonic_time(),
        };

        Self {
            config,
            clock,
            bucket: Arc::new(Mutex::new(bucket)),
        }
    }

    /// Requests per second, burst equal to the rate
    pub fn per_second(requests_per_second: usize) -> Self {
        Self::new(RateLimiterConfig {
            rate: requests_per_second as f64,
            burst: requests_per_second,
        })
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Refill and take one token if available; check and decrement are one step
    pub fn try_acquire(&self) -> bool {
        let now = self.clock.monotonic_time();
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);

        bucket.refill(&self.config, now);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently in the bucket, after refilling
    pub fn available_tokens(&self) -> f64 {
        let now = self.clock.monotonic_time();
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);

        bucket.refill(&self.config, now);
        bucket.tokens
    }
}

impl<T, E> Policy<T, E> for RateLimiter
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn wrap(&self, next: Operation<T, E>) -> Operation<T, E> {
        let limiter = self.clone();

        Operation::from_fn(move |ctx| {
            let limiter = limiter.clone();
            let next = next.clone();
            async move {
                if let Some(err) = ctx.err() {
                    return Err(err.into());
                }

                if !limiter.try_acquire() {
                    tracing::debug!(
                        rate = limiter.config.rate,
                        burst = limiter.config.burst,
                        "rate limit exceeded"
                    );
                    return Err(Error::RateLimitExceeded);
                }

                next.call(ctx).await
            }
        })
    }
}
