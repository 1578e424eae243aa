//! ResilienceMachines - composable reliability policies for async operations
//!
//! This crate wraps a fallible async [`Operation`] in any combination of:
//! - [`Retry`] with fixed, linear or exponential backoff and optional jitter
//! - [`Timeout`] racing each invocation against a deadline
//! - [`CircuitBreaker`], a state machine (Closed → Open → HalfOpen) shared across calls
//! - [`RateLimiter`], a token bucket that rejects instead of waiting
//!
//! Policies nest in the order given to [`execute`], first one outermost. Every call
//! carries a [`Context`] for cancellation and deadlines, and every failure is one
//! [`Error`] value the caller can match on directly.
//!
//! # Example
//!
//! ```rust
//! use resilience_machines::{
//!     execute, CircuitBreaker, Context, Operation, RateLimiter, Retry, RetryConfig, Timeout,
//! };
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let retry = Retry::new(RetryConfig {
//!     max_attempts: 3,
//!     initial_delay: Duration::from_millis(10),
//!     ..Default::default()
//! });
//! let breaker = CircuitBreaker::builder("inventory")
//!     .failure_threshold(5)
//!     .open_timeout(Duration::from_secs(30))
//!     .on_open(|name| eprintln!("circuit {} opened", name))
//!     .build();
//! let limiter = RateLimiter::per_second(100);
//! let timeout = Timeout::after(Duration::from_millis(500));
//!
//! let op = Operation::new(|_ctx| async { Ok::<_, std::io::Error>(42) });
//!
//! // Retry outermost, so each attempt passes through the breaker, limiter and timeout
//! let result = execute(
//!     Context::background(),
//!     &op,
//!     &[&retry, &breaker, &limiter, &timeout],
//! )
//! .await;
//! assert_eq!(result.unwrap(), 42);
//! # }
//! ```

pub mod builder;
pub mod callbacks;
pub mod circuit;
pub mod classifier;
pub mod clock;
pub mod context;
pub mod errors;
pub mod pipeline;
pub mod rate_limiter;
pub mod retry;
pub mod tally;
pub mod timeout;

pub use builder::CircuitBuilder;
pub use callbacks::Callbacks;
pub use circuit::{CircuitBreaker, CircuitState, Config};
pub use classifier::{DefaultClassifier, FailureClassifier, FailureContext, PredicateClassifier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{Context, ContextError};
pub use errors::Error;
pub use pipeline::{Operation, Pipeline, Policy, compose, execute};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use retry::{Backoff, Retry, RetryConfig};
pub use timeout::{DEFAULT_TIMEOUT, Timeout, TimeoutConfig};
