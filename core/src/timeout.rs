//! Timeout policy
//!
//! Races the wrapped operation against a deadline. The operation runs on its own
//! tokio task with a child [`Context`] carrying the deadline. If the deadline wins,
//! the child context is cancelled and the task is left to finish on its own: the
//! timeout bounds how long the caller waits, not how long the operation runs. An
//! operation that ignores its context keeps running (and holding whatever it holds)
//! after the caller has moved on.

use crate::{
    context::{Context, ContextError},
    errors::Error,
    pipeline::{Operation, Policy},
};
use std::time::Duration;

/// Duration used when a timeout is configured with `Duration::ZERO`
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout policy configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Maximum time the caller waits; `None` disables the policy
    pub duration: Option<Duration>,
}

impl TimeoutConfig {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration: Some(duration),
        }
    }

    /// A timeout that passes calls straight through
    pub fn disabled() -> Self {
        Self { duration: None }
    }

    fn normalized(self) -> Self {
        match self.duration {
            Some(Duration::ZERO) => Self::new(DEFAULT_TIMEOUT),
            _ => self,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

/// Bounds how long a caller waits for the wrapped operation
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    config: TimeoutConfig,
}

impl Timeout {
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            config: config.normalized(),
        }
    }

    pub fn after(duration: Duration) -> Self {
        Self::new(TimeoutConfig::new(duration))
    }

    /// Effective duration, `None` when disabled
    pub fn duration(&self) -> Option<Duration> {
        self.config.duration
    }

    /// Run `next` against a child context that expires after `duration`
    async fn race<T, E>(
        duration: Duration,
        next: Operation<T, E>,
        ctx: Context,
    ) -> Result<T, Error<E>>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }

        let child = ctx.with_timeout(duration);
        let handle = tokio::spawn(next.call(child.clone()));

        tokio::select! {
            biased;

            joined = handle => match joined {
                Ok(outcome) => {
                    // A caller that went away outranks whatever the operation returned.
                    if let Some(parent) = ctx.err() {
                        child.cancel();
                        return Err(parent.into());
                    }
                    // An operation that gave up because it saw the deadline lost the race.
                    let expired = child.err() == Some(ContextError::DeadlineExceeded);
                    child.cancel();
                    if expired { Err(Error::DeadlineExceeded) } else { outcome }
                }
                Err(join_error) if join_error.is_panic() => {
                    std::panic::resume_unwind(join_error.into_panic())
                }
                Err(_) => Err(Error::Cancelled),
            },
            _ = child.done() => {
                let reason = match ctx.err() {
                    Some(parent) => parent,
                    None => {
                        child.expire();
                        ContextError::DeadlineExceeded
                    }
                };
                tracing::debug!(
                    timeout_ms = duration.as_millis() as u64,
                    reason = %reason,
                    "abandoning operation"
                );
                Err(reason.into())
            }
        }
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Self::new(TimeoutConfig::default())
    }
}

impl<T, E> Policy<T, E> for Timeout
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn wrap(&self, next: Operation<T, E>) -> Operation<T, E> {
        let Some(duration) = self.config.duration else {
            return next;
        };

        Operation::from_fn(move |ctx| Self::race(duration, next.clone(), ctx))
    }
}
