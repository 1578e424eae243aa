//! Error types returned by every policy layer

use crate::context::ContextError;
use thiserror::Error;

/// Outcome error of a composed operation
///
/// Policies never wrap one another's errors: a rejection from an inner circuit
/// breaker reaches the caller as [`Error::CircuitOpen`], not nested inside anything,
/// and a failure of the wrapped operation always arrives as [`Error::Operation`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error<E> {
    /// The invocation context was cancelled
    #[error("operation cancelled")]
    Cancelled,
    /// A deadline elapsed before the operation finished
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// The token bucket was empty
    #[error("rate limit exceeded")]
    RateLimitExceeded,
    /// Circuit is open, calls are being rejected
    #[error("circuit breaker is open")]
    CircuitOpen,
    /// Circuit is half-open and its trial call is still in flight
    #[error("circuit breaker is half-open and busy")]
    HalfOpenBusy,
    /// The wrapped operation failed
    #[error(transparent)]
    Operation(E),
}

impl<E> Error<E> {
    /// True for errors caused by the invocation context ending
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }

    /// True when a policy refused to invoke the operation at all
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::RateLimitExceeded | Error::CircuitOpen | Error::HalfOpenBusy
        )
    }

    /// Borrow the wrapped operation's error, if that is what this is
    pub fn operation(&self) -> Option<&E> {
        match self {
            Error::Operation(e) => Some(e),
            _ => None,
        }
    }

    /// Take the wrapped operation's error, if that is what this is
    pub fn into_operation(self) -> Option<E> {
        match self {
            Error::Operation(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<ContextError> for Error<E> {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Cancelled => Error::Cancelled,
            ContextError::DeadlineExceeded => Error::DeadlineExceeded,
        }
    }
}
