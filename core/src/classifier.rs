//! Failure classification for exception filtering
//!
//! This module provides traits and types for determining which errors
//! should trip the circuit breaker vs. being ignored. Ignored errors are still
//! returned to the caller unchanged; they just do not count.

use crate::errors::Error;
use std::any::Any;

/// Context provided to failure classifiers for error evaluation
#[derive(Debug)]
pub struct FailureContext<'a> {
    /// Circuit name
    pub circuit_name: &'a str,
    /// The failed outcome, an `Error<E>` (can be downcast to the concrete type)
    pub error: &'a dyn Any,
    /// Duration of the failed call in seconds
    pub duration: f64,
}

impl FailureContext<'_> {
    /// Downcast to the wrapped operation's own error type
    ///
    /// Returns `None` for policy errors (timeouts, rejections from inner layers)
    /// and when `E` is not the operation's error type.
    pub fn operation_error<E: 'static>(&self) -> Option<&E> {
        self.error
            .downcast_ref::<Error<E>>()
            .and_then(Error::operation)
    }

    /// Downcast to the full outcome error
    pub fn outcome<E: 'static>(&self) -> Option<&Error<E>> {
        self.error.downcast_ref::<Error<E>>()
    }
}

/// Trait for classifying failures - determines if an error should trip the circuit
///
/// # Examples
///
/// ```rust
/// use resilience_machines::{FailureClassifier, FailureContext};
///
/// #[derive(Debug)]
/// struct ServerErrorClassifier;
///
/// impl FailureClassifier for ServerErrorClassifier {
///     fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
///         // Only 5xx statuses count against the circuit
///         ctx.operation_error::<u16>()
///             .map(|status| *status >= 500)
///             .unwrap_or(true)
///     }
/// }
/// ```
pub trait FailureClassifier: Send + Sync + std::fmt::Debug {
    /// Returns `true` if the error should trip the circuit, `false` to ignore it.
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool;
}

/// Default classifier that trips on all errors
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn should_trip(&self, _ctx: &FailureContext<'_>) -> bool {
        true
    }
}

/// Predicate-based classifier using a closure
pub struct PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    predicate: F,
}

impl<F> PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> FailureClassifier for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
        (self.predicate)(ctx)
    }
}

impl<F> std::fmt::Debug for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateClassifier")
            .field("predicate", &"<closure>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    enum ApiError {
        Client(u16),
        Server(u16),
    }

    fn server_only() -> PredicateClassifier<impl Fn(&FailureContext<'_>) -> bool + Send + Sync> {
        PredicateClassifier::new(|ctx| {
            ctx.operation_error::<ApiError>()
                .map(|e| matches!(e, ApiError::Server(code) if *code >= 500))
                .unwrap_or(true)
        })
    }

    #[test]
    fn test_default_classifier_trips_all() {
        let error: Error<&str> = Error::Operation("any error");
        let ctx = FailureContext {
            circuit_name: "test",
            error: &error,
            duration: 0.1,
        };

        assert!(DefaultClassifier.should_trip(&ctx));
    }

    #[test]
    fn test_predicate_classifier_on_duration() {
        let classifier = PredicateClassifier::new(|ctx| ctx.duration > 1.0);
        let error: Error<&str> = Error::Operation("slow");

        let fast_ctx = FailureContext {
            circuit_name: "test",
            error: &error,
            duration: 0.5,
        };
        let slow_ctx = FailureContext {
            circuit_name: "test",
            error: &error,
            duration: 2.0,
        };

        assert!(!classifier.should_trip(&fast_ctx));
        assert!(classifier.should_trip(&slow_ctx));
    }

    #[test]
    fn test_operation_error_downcast() {
        let classifier = server_only();

        let server: Error<ApiError> = Error::Operation(ApiError::Server(503));
        let client: Error<ApiError> = Error::Operation(ApiError::Client(404));

        let server_ctx = FailureContext {
            circuit_name: "test",
            error: &server,
            duration: 0.1,
        };
        let client_ctx = FailureContext {
            circuit_name: "test",
            error: &client,
            duration: 0.1,
        };

        assert!(classifier.should_trip(&server_ctx));
        assert!(!classifier.should_trip(&client_ctx));
    }

    #[test]
    fn test_policy_errors_have_no_operation_error() {
        let timeout: Error<ApiError> = Error::DeadlineExceeded;
        let ctx = FailureContext {
            circuit_name: "test",
            error: &timeout,
            duration: 5.0,
        };

        assert!(ctx.operation_error::<ApiError>().is_none());
        assert!(matches!(
            ctx.outcome::<ApiError>(),
            Some(Error::DeadlineExceeded)
        ));
        // Unknown failures still count
        assert!(server_only().should_trip(&ctx));
    }
}
