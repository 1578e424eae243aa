//! Operations, the `Policy` trait and the composition that joins them
//!
//! A policy turns one [`Operation`] into another. [`execute`] nests a list of
//! policies around a base operation, first policy outermost, and calls the result
//! once:
//!
//! ```text
//! execute(ctx, op, [a, b, c])  ==  a.wrap(b.wrap(c.wrap(op))).call(ctx)
//! ```

use crate::{context::Context, errors::Error};
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;

type OperationFn<T, E> = dyn Fn(Context) -> BoxFuture<'static, Result<T, Error<E>>> + Send + Sync;

/// A shareable, re-invocable async unit of work
pub struct Operation<T, E> {
    inner: Arc<OperationFn<T, E>>,
}

impl<T, E> Clone for Operation<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> std::fmt::Debug for Operation<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("inner", &"<closure>")
            .finish()
    }
}

impl<T, E> Operation<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Wrap a caller closure; its errors surface as [`Error::Operation`]
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::from_fn(move |ctx| {
            let fut = f(ctx);
            async move { fut.await.map_err(Error::Operation) }
        })
    }

    /// Wrap a closure that already speaks [`Error`] (used by policy layers)
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, Error<E>>> + Send + 'static,
    {
        Self {
            inner: Arc::new(move |ctx| f(ctx).boxed()),
        }
    }

    /// Invoke the operation once
    pub fn call(&self, ctx: Context) -> BoxFuture<'static, Result<T, Error<E>>> {
        (self.inner)(ctx)
    }
}

/// A composable wrapper adding one reliability behavior around an operation
pub trait Policy<T, E>: Send + Sync {
    /// Produce an operation that applies this policy around `next`
    fn wrap(&self, next: Operation<T, E>) -> Operation<T, E>;
}

impl<T, E, P> Policy<T, E> for Arc<P>
where
    P: Policy<T, E> + ?Sized,
{
    fn wrap(&self, next: Operation<T, E>) -> Operation<T, E> {
        (**self).wrap(next)
    }
}

/// Nest `policies` around `operation` without calling it
pub fn compose<T, E>(operation: &Operation<T, E>, policies: &[&dyn Policy<T, E>]) -> Operation<T, E> {
    policies
        .iter()
        .rev()
        .fold(operation.clone(), |next, policy| policy.wrap(next))
}

/// Compose `policies` around `operation` and invoke the result once
///
/// # Example
///
/// ```rust
/// use resilience_machines::{execute, Backoff, Context, Operation, Retry, RetryConfig};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let retry = Retry::new(RetryConfig {
///     max_attempts: 2,
///     initial_delay: Duration::from_millis(1),
///     backoff: Backoff::Fixed,
///     jitter: false,
///     ..Default::default()
/// });
///
/// let op = Operation::new(|_ctx| async { Ok::<_, std::io::Error>("pong") });
/// let result = execute(Context::background(), &op, &[&retry]).await;
/// assert_eq!(result.unwrap(), "pong");
/// # }
/// ```
pub async fn execute<T, E>(
    ctx: Context,
    operation: &Operation<T, E>,
    policies: &[&dyn Policy<T, E>],
) -> Result<T, Error<E>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    compose(operation, policies).call(ctx).await
}

/// An owned, reusable policy stack
pub struct Pipeline<T, E> {
    policies: Vec<Arc<dyn Policy<T, E>>>,
}

impl<T, E> Pipeline<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            policies: Vec::new(),
        }
    }

    /// Append a policy; it will sit inside every policy added before it
    pub fn with<P>(mut self, policy: P) -> Self
    where
        P: Policy<T, E> + 'static,
    {
        self.policies.push(Arc::new(policy));
        self
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Compose the stack around `operation`
    pub fn build(&self, operation: &Operation<T, E>) -> Operation<T, E> {
        let policies: Vec<&dyn Policy<T, E>> = self
            .policies
            .iter()
            .map(|policy| policy.as_ref() as &dyn Policy<T, E>)
            .collect();
        compose(operation, &policies)
    }

    /// Compose the stack around `operation` and invoke it once
    pub async fn execute(&self, ctx: Context, operation: &Operation<T, E>) -> Result<T, Error<E>> {
        self.build(operation).call(ctx).await
    }
}

impl<T, E> Default for Pipeline<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Clone for Pipeline<T, E> {
    fn clone(&self) -> Self {
        Self {
            policies: self.policies.clone(),
        }
    }
}

impl<T, E> std::fmt::Debug for Pipeline<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("policies", &self.policies.len())
            .finish()
    }
}
