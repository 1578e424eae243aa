//! Invocation context carried through every policy layer
//!
//! A [`Context`] bundles a cancellation signal with an optional deadline. Policies
//! check it before doing anything else and hand it (or a child of it) down to the
//! next layer. Cancellation is cooperative: nothing is ever aborted, operations are
//! expected to watch [`Context::done`] and stop on their own.

use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The context was cancelled explicitly (or through a parent)
    #[error("context cancelled")]
    Cancelled,
    /// The context's deadline passed
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation signal plus optional deadline, propagated downward
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
    reason: Arc<OnceLock<ContextError>>,
    parent: Option<Arc<Context>>,
}

impl Context {
    /// A context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Build a context driven by an existing cancellation token
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
            reason: Arc::new(OnceLock::new()),
            parent: None,
        }
    }

    /// Derive a child that additionally expires after `duration`
    pub fn with_timeout(&self, duration: Duration) -> Self {
        self.with_deadline(Instant::now() + duration)
    }

    /// Derive a child that expires at `deadline` (or earlier, if the parent does)
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(inherited) => inherited.min(deadline),
            None => deadline,
        };

        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
            reason: Arc::new(OnceLock::new()),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// Derive a child that can be cancelled without affecting this context
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            reason: Arc::new(OnceLock::new()),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// Cancel this context and every context derived from it
    pub fn cancel(&self) {
        let _ = self.reason.set(ContextError::Cancelled);
        self.token.cancel();
    }

    /// Mark this context as expired and wake everything waiting on it
    pub(crate) fn expire(&self) {
        let _ = self.reason.set(ContextError::DeadlineExceeded);
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if there is one
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// `Some(reason)` once the context has ended, `None` while it is live
    pub fn err(&self) -> Option<ContextError> {
        if let Some(reason) = self.reason.get() {
            return Some(*reason);
        }

        // An ancestor's cancellation outranks a deadline that passed afterwards.
        if self.token.is_cancelled() {
            let inherited = self
                .parent
                .as_ref()
                .and_then(|parent| parent.err())
                .unwrap_or(ContextError::Cancelled);
            return Some(*self.reason.get_or_init(|| inherited));
        }

        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Some(*self.reason.get_or_init(|| ContextError::DeadlineExceeded));
        }

        None
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolve once the context is cancelled or its deadline passes
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
