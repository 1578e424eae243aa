//! Circuit breaker implementation using state machines
//!
//! The breaker is a `state-machines` dynamic machine (Closed → Open → HalfOpen)
//! behind a single mutex. A call takes the lock twice: once to be admitted and once
//! to record its outcome. The wrapped operation runs in between, outside the lock,
//! so unrelated calls never serialize on each other's I/O.
//!
//! Open → HalfOpen is evaluated lazily on the next call attempt; there is no timer.
//! While HalfOpen, exactly one trial call may be in flight. Successful trials
//! accumulate across sequential calls until `success_threshold` closes the circuit,
//! and a single qualifying trial failure reopens it.

use crate::{
    callbacks::Callbacks,
    classifier::{FailureClassifier, FailureContext},
    clock::{Clock, SystemClock},
    context::Context,
    errors::Error,
    pipeline::{Operation, Policy},
    tally::FailureTally,
};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Circuit breaker configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    /// Consecutive qualifying failures that open the circuit
    pub failure_threshold: usize,

    /// Successful half-open trials required to close the circuit
    pub success_threshold: usize,

    /// How long the circuit stays open before admitting a trial call
    pub open_timeout: Duration,

    /// Jitter factor for open_timeout (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: timeout * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            open_timeout: Duration::from_secs(30),
            jitter_factor: 0.0,
        }
    }
}

impl Config {
    /// Replace zero values with defaults and clamp the jitter factor
    pub fn normalized(self) -> Self {
        let defaults = Self::default();
        Self {
            failure_threshold: if self.failure_threshold == 0 {
                defaults.failure_threshold
            } else {
                self.failure_threshold
            },
            success_threshold: if self.success_threshold == 0 {
                defaults.success_threshold
            } else {
                self.success_threshold
            },
            open_timeout: if self.open_timeout.is_zero() {
                defaults.open_timeout
            } else {
                self.open_timeout
            },
            jitter_factor: if self.jitter_factor.is_nan() {
                0.0
            } else {
                self.jitter_factor.clamp(0.0, 1.0)
            },
        }
    }
}

/// Externally visible circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
        }
    }

    fn from_machine(name: &str) -> Self {
        match name {
            "Closed" => CircuitState::Closed,
            "HalfOpen" => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker context - shared data across all states
#[derive(Clone)]
pub struct CircuitContext {
    pub name: String,
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub tally: Arc<FailureTally>,
    pub failure_classifier: Option<Arc<dyn FailureClassifier>>,
}

impl Default for CircuitContext {
    fn default() -> Self {
        Self {
            name: String::new(),
            config: Config::default(),
            clock: Arc::new(SystemClock::new()),
            tally: Arc::new(FailureTally::new()),
            failure_classifier: None,
        }
    }
}

impl std::fmt::Debug for CircuitContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitContext")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("tally", &self.tally)
            .field(
                "failure_classifier",
                &self
                    .failure_classifier
                    .as_ref()
                    .map(|_| "<dyn FailureClassifier>"),
            )
            .finish()
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    pub opened_at: f64,
}

/// Data specific to the HalfOpen state
#[derive(Debug, Clone, Default)]
pub struct HalfOpenData {
    pub consecutive_successes: usize,
    pub trial_in_flight: bool,
}

/// Generated machine; its state marker and event types stay crate-private
mod machine {
    use super::{CircuitContext, HalfOpenData, OpenData};
    use state_machines::state_machine;

    state_machine! {
        name: Circuit,
        context: CircuitContext,
        dynamic: true,

        initial: Closed,
        states: [
            Closed,
            Open(OpenData),
            HalfOpen(HalfOpenData),
        ],
        events {
            trip {
                guards: [should_open],
                transition: { from: [Closed, HalfOpen], to: Open }
            }
            attempt_reset {
                guards: [timeout_elapsed],
                transition: { from: Open, to: HalfOpen }
            }
            close {
                guards: [should_close],
                transition: { from: HalfOpen, to: Closed }
            }
        }
    }

    impl Circuit<Closed> {
        /// Consecutive failure streak reached the threshold
        fn should_open(&self, ctx: &CircuitContext) -> bool {
            ctx.tally.consecutive_failures() >= ctx.config.failure_threshold
        }
    }

    impl Circuit<HalfOpen> {
        /// Any qualifying trial failure reopens, regardless of earlier trial successes
        fn should_open(&self, _ctx: &CircuitContext) -> bool {
            true
        }

        /// Check if enough successes to close circuit
        fn should_close(&self, ctx: &CircuitContext) -> bool {
            self.state_data_half_open()
                .map(|data| data.consecutive_successes >= ctx.config.success_threshold)
                .unwrap_or(false)
        }
    }

    impl Circuit<Open> {
        /// Check if timeout has elapsed for Open -> HalfOpen transition
        fn timeout_elapsed(&self, ctx: &CircuitContext) -> bool {
            let Some(data) = self.state_data_open() else {
                return true;
            };
            let elapsed = ctx.clock.monotonic_time() - data.opened_at;
            let open_timeout_secs = ctx.config.open_timeout.as_secs_f64();

            let timeout_secs = if ctx.config.jitter_factor > 0.0 {
                let timeout_ms = ctx.config.open_timeout.as_millis() as u64;
                let policy = chrono_machines::Policy {
                    max_attempts: 1,
                    base_delay_ms: timeout_ms,
                    multiplier: 1.0,
                    max_delay_ms: timeout_ms,
                };
                let jittered_ms = policy.calculate_delay(1, ctx.config.jitter_factor);
                (jittered_ms as f64) / 1000.0
            } else {
                open_timeout_secs
            };

            elapsed >= timeout_secs
        }
    }
}

use machine::{CircuitEvent, DynamicCircuit};

/// Mutable breaker state guarded by the lock
struct Inner {
    machine: DynamicCircuit,
    /// Bumped on every transition; outcomes from an older epoch are stale
    epoch: u64,
}

struct Shared {
    context: CircuitContext,
    callbacks: Callbacks,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now(&self) -> f64 {
        self.context.clock.monotonic_time()
    }

    /// Bookkeeping shared by every transition; runs with the lock held
    fn transitioned(&self, inner: &mut Inner, from: CircuitState, to: CircuitState) {
        inner.epoch = inner.epoch.wrapping_add(1);

        let name = self.context.name.as_str();
        match to {
            CircuitState::Open => tracing::warn!(circuit = %name, from = %from, "circuit opened"),
            CircuitState::HalfOpen => {
                tracing::info!(circuit = %name, "circuit half-open, admitting trial call")
            }
            CircuitState::Closed => tracing::info!(circuit = %name, from = %from, "circuit closed"),
        }

        self.callbacks.trigger_transition(name, from, to);
    }

    /// Apply Open-state bookkeeping (timestamp + counters)
    fn mark_open(&self, inner: &mut Inner, from: CircuitState) {
        if let Some(data) = inner.machine.open_data_mut() {
            data.opened_at = self.now();
        }
        self.context.tally.clear();
        self.transitioned(inner, from, CircuitState::Open);
    }

    fn settle(&self, kind: AdmissionKind, epoch: u64, outcome: Outcome) {
        let mut guard = self.lock();
        let inner = &mut *guard;

        if inner.epoch != epoch {
            tracing::trace!(circuit = %self.context.name, "discarding stale outcome");
            return;
        }

        match kind {
            AdmissionKind::Closed => match outcome {
                Outcome::Success => self.context.tally.record_success(),
                Outcome::Failure { trips: true } => {
                    self.context.tally.record_failure();
                    if inner.machine.handle(CircuitEvent::Trip).is_ok() {
                        self.mark_open(inner, CircuitState::Closed);
                    }
                }
                Outcome::Failure { trips: false } | Outcome::Abandoned => {}
            },
            AdmissionKind::Trial => {
                if let Some(data) = inner.machine.half_open_data_mut() {
                    data.trial_in_flight = false;
                    if matches!(outcome, Outcome::Success) {
                        data.consecutive_successes += 1;
                    }
                }

                match outcome {
                    Outcome::Success => {
                        if inner.machine.handle(CircuitEvent::Close).is_ok() {
                            self.context.tally.clear();
                            self.transitioned(inner, CircuitState::HalfOpen, CircuitState::Closed);
                        }
                    }
                    Outcome::Failure { trips: true } => {
                        if inner.machine.handle(CircuitEvent::Trip).is_ok() {
                            self.mark_open(inner, CircuitState::HalfOpen);
                        }
                    }
                    Outcome::Failure { trips: false } | Outcome::Abandoned => {}
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdmissionKind {
    Closed,
    Trial,
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success,
    Failure { trips: bool },
    Abandoned,
}

/// Permission to make one call through the breaker
///
/// Record the call's outcome with [`Admission::record_success`] or
/// [`Admission::record_failure`]. Dropping an admission without recording
/// (for example when the caller's future is dropped mid-call) releases a half-open
/// trial slot without counting anything.
pub(crate) struct Admission {
    shared: Arc<Shared>,
    kind: AdmissionKind,
    epoch: u64,
    started_at: f64,
    settled: bool,
}

impl Admission {
    /// Whether this call is the half-open trial
    #[cfg(test)]
    fn is_trial(&self) -> bool {
        self.kind == AdmissionKind::Trial
    }

    pub(crate) fn record_success(mut self) {
        self.settled = true;
        self.shared.settle(self.kind, self.epoch, Outcome::Success);
    }

    /// Record a failed call; the failure classifier decides whether it counts
    pub(crate) fn record_failure<E: 'static>(mut self, error: &Error<E>) {
        self.settled = true;

        let context = &self.shared.context;
        let trips = match &context.failure_classifier {
            Some(classifier) => classifier.should_trip(&FailureContext {
                circuit_name: &context.name,
                error,
                duration: (self.shared.now() - self.started_at).max(0.0),
            }),
            None => true,
        };

        self.shared
            .settle(self.kind, self.epoch, Outcome::Failure { trips });
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if !self.settled {
            self.shared.settle(self.kind, self.epoch, Outcome::Abandoned);
        }
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("circuit", &self.shared.context.name)
            .field("kind", &self.kind)
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// Shared three-state fault-isolation gate
///
/// Clones share the same state, so one breaker can guard many call sites.
///
/// # Example
///
/// ```rust
/// use resilience_machines::{execute, CircuitBreaker, Context, Error, Operation};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let breaker = CircuitBreaker::builder("payments")
///     .failure_threshold(1)
///     .build();
/// let op = Operation::new(|_ctx| async { Err::<(), _>("gateway down") });
///
/// let first = execute(Context::background(), &op, &[&breaker]).await;
/// assert_eq!(first, Err(Error::Operation("gateway down")));
///
/// let second = execute(Context::background(), &op, &[&breaker]).await;
/// assert_eq!(second, Err(Error::CircuitOpen));
/// # }
/// ```
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker (use builder() for more options)
    pub fn new(name: impl Into<String>, config: Config) -> Self {
        crate::builder::CircuitBuilder::new(name)
            .config(config)
            .build()
    }

    /// Create a new circuit breaker builder
    pub fn builder(name: impl Into<String>) -> crate::builder::CircuitBuilder {
        crate::builder::CircuitBuilder::new(name)
    }

    /// Create a circuit breaker from a prepared context (used by builder)
    pub(crate) fn with_context_and_callbacks(
        context: CircuitContext,
        callbacks: Callbacks,
    ) -> Self {
        let machine = DynamicCircuit::new(context.clone());

        Self {
            shared: Arc::new(Shared {
                context,
                callbacks,
                inner: Mutex::new(Inner { machine, epoch: 0 }),
            }),
        }
    }

    /// Decide whether a call may proceed
    ///
    /// Moves an expired Open circuit to HalfOpen and claims the trial slot.
    pub(crate) fn acquire<E>(&self) -> Result<Admission, Error<E>> {
        let shared = &self.shared;
        let mut guard = shared.lock();
        let inner = &mut *guard;

        if inner.machine.current_state() == "Open" {
            if inner.machine.handle(CircuitEvent::AttemptReset).is_err() {
                tracing::trace!(circuit = %shared.context.name, "rejected, circuit open");
                return Err(Error::CircuitOpen);
            }
            shared.transitioned(inner, CircuitState::Open, CircuitState::HalfOpen);
        }

        let kind = match inner.machine.current_state() {
            "HalfOpen" => {
                let Some(data) = inner.machine.half_open_data_mut() else {
                    return Err(Error::CircuitOpen);
                };
                if data.trial_in_flight {
                    tracing::trace!(circuit = %shared.context.name, "rejected, trial in flight");
                    return Err(Error::HalfOpenBusy);
                }
                data.trial_in_flight = true;
                AdmissionKind::Trial
            }
            "Closed" => AdmissionKind::Closed,
            _ => return Err(Error::CircuitOpen),
        };

        Ok(Admission {
            shared: Arc::clone(shared),
            kind,
            epoch: inner.epoch,
            started_at: shared.now(),
            settled: false,
        })
    }

    /// Execute an operation with circuit breaker protection
    pub async fn call<T, E, F, Fut>(&self, ctx: Context, f: F) -> Result<T, Error<E>>
    where
        E: 'static,
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, Error<E>>>,
    {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }

        let admission = self.acquire()?;
        let outcome = f(ctx).await;

        match &outcome {
            Ok(_) => admission.record_success(),
            Err(error) => admission.record_failure(error),
        }

        outcome
    }

    pub fn name(&self) -> &str {
        &self.shared.context.name
    }

    pub fn config(&self) -> &Config {
        &self.shared.context.config
    }

    /// Current state, without evaluating the open timeout
    pub fn state(&self) -> CircuitState {
        CircuitState::from_machine(self.shared.lock().machine.current_state())
    }

    /// Get current state name
    pub fn state_name(&self) -> &'static str {
        self.state().as_str()
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn is_half_open(&self) -> bool {
        self.state() == CircuitState::HalfOpen
    }

    /// Current consecutive failure streak while Closed
    pub fn failure_count(&self) -> usize {
        self.shared.context.tally.consecutive_failures()
    }

    /// Successful trials so far while HalfOpen
    #[cfg(test)]
    fn half_open_successes(&self) -> usize {
        self.shared
            .lock()
            .machine
            .half_open_data()
            .map(|data| data.consecutive_successes)
            .unwrap_or(0)
    }

    /// Clear all counters and force the circuit back to Closed
    pub fn reset(&self) {
        let shared = &self.shared;
        let mut guard = shared.lock();
        let inner = &mut *guard;

        let from = CircuitState::from_machine(inner.machine.current_state());
        shared.context.tally.clear();
        inner.machine = DynamicCircuit::new(shared.context.clone());

        if from == CircuitState::Closed {
            inner.epoch = inner.epoch.wrapping_add(1);
        } else {
            shared.transitioned(inner, from, CircuitState::Closed);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("context", &self.shared.context)
            .field("callbacks", &self.shared.callbacks)
            .field("state", &self.state())
            .finish()
    }
}

impl<T, E> Policy<T, E> for CircuitBreaker
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn wrap(&self, next: Operation<T, E>) -> Operation<T, E> {
        let breaker = self.clone();

        Operation::from_fn(move |ctx| {
            let breaker = breaker.clone();
            let next = next.clone();
            async move { breaker.call(ctx, |ctx| next.call(ctx)).await }
        })
    }
}
