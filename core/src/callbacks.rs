//! Callback system for circuit breaker state transitions
//!
//! Callbacks run synchronously while the breaker holds its lock, in the middle of a
//! transition. They must be quick and must not call back into the same breaker.

use crate::circuit::CircuitState;
use std::sync::Arc;

/// Observer invoked with `(from, to)` on every transition
pub type StateChangeFn = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

/// Callback invoked with the circuit name
pub type NamedFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Callbacks for circuit breaker events
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_state_change: Option<StateChangeFn>,
    pub on_open: Option<NamedFn>,
    pub on_close: Option<NamedFn>,
    pub on_half_open: Option<NamedFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the observer and the callback for the state being entered
    pub fn trigger_transition(&self, circuit: &str, from: CircuitState, to: CircuitState) {
        if from == to {
            return;
        }

        if let Some(ref callback) = self.on_state_change {
            callback(from, to);
        }

        let named = match to {
            CircuitState::Open => &self.on_open,
            CircuitState::Closed => &self.on_close,
            CircuitState::HalfOpen => &self.on_half_open,
        };
        if let Some(callback) = named {
            callback(circuit);
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_state_change", &self.on_state_change.is_some())
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .finish()
    }
}
