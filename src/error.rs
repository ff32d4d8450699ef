//! Error taxonomy of the simulation kernel.
//!
//! Lifecycle and binding errors are fatal to a run: a simulation never starts
//! with an invalid topology. Credit exhaustion is a caller-checkable condition
//! (see [`crate::Simulation::has_credit`]).

use thiserror::Error;

use crate::tree::Phase;
use crate::types::Tick;

/// Errors raised by the kernel.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    #[error("illegal lifecycle transition on '{node}': {from} -> {to}")]
    StateTransition {
        node: String,
        from: Phase,
        to: Phase,
    },

    #[error("'{target}' requires phase {required}, but it is {actual}")]
    WrongPhase {
        target: String,
        required: &'static str,
        actual: Phase,
    },

    #[error("binding error on port '{port}': {reason}")]
    Binding { port: String, reason: String },

    #[error("validation error on '{path}': {reason}")]
    Validation { path: String, reason: String },

    #[error("parameter '{path}' is locked")]
    LockedParameter { path: String },

    #[error("parameter '{path}' expects {expected}, got {actual}")]
    ParameterType {
        path: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("unknown parameter '{path}'")]
    UnknownParameter { path: String },

    #[error("no credit available on port '{port}'")]
    CreditExhausted { port: String },

    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("unknown port '{0}'")]
    UnknownPort(String),

    #[error("duplicate name '{name}' under '{parent}'")]
    DuplicateName { parent: String, name: String },

    #[error("cannot schedule at tick {due}, scheduler is already at tick {now}")]
    ScheduleInPast { due: Tick, now: Tick },

    #[error("scheduler error: {0}")]
    SchedulerState(String),

    #[error("tap error: {0}")]
    Tap(String),

    #[error("device error on '{node}': {reason}")]
    Device { node: String, reason: String },
}

/// Result type for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    /// Builds a device-level error, for use by `Device` implementations.
    pub fn device(node: impl Into<String>, reason: impl Into<String>) -> Self {
        KernelError::Device {
            node: node.into(),
            reason: reason.into(),
        }
    }

    /// Returns true for errors that invalidate the topology of a run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, KernelError::CreditExhausted { .. })
    }
}
