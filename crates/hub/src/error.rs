//! Typed errors surfaced by engine operations and refresh cycles.

use thiserror::Error;

use crate::actuator::{Actuator, ActuatorError};
use crate::sensors::SourceError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A reading the operation cannot work without is missing.
    #[error("required input unavailable: {0}")]
    UnavailableInput(&'static str),

    /// A name that is not part of an enumerated set (phase, steering, mode...).
    #[error("invalid {kind} '{value}'")]
    InvalidSelection { kind: &'static str, value: String },

    /// A numeric argument outside its accepted range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Another irrigation shot or sequence is still running.
    #[error("irrigation busy: another shot or sequence is in progress")]
    Busy,

    #[error("actuator command failed: {0}")]
    Actuator(#[from] ActuatorError),

    /// The pump could not be switched off after a shot. The pump may still be
    /// running; this needs operator attention.
    #[error("PUMP SAFETY FAULT: {actuator} may still be on: {source}")]
    PumpSafety {
        actuator: Actuator,
        #[source]
        source: ActuatorError,
    },

    /// A running sequence was cut short by an emergency stop.
    #[error("sequence aborted after {completed} of {requested} shots")]
    Aborted { completed: u32, requested: u32 },

    /// A derived value came out non-finite.
    #[error("derivation failed: {0}")]
    Derivation(String),

    #[error("sensor source: {0}")]
    Source(#[from] SourceError),

    /// A background irrigation task panicked or was cancelled.
    #[error("irrigation task failed: {0}")]
    Task(String),
}

impl EngineError {
    pub(crate) fn invalid(kind: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidSelection {
            kind,
            value: value.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
