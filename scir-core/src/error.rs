//! Core error types.

use thiserror::Error;

/// Errors from the interpreter.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An execution error surfaced in fail-fast mode. In the default mode
    /// these become internal `error.execution` / `error.communication`
    /// events instead.
    #[error("execution error: {reason}")]
    Execution { reason: String },

    /// An invariant violation in the state tree or the interpreter itself.
    /// Indicates a malformed model, not a user-expression problem.
    #[error("structural error: {reason}")]
    Structural { reason: String },

    /// The external event channel closed while the machine was stable and
    /// waiting; it can never progress again.
    #[error("external event source closed while waiting for events")]
    EventSourceClosed,
}

impl CoreError {
    pub(crate) fn structural(reason: impl Into<String>) -> Self {
        CoreError::Structural {
            reason: reason.into(),
        }
    }
}

/// The interpreter stopped receiving events (terminated or dropped).
#[derive(Debug, Error)]
#[error("interpreter is no longer receiving events")]
pub struct EventSendError;
