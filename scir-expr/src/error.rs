//! Expression error types.

use thiserror::Error;

/// Errors from expression parsing and evaluation.
#[derive(Debug, Error)]
pub enum ExprError {
    #[error("invalid expression: {reason}")]
    Parse { reason: String },

    #[error("expression did not evaluate to an array: got {found}")]
    NotAnArray { found: String },

    #[error("evaluation failed: {reason}")]
    Eval { reason: String },
}

impl ExprError {
    pub(crate) fn parse(reason: impl Into<String>) -> Self {
        ExprError::Parse {
            reason: reason.into(),
        }
    }
}
