//! Model error types.

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors from chart loading.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid chart definition:\n{0}")]
    Validation(ValidationErrors),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Structured validation report: state or content id to messages.
///
/// Detected eagerly at load time; a chart that loads never reports these
/// during execution.
#[derive(Debug, Default, Clone)]
pub struct ValidationErrors {
    errors: BTreeMap<String, Vec<String>>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a validation message against a metadata id.
    pub fn push(&mut self, id: impl Into<String>, message: impl Into<String>) {
        self.errors.entry(id.into()).or_default().push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.values().map(Vec::len).sum()
    }

    /// Messages recorded against the given id.
    pub fn for_id(&self, id: &str) -> &[String] {
        self.errors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.errors.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, messages) in &self.errors {
            for message in messages {
                writeln!(f, "  {}: {}", id, message)?;
            }
        }
        Ok(())
    }
}
