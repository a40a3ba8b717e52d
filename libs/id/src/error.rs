//! Id parse errors.

use thiserror::Error;

/// Errors returned when parsing a typed id.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("id cannot be empty")]
    Empty,

    #[error("id '{0}' has no '_' between prefix and ulid")]
    MissingSeparator(String),

    #[error("wrong id prefix: expected '{expected}', got '{actual}'")]
    WrongPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("invalid ulid: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// Returns true if the id belonged to another resource type.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::WrongPrefix { .. })
    }
}
