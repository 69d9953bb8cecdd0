//! Core error model.

use thiserror::Error;

/// Error raised by core primitives.
///
/// Storage and execution failures live in the crates that own them; this type
/// only covers malformed input handed to the shared building blocks.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
