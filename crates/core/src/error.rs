//! Validation errors raised by typed constructors.

use thiserror::Error;

/// Result type used across the domain crates.
pub type DomainResult<T> = Result<T, DomainError>;

/// A record could not be built because its input was malformed.
///
/// Business rejections (limit breaches, illegal transitions) live in each
/// domain crate's own error enum and wrap this one.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier failed to parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            DomainError::Validation(_) => "VALIDATION_FAILED",
            DomainError::InvalidId(_) => "INVALID_ID",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(DomainError::validation("x").code(), "VALIDATION_FAILED");
        assert_eq!(DomainError::invalid_id("y").code(), "INVALID_ID");
        assert_eq!(DomainError::validation("amount < 0").to_string(), "validation failed: amount < 0");
    }
}
