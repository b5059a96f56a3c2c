//! Error types shared across the EFile workspace

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised by shared types and helpers
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid EIN '{value}': {reason}")]
    InvalidEin { value: String, reason: String },
}

impl CommonError {
    pub fn invalid_ein(value: impl Into<String>, reason: impl Into<String>) -> Self {
        CommonError::InvalidEin {
            value: value.into(),
            reason: reason.into(),
        }
    }
}
