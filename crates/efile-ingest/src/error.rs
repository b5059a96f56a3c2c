//! Fatal error types for the ingestion run
//!
//! Anything that reaches an [`IngestError`] aborts the run. Per-filing parse
//! outcomes live in [`crate::parser::ParseError`] and never surface here.

use thiserror::Error;

/// Result type alias for ingestion operations
pub type IngestResult<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("No destination registered for record type '{0}'")]
    UnknownRecordType(String),

    #[error("Storage write for record type '{record_type}' failed: {reason}")]
    WriteFailed { record_type: String, reason: String },

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("Submission year {year} is outside the allowed range {min}..={max}")]
    InvalidPeriod { year: i32, min: i32, max: i32 },

    #[error("Invalid EIN filter file '{path}': {reason}")]
    InvalidFilter { path: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] efile_common::CommonError),
}

impl IngestError {
    pub fn timeout(operation: impl Into<String>, duration: std::time::Duration) -> Self {
        IngestError::Timeout {
            operation: operation.into(),
            secs: duration.as_secs(),
        }
    }

    pub fn invalid_filter(path: impl AsRef<std::path::Path>, reason: impl Into<String>) -> Self {
        IngestError::InvalidFilter {
            path: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }
}

/// Run `fut` under a deadline, mapping expiry to [`IngestError::Timeout`]
pub async fn with_timeout<T, F>(
    operation: &str,
    duration: std::time::Duration,
    fut: F,
) -> IngestResult<T>
where
    F: std::future::Future<Output = IngestResult<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(IngestError::timeout(operation, duration)),
    }
}
