//! Filing parser interface
//!
//! Turning filing bytes into records is a collaborator concern: the pipeline
//! only needs [`DocumentParser::parse`]. [`XmlFilingParser`] is the
//! filesystem-backed implementation used by the binary.

mod xml;

pub use xml::XmlFilingParser;

use async_trait::async_trait;
use efile_common::types::ParseResult;
use thiserror::Error;

/// Per-filing parse outcomes that are counted and skipped, never fatal
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Filing file for {object_id} not found at {path}")]
    FileMissing { object_id: String, path: String },

    #[error("Filing {object_id} is not a valid return: {reason}")]
    InvalidDocument { object_id: String, reason: String },

    #[error("Parsing filing {object_id} timed out after {secs}s")]
    Timeout { object_id: String, secs: u64 },
}

impl ParseError {
    pub fn invalid(object_id: impl Into<String>, reason: impl Into<String>) -> Self {
        ParseError::InvalidDocument {
            object_id: object_id.into(),
            reason: reason.into(),
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, ParseError::FileMissing { .. })
    }
}

/// Parses one filing into schedules of parts and groups
#[async_trait]
pub trait DocumentParser: Send + Sync {
    async fn parse(&self, object_id: &str) -> Result<ParseResult, ParseError>;
}

#[async_trait]
impl<P: DocumentParser + ?Sized> DocumentParser for std::sync::Arc<P> {
    async fn parse(&self, object_id: &str) -> Result<ParseResult, ParseError> {
        (**self).parse(object_id).await
    }
}
