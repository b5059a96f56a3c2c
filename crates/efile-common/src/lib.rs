//! EFile Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the EFile workspace.
//!
//! # Overview
//!
//! - **Types**: filing documents, parsed records, and parser results
//! - **Error Handling**: common error and result types
//! - **Logging**: `tracing` subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use efile_common::types::normalize_ein;
//!
//! fn main() -> efile_common::Result<()> {
//!     let ein = normalize_ein("12-345678")?;
//!     assert_eq!(ein, "012345678");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
