//! EFile Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Batch ingestion of e-filed returns into per-record-type tables.
//!
//! # Components
//!
//! - **Accumulator**: per-record-type buffers flushed in bulk
//! - **Storage**: filing status store and bulk writer (PostgreSQL or in-memory)
//! - **Parser**: the [`parser::DocumentParser`] interface and an XML implementation
//! - **Pipeline**: the resumable batch loop tying them together
//!
//! # Example
//!
//! ```no_run
//! use efile_ingest::accumulator::Accumulator;
//! use efile_ingest::parser::XmlFilingParser;
//! use efile_ingest::pipeline::IngestionPipeline;
//! use efile_ingest::storage::{FilingScope, MemoryFilingStore, MemoryRecordStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut pipeline = IngestionPipeline::new(
//!         MemoryFilingStore::new(),
//!         XmlFilingParser::new("./filings"),
//!         Accumulator::new(MemoryRecordStore::new(), 1000),
//!     );
//!     let summary = pipeline.run(&FilingScope::year(2019)).await?;
//!     println!("processed {}", summary.processed);
//!     Ok(())
//! }
//! ```

pub mod accumulator;
pub mod config;
pub mod error;
pub mod filter;
pub mod parser;
pub mod pipeline;
pub mod storage;

pub use config::IngestConfig;
pub use error::{IngestError, IngestResult};
pub use pipeline::{IngestionPipeline, RunSummary};
