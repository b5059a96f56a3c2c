//! Durable storage interfaces
//!
//! The pipeline talks to two stores:
//! - [`FilingStore`] holds filing documents and their processing state
//! - [`BulkWriter`] receives buffered records, one bulk insert per record type
//!
//! PostgreSQL implementations live in [`postgres`]; [`memory`] provides
//! process-local ones.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use efile_common::types::{Filing, KeyError, RecordPayload};

use crate::error::IngestResult;

pub use memory::{MemoryFilingStore, MemoryRecordStore};
pub use postgres::{DestinationRegistry, PgBulkWriter, PgFilingStore};

/// Which filings a run is allowed to touch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilingScope {
    pub submission_year: i32,
    /// Normalized EINs; empty means no entity filter
    pub eins: Vec<String>,
}

impl FilingScope {
    pub fn year(submission_year: i32) -> Self {
        Self {
            submission_year,
            eins: Vec::new(),
        }
    }

    pub fn with_eins(mut self, eins: Vec<String>) -> Self {
        self.eins = eins;
        self
    }

    pub fn is_filtered(&self) -> bool {
        !self.eins.is_empty()
    }

    /// Whether `filing` falls inside this scope
    pub fn contains(&self, filing: &Filing) -> bool {
        filing.submission_year == self.submission_year
            && (!self.is_filtered() || self.eins.iter().any(|ein| *ein == filing.ein))
    }
}

/// Filing status reads and writes
#[async_trait]
pub trait FilingStore: Send + Sync {
    /// Clear in-progress state left by an interrupted run
    ///
    /// Only filings inside `scope` that are not complete are touched:
    /// `parse_started` becomes false and `parse_complete` is normalized to
    /// false. Returns how many of them had been started; filings whose
    /// only change is that normalization are not counted.
    async fn reset_in_progress(&self, scope: &FilingScope) -> IngestResult<u64>;

    /// Up to `limit` in-scope filings whose `parse_complete` is not true,
    /// ordered by object id, skipping any id in `exclude`
    async fn select_pending(
        &self,
        scope: &FilingScope,
        exclude: &[String],
        limit: usize,
    ) -> IngestResult<Vec<Filing>>;

    /// Set `parse_started` for every id in one statement
    async fn mark_started(&self, object_ids: &[String]) -> IngestResult<()>;

    /// Set `parse_complete` and `processed_at` for every id in one statement
    async fn mark_complete(
        &self,
        object_ids: &[String],
        processed_at: DateTime<Utc>,
    ) -> IngestResult<()>;

    async fn update_schema_version(&self, object_id: &str, version: &str) -> IngestResult<()>;

    /// Persist schema-drift findings for one filing
    ///
    /// An empty list clears `is_error`, `key_error_count` and `error_details`.
    async fn record_key_errors(&self, object_id: &str, errors: &[KeyError]) -> IngestResult<()>;
}

/// One bulk insert per record type
///
/// A call either stores every payload or fails as a unit. An unknown record
/// type is an error, never a skip.
#[async_trait]
pub trait BulkWriter: Send + Sync {
    async fn write(&self, record_type: &str, payloads: &[RecordPayload]) -> IngestResult<()>;
}

#[async_trait]
impl<W: BulkWriter + ?Sized> BulkWriter for std::sync::Arc<W> {
    async fn write(&self, record_type: &str, payloads: &[RecordPayload]) -> IngestResult<()> {
        (**self).write(record_type, payloads).await
    }
}

#[async_trait]
impl<S: FilingStore + ?Sized> FilingStore for std::sync::Arc<S> {
    async fn reset_in_progress(&self, scope: &FilingScope) -> IngestResult<u64> {
        (**self).reset_in_progress(scope).await
    }

    async fn select_pending(
        &self,
        scope: &FilingScope,
        exclude: &[String],
        limit: usize,
    ) -> IngestResult<Vec<Filing>> {
        (**self).select_pending(scope, exclude, limit).await
    }

    async fn mark_started(&self, object_ids: &[String]) -> IngestResult<()> {
        (**self).mark_started(object_ids).await
    }

    async fn mark_complete(
        &self,
        object_ids: &[String],
        processed_at: DateTime<Utc>,
    ) -> IngestResult<()> {
        (**self).mark_complete(object_ids, processed_at).await
    }

    async fn update_schema_version(&self, object_id: &str, version: &str) -> IngestResult<()> {
        (**self).update_schema_version(object_id, version).await
    }

    async fn record_key_errors(&self, object_id: &str, errors: &[KeyError]) -> IngestResult<()> {
        (**self).record_key_errors(object_id, errors).await
    }
}
