//! In-process stores
//!
//! Used for dry runs and tests. Both stores sit behind a `std::sync::Mutex`
//! that is never held across an await point.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use efile_common::types::{Filing, KeyError, RecordPayload};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::{BulkWriter, FilingScope, FilingStore};
use crate::error::{IngestError, IngestResult};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Filing table kept in a sorted map keyed by object id
#[derive(Debug, Default)]
pub struct MemoryFilingStore {
    filings: Mutex<BTreeMap<String, Filing>>,
}

impl MemoryFilingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filings(filings: impl IntoIterator<Item = Filing>) -> Self {
        let store = Self::new();
        for filing in filings {
            store.insert(filing);
        }
        store
    }

    /// Insert or replace a filing (stands in for discovery)
    pub fn insert(&self, filing: Filing) {
        lock(&self.filings).insert(filing.object_id.clone(), filing);
    }

    pub fn get(&self, object_id: &str) -> Option<Filing> {
        lock(&self.filings).get(object_id).cloned()
    }

    pub fn all(&self) -> Vec<Filing> {
        lock(&self.filings).values().cloned().collect()
    }
}

#[async_trait]
impl FilingStore for MemoryFilingStore {
    async fn reset_in_progress(&self, scope: &FilingScope) -> IngestResult<u64> {
        let mut filings = lock(&self.filings);
        let mut reset = 0;
        for filing in filings.values_mut() {
            if scope.contains(filing) && !filing.parse_complete {
                if filing.parse_started {
                    reset += 1;
                }
                filing.parse_started = false;
            }
        }
        Ok(reset)
    }

    async fn select_pending(
        &self,
        scope: &FilingScope,
        exclude: &[String],
        limit: usize,
    ) -> IngestResult<Vec<Filing>> {
        let excluded: HashSet<&str> = exclude.iter().map(String::as_str).collect();
        Ok(lock(&self.filings)
            .values()
            .filter(|f| scope.contains(f) && !f.parse_complete)
            .filter(|f| !excluded.contains(f.object_id.as_str()))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_started(&self, object_ids: &[String]) -> IngestResult<()> {
        let mut filings = lock(&self.filings);
        for id in object_ids {
            if let Some(filing) = filings.get_mut(id) {
                filing.parse_started = true;
            }
        }
        Ok(())
    }

    async fn mark_complete(
        &self,
        object_ids: &[String],
        processed_at: DateTime<Utc>,
    ) -> IngestResult<()> {
        let mut filings = lock(&self.filings);
        for id in object_ids {
            if let Some(filing) = filings.get_mut(id) {
                filing.parse_complete = true;
                filing.processed_at = Some(processed_at);
            }
        }
        Ok(())
    }

    async fn update_schema_version(&self, object_id: &str, version: &str) -> IngestResult<()> {
        if let Some(filing) = lock(&self.filings).get_mut(object_id) {
            filing.schema_version = Some(version.to_string());
        }
        Ok(())
    }

    async fn record_key_errors(&self, object_id: &str, errors: &[KeyError]) -> IngestResult<()> {
        let details = if errors.is_empty() {
            None
        } else {
            Some(KeyError::serialize_list(errors)?)
        };
        if let Some(filing) = lock(&self.filings).get_mut(object_id) {
            filing.is_error = !errors.is_empty();
            filing.key_error_count = errors.len() as i32;
            filing.error_details = details;
        }
        Ok(())
    }
}

/// Record tables kept per record type
///
/// When constructed with [`MemoryRecordStore::with_record_types`] only those
/// types have a destination; otherwise every type is accepted.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    known_types: Option<HashSet<String>>,
    tables: Mutex<HashMap<String, Vec<RecordPayload>>>,
    writes: Mutex<Vec<(String, usize)>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known_types: Some(types.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Rows stored for one record type
    pub fn rows(&self, record_type: &str) -> Vec<RecordPayload> {
        lock(&self.tables)
            .get(record_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_rows(&self) -> usize {
        lock(&self.tables).values().map(Vec::len).sum()
    }

    /// Every bulk write as (record type, row count), in call order
    pub fn writes(&self) -> Vec<(String, usize)> {
        lock(&self.writes).clone()
    }
}

#[async_trait]
impl BulkWriter for MemoryRecordStore {
    async fn write(&self, record_type: &str, payloads: &[RecordPayload]) -> IngestResult<()> {
        if let Some(ref known) = self.known_types {
            if !known.contains(record_type) {
                return Err(IngestError::UnknownRecordType(record_type.to_string()));
            }
        }

        lock(&self.tables)
            .entry(record_type.to_string())
            .or_default()
            .extend_from_slice(payloads);
        lock(&self.writes).push((record_type.to_string(), payloads.len()));
        Ok(())
    }
}
