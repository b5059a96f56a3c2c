//! Write accumulator
//!
//! Buffers records per record type across many filings and hands each
//! buffer to a [`BulkWriter`] once it reaches its threshold, or when the
//! pipeline calls [`Accumulator::flush_all`] at a batch boundary.
//!
//! A successful flush empties the buffer. A failed flush puts the snapshot
//! back so the next `flush_all` retries the same rows (at-least-once).

mod buffer;

pub use buffer::RecordBuffer;

use efile_common::types::RecordPayload;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error};

use crate::config::{IngestConfig, DEFAULT_WRITE_TIMEOUT_SECS};
use crate::error::{with_timeout, IngestResult};
use crate::storage::BulkWriter;

/// Counters kept across the accumulator's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccumulatorStats {
    pub records_added: u64,
    pub records_written: u64,
    pub flushes: u64,
}

pub struct Accumulator<W> {
    writer: W,
    buffers: HashMap<String, RecordBuffer>,
    default_threshold: usize,
    thresholds: HashMap<String, usize>,
    write_timeout: Duration,
    stats: AccumulatorStats,
}

impl<W: BulkWriter> Accumulator<W> {
    pub fn new(writer: W, default_threshold: usize) -> Self {
        Self {
            writer,
            buffers: HashMap::new(),
            default_threshold,
            thresholds: HashMap::new(),
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
            stats: AccumulatorStats::default(),
        }
    }

    pub fn from_config(writer: W, config: &IngestConfig) -> Self {
        Self::new(writer, config.flush_threshold)
            .with_thresholds(config.flush_thresholds.clone())
            .with_write_timeout(config.write_timeout())
    }

    /// Per-record-type threshold overrides
    pub fn with_thresholds(mut self, thresholds: HashMap<String, usize>) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn threshold_for(&self, record_type: &str) -> usize {
        self.thresholds
            .get(record_type)
            .copied()
            .unwrap_or(self.default_threshold)
    }

    /// Buffer one record, flushing its type when the threshold is reached
    ///
    /// A failed triggered flush is returned as-is; the rows stay buffered.
    pub async fn add_record(
        &mut self,
        record_type: &str,
        payload: RecordPayload,
    ) -> IngestResult<()> {
        let threshold = self.threshold_for(record_type);
        let full = self
            .buffers
            .entry(record_type.to_string())
            .or_insert_with(|| RecordBuffer::new(threshold))
            .push(payload);
        self.stats.records_added += 1;

        if full {
            self.flush(record_type).await?;
        }

        Ok(())
    }

    /// Write and clear one record type's buffer; returns rows written
    pub async fn flush(&mut self, record_type: &str) -> IngestResult<usize> {
        let snapshot = match self.buffers.get_mut(record_type) {
            Some(buffer) if !buffer.is_empty() => buffer.take(),
            _ => return Ok(0),
        };

        let operation = format!("Bulk write of {}", record_type);
        let result = with_timeout(
            &operation,
            self.write_timeout,
            self.writer.write(record_type, &snapshot),
        )
        .await;

        match result {
            Ok(()) => {
                let written = snapshot.len();
                self.stats.records_written += written as u64;
                self.stats.flushes += 1;
                debug!(record_type = %record_type, rows = written, "Flushed buffer");
                Ok(written)
            },
            Err(e) => {
                error!(
                    record_type = %record_type,
                    rows = snapshot.len(),
                    error = %e,
                    "Bulk write failed, rows kept for retry"
                );
                if let Some(buffer) = self.buffers.get_mut(record_type) {
                    buffer.restore(snapshot);
                }
                Err(e)
            },
        }
    }

    /// Flush every non-empty buffer regardless of threshold
    ///
    /// Stops at the first failure; buffers not yet written stay intact.
    pub async fn flush_all(&mut self) -> IngestResult<usize> {
        let mut pending: Vec<String> = self
            .buffers
            .iter()
            .filter(|(_, buffer)| !buffer.is_empty())
            .map(|(record_type, _)| record_type.clone())
            .collect();
        pending.sort();

        let mut written = 0;
        for record_type in pending {
            written += self.flush(&record_type).await?;
        }

        Ok(written)
    }

    /// Rows currently buffered across all types
    pub fn pending(&self) -> usize {
        self.buffers.values().map(RecordBuffer::len).sum()
    }

    pub fn pending_for(&self, record_type: &str) -> usize {
        self.buffers.get(record_type).map_or(0, RecordBuffer::len)
    }

    /// Record types that currently hold rows
    pub fn buffered_types(&self) -> usize {
        self.buffers.values().filter(|b| !b.is_empty()).count()
    }

    pub fn stats(&self) -> AccumulatorStats {
        self.stats
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }
}

impl<W> std::fmt::Debug for Accumulator<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accumulator")
            .field("buffers", &self.buffers.len())
            .field("default_threshold", &self.default_threshold)
            .field("stats", &self.stats)
            .finish()
    }
}
