//! Ingestion pipeline
//!
//! One run walks a period's pending filings batch by batch:
//!
//! 1. Reset interrupted filings inside the run's scope (once)
//! 2. Select up to `batch_size` pending filings
//! 3. Mark the whole batch started in one update
//! 4. Parse each filing and route its records through the [`Accumulator`]
//! 5. Flush every buffer
//! 6. Mark the batch complete in one update, then loop
//!
//! A crash anywhere between 3 and 6 leaves the batch started but not
//! complete, and the next run's reset makes it selectable again. Filings
//! whose parse failed are never marked complete; they are skipped for the
//! rest of the run and picked up again by the next one.

use chrono::Utc;
use efile_common::types::{Filing, ParseResult};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::accumulator::Accumulator;
use crate::config::{
    IngestConfig, DEFAULT_BATCH_SIZE, DEFAULT_PARSE_CONCURRENCY, DEFAULT_PARSE_TIMEOUT_SECS,
    DEFAULT_WRITE_TIMEOUT_SECS,
};
use crate::error::{with_timeout, IngestResult};
use crate::parser::{DocumentParser, ParseError};
use crate::storage::{BulkWriter, FilingScope, FilingStore};

/// Counters reported at the end of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub batches: u64,
    /// Filings parsed successfully and routed to the accumulator
    pub processed: u64,
    pub missing: u64,
    pub missing_ids: Vec<String>,
    /// Invalid documents and parser timeouts
    pub invalid: u64,
    pub key_error_documents: u64,
    pub records_buffered: u64,
    pub records_written: u64,
    /// A stop was requested and honored at a batch boundary
    pub stopped_early: bool,
}

pub struct IngestionPipeline<S, P, W> {
    store: S,
    parser: P,
    accumulator: Accumulator<W>,
    batch_size: usize,
    parse_concurrency: usize,
    parse_timeout: Duration,
    store_timeout: Duration,
    cancel: CancellationToken,
}

impl<S, P, W> IngestionPipeline<S, P, W>
where
    S: FilingStore,
    P: DocumentParser,
    W: BulkWriter,
{
    pub fn new(store: S, parser: P, accumulator: Accumulator<W>) -> Self {
        Self {
            store,
            parser,
            accumulator,
            batch_size: DEFAULT_BATCH_SIZE,
            parse_concurrency: DEFAULT_PARSE_CONCURRENCY,
            parse_timeout: Duration::from_secs(DEFAULT_PARSE_TIMEOUT_SECS),
            store_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(store: S, parser: P, writer: W, config: &IngestConfig) -> Self {
        Self::new(store, parser, Accumulator::from_config(writer, config))
            .with_batch_size(config.batch_size)
            .with_parse_concurrency(config.parse_concurrency)
            .with_parse_timeout(config.parse_timeout())
            .with_store_timeout(config.write_timeout())
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Parser calls kept in flight within a batch
    pub fn with_parse_concurrency(mut self, concurrency: usize) -> Self {
        self.parse_concurrency = concurrency.max(1);
        self
    }

    pub fn with_parse_timeout(mut self, timeout: Duration) -> Self {
        self.parse_timeout = timeout;
        self
    }

    /// Deadline for each filing-status read or write
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Stop requests are honored after a batch is marked complete
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn accumulator(&self) -> &Accumulator<W> {
        &self.accumulator
    }

    /// Process every pending filing in `scope` until none remain
    pub async fn run(&mut self, scope: &FilingScope) -> IngestResult<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "ingest_run",
            %run_id,
            year = scope.submission_year,
            eins = scope.eins.len()
        );
        self.run_batches(scope).instrument(span).await
    }

    async fn run_batches(&mut self, scope: &FilingScope) -> IngestResult<RunSummary> {
        let mut summary = RunSummary::default();
        let written_before = self.accumulator.stats().records_written;

        let reset = with_timeout(
            "Reset interrupted filings",
            self.store_timeout,
            self.store.reset_in_progress(scope),
        )
        .await?;
        info!(reset, "Starting ingestion run");

        // Failed filings stay pending; without this a run would select them forever
        let mut excluded: Vec<String> = Vec::new();

        loop {
            let batch = with_timeout(
                "Select pending filings",
                self.store_timeout,
                self.store.select_pending(scope, &excluded, self.batch_size),
            )
            .await?;

            if batch.is_empty() {
                break;
            }

            summary.batches += 1;
            let failed = self.process_batch(&batch, &mut summary).await?;
            excluded.extend(failed);

            if self.cancel.is_cancelled() {
                warn!(batches = summary.batches, "Stop requested, ending run at batch boundary");
                summary.stopped_early = true;
                break;
            }
        }

        summary.records_written = self.accumulator.stats().records_written - written_before;

        info!(
            batches = summary.batches,
            processed = summary.processed,
            missing = summary.missing,
            invalid = summary.invalid,
            key_error_documents = summary.key_error_documents,
            records = summary.records_written,
            "Ingestion run finished"
        );

        Ok(summary)
    }

    /// Steps 3 to 6 for one batch; returns the ids whose parse failed
    async fn process_batch(
        &mut self,
        batch: &[Filing],
        summary: &mut RunSummary,
    ) -> IngestResult<Vec<String>> {
        let Self {
            store,
            parser,
            accumulator,
            parse_concurrency,
            parse_timeout,
            store_timeout,
            ..
        } = self;
        let parser: &P = parser;
        let parse_timeout = *parse_timeout;
        let store_timeout = *store_timeout;

        let ids: Vec<String> = batch.iter().map(|f| f.object_id.clone()).collect();
        with_timeout("Mark batch started", store_timeout, store.mark_started(&ids)).await?;
        info!(batch = summary.batches, filings = ids.len(), "Processing batch");

        let mut outcomes = stream::iter(batch)
            .map(|filing| async move {
                let outcome = tokio::time::timeout(parse_timeout, parser.parse(&filing.object_id))
                    .await
                    .unwrap_or_else(|_| {
                        Err(ParseError::Timeout {
                            object_id: filing.object_id.clone(),
                            secs: parse_timeout.as_secs(),
                        })
                    });
                (filing, outcome)
            })
            .buffered(*parse_concurrency);

        let mut failed = Vec::new();

        while let Some((filing, outcome)) = outcomes.next().await {
            match outcome {
                Ok(result) => {
                    let added =
                        ingest_filing(&*store, accumulator, store_timeout, filing, result, summary)
                            .await?;
                    summary.processed += 1;
                    summary.records_buffered += added;
                },
                Err(e @ ParseError::FileMissing { .. }) => {
                    warn!(object_id = %filing.object_id, error = %e, "Filing file missing");
                    summary.missing += 1;
                    summary.missing_ids.push(filing.object_id.clone());
                    failed.push(filing.object_id.clone());
                },
                Err(e) => {
                    warn!(object_id = %filing.object_id, error = %e, "Skipping unparseable filing");
                    summary.invalid += 1;
                    failed.push(filing.object_id.clone());
                },
            }
        }

        let flushed = accumulator.flush_all().await?;

        let complete: Vec<String> = ids.into_iter().filter(|id| !failed.contains(id)).collect();
        if !complete.is_empty() {
            with_timeout(
                "Mark batch complete",
                store_timeout,
                store.mark_complete(&complete, Utc::now()),
            )
            .await?;
        }

        info!(
            batch = summary.batches,
            complete = complete.len(),
            failed = failed.len(),
            flushed,
            "Batch complete"
        );

        Ok(failed)
    }
}

/// Record one filing's diagnostics and buffer its records
///
/// Returns the number of records handed to the accumulator.
async fn ingest_filing<S, W>(
    store: &S,
    accumulator: &mut Accumulator<W>,
    store_timeout: Duration,
    filing: &Filing,
    mut result: ParseResult,
    summary: &mut RunSummary,
) -> IngestResult<u64>
where
    S: FilingStore,
    W: BulkWriter,
{
    let object_id = filing.object_id.as_str();

    if !result.schema_version.is_empty()
        && filing.schema_version.as_deref() != Some(result.schema_version.as_str())
    {
        with_timeout(
            "Update schema version",
            store_timeout,
            store.update_schema_version(object_id, &result.schema_version),
        )
        .await?;
    }

    let mut key_errors = std::mem::take(&mut result.key_errors);
    let mut records = result.into_records(filing);
    for record in &mut records {
        key_errors.extend(record.take_case_collisions());
    }

    // A clean parse also clears diagnostics left by an earlier run
    let stale = filing.is_error || filing.key_error_count > 0 || filing.error_details.is_some();
    if !key_errors.is_empty() || stale {
        debug!(object_id, key_errors = key_errors.len(), "Recording key errors");
        with_timeout(
            "Record key errors",
            store_timeout,
            store.record_key_errors(object_id, &key_errors),
        )
        .await?;
    }
    if !key_errors.is_empty() {
        summary.key_error_documents += 1;
    }

    let mut added = 0;
    for record in records {
        let record_type = record.record_type.clone();
        accumulator.add_record(&record_type, record.into_payload()).await?;
        added += 1;
    }

    Ok(added)
}
