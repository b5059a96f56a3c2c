//! PostgreSQL storage
//!
//! The filings table is expected to provide:
//!
//! ```sql
//! object_id TEXT PRIMARY KEY, submission_year INTEGER, ein TEXT,
//! parse_started BOOLEAN, parse_complete BOOLEAN, processed_at TIMESTAMPTZ,
//! schema_version TEXT, is_error BOOLEAN, error_details TEXT,
//! key_error_count INTEGER
//! ```
//!
//! Record tables are named `<prefix><lowercased record type>`; each needs an
//! `object_id` column and should carry a uniqueness constraint so replayed
//! batches insert nothing new.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use efile_common::types::{Filing, KeyError, RecordPayload};
use serde_json::Value;
use sqlx::PgPool;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{BulkWriter, FilingScope, FilingStore};
use crate::config::is_sql_identifier;
use crate::error::{IngestError, IngestResult};

// Helper struct for sqlx query_as
#[derive(Debug, sqlx::FromRow)]
struct FilingRow {
    object_id: String,
    submission_year: i32,
    ein: String,
    parse_started: bool,
    parse_complete: bool,
    processed_at: Option<DateTime<Utc>>,
    schema_version: Option<String>,
    is_error: bool,
    error_details: Option<String>,
    key_error_count: i32,
}

impl From<FilingRow> for Filing {
    fn from(row: FilingRow) -> Self {
        Self {
            object_id: row.object_id,
            submission_year: row.submission_year,
            ein: row.ein,
            parse_started: row.parse_started,
            parse_complete: row.parse_complete,
            processed_at: row.processed_at,
            schema_version: row.schema_version,
            is_error: row.is_error,
            error_details: row.error_details,
            key_error_count: row.key_error_count,
        }
    }
}

fn ein_filter(scope: &FilingScope) -> Option<Vec<String>> {
    scope.is_filtered().then(|| scope.eins.clone())
}

/// Filing status table in PostgreSQL
pub struct PgFilingStore {
    pool: PgPool,
    table: String,
}

impl PgFilingStore {
    pub fn new(pool: PgPool, table: impl Into<String>) -> IngestResult<Self> {
        let table = table.into();
        if !is_sql_identifier(&table) {
            return Err(IngestError::Config(format!(
                "Filings table '{}' is not a plain SQL identifier",
                table
            )));
        }
        Ok(Self { pool, table })
    }
}

#[async_trait]
impl FilingStore for PgFilingStore {
    async fn reset_in_progress(&self, scope: &FilingScope) -> IngestResult<u64> {
        // Rows with a NULL parse_complete are normalized too but only
        // previously started filings are counted
        let sql = format!(
            r#"
            WITH targets AS (
                SELECT object_id, parse_started IS TRUE AS was_started
                FROM {table}
                WHERE submission_year = $1
                  AND parse_complete IS NOT TRUE
                  AND (parse_started IS NOT FALSE OR parse_complete IS NULL)
                  AND ($2::text[] IS NULL OR ein = ANY($2))
                FOR UPDATE
            ),
            reset AS (
                UPDATE {table} AS f
                SET parse_started = FALSE, parse_complete = FALSE
                FROM targets
                WHERE f.object_id = targets.object_id
                RETURNING targets.was_started
            )
            SELECT COUNT(*) FILTER (WHERE was_started) FROM reset
            "#,
            table = self.table
        );

        let started: i64 = sqlx::query_scalar(&sql)
            .bind(scope.submission_year)
            .bind(ein_filter(scope))
            .fetch_one(&self.pool)
            .await?;

        Ok(started as u64)
    }

    async fn select_pending(
        &self,
        scope: &FilingScope,
        exclude: &[String],
        limit: usize,
    ) -> IngestResult<Vec<Filing>> {
        let sql = format!(
            r#"
            SELECT
                object_id,
                submission_year,
                ein,
                COALESCE(parse_started, FALSE) AS parse_started,
                COALESCE(parse_complete, FALSE) AS parse_complete,
                processed_at,
                schema_version,
                COALESCE(is_error, FALSE) AS is_error,
                error_details,
                COALESCE(key_error_count, 0) AS key_error_count
            FROM {table}
            WHERE submission_year = $1
              AND parse_complete IS NOT TRUE
              AND ($2::text[] IS NULL OR ein = ANY($2))
              AND NOT (object_id = ANY($3))
            ORDER BY object_id
            LIMIT $4
            "#,
            table = self.table
        );

        let rows = sqlx::query_as::<_, FilingRow>(&sql)
            .bind(scope.submission_year)
            .bind(ein_filter(scope))
            .bind(exclude.to_vec())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Filing::from).collect())
    }

    async fn mark_started(&self, object_ids: &[String]) -> IngestResult<()> {
        if object_ids.is_empty() {
            return Ok(());
        }

        let sql = format!(
            "UPDATE {} SET parse_started = TRUE WHERE object_id = ANY($1)",
            self.table
        );
        sqlx::query(&sql)
            .bind(object_ids.to_vec())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn mark_complete(
        &self,
        object_ids: &[String],
        processed_at: DateTime<Utc>,
    ) -> IngestResult<()> {
        if object_ids.is_empty() {
            return Ok(());
        }

        let sql = format!(
            "UPDATE {} SET parse_complete = TRUE, processed_at = $2 WHERE object_id = ANY($1)",
            self.table
        );
        sqlx::query(&sql)
            .bind(object_ids.to_vec())
            .bind(processed_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn update_schema_version(&self, object_id: &str, version: &str) -> IngestResult<()> {
        let sql = format!(
            "UPDATE {} SET schema_version = $2 WHERE object_id = $1",
            self.table
        );
        sqlx::query(&sql)
            .bind(object_id)
            .bind(version)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn record_key_errors(&self, object_id: &str, errors: &[KeyError]) -> IngestResult<()> {
        let details = if errors.is_empty() {
            None
        } else {
            Some(KeyError::serialize_list(errors)?)
        };
        let sql = format!(
            r#"
            UPDATE {}
            SET is_error = $4, key_error_count = $2, error_details = $3
            WHERE object_id = $1
            "#,
            self.table
        );
        sqlx::query(&sql)
            .bind(object_id)
            .bind(errors.len() as i32)
            .bind(details)
            .bind(!errors.is_empty())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// A resolved record table and its columns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub table: String,
    pub columns: Vec<String>,
}

/// Maps record-type names to record tables, resolved on first sight
///
/// The set of record types is open-ended, so nothing is declared up front:
/// the first write for a type looks its table up in `information_schema`
/// and caches the result. A type without a table is a fatal error.
pub struct DestinationRegistry {
    pool: PgPool,
    prefix: String,
    resolved: RwLock<HashMap<String, Arc<Destination>>>,
}

impl DestinationRegistry {
    pub fn new(pool: PgPool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
            resolved: RwLock::new(HashMap::new()),
        }
    }

    /// Table name for a record type: prefix plus the lowercased type name,
    /// with anything outside `[a-z0-9_]` replaced by `_`
    pub fn table_name(&self, record_type: &str) -> String {
        let suffix: String = record_type
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }

    pub async fn resolve(&self, record_type: &str) -> IngestResult<Arc<Destination>> {
        if let Some(destination) = self.resolved.read().await.get(record_type) {
            return Ok(destination.clone());
        }

        let table = self.table_name(record_type);
        if !is_sql_identifier(&table) {
            return Err(IngestError::UnknownRecordType(record_type.to_string()));
        }

        let columns: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT column_name::text
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            ORDER BY ordinal_position
            "#,
        )
        .bind(&table)
        .fetch_all(&self.pool)
        .await?;

        if columns.is_empty() {
            return Err(IngestError::UnknownRecordType(record_type.to_string()));
        }

        info!(
            record_type = %record_type,
            table = %table,
            columns = columns.len(),
            "Registered record destination"
        );

        let destination = Arc::new(Destination { table, columns });
        self.resolved
            .write()
            .await
            .insert(record_type.to_string(), destination.clone());

        Ok(destination)
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Bulk inserts into per-record-type tables
///
/// Each call is a single `INSERT ... SELECT FROM jsonb_populate_recordset`
/// statement, so it commits or fails as a unit. Rows that collide with a
/// uniqueness constraint are skipped. A payload key without a column fails
/// the whole write.
pub struct PgBulkWriter {
    pool: PgPool,
    registry: DestinationRegistry,
}

impl PgBulkWriter {
    pub fn new(pool: PgPool, table_prefix: impl Into<String>) -> Self {
        Self {
            registry: DestinationRegistry::new(pool.clone(), table_prefix),
            pool,
        }
    }

    pub fn registry(&self) -> &DestinationRegistry {
        &self.registry
    }
}

/// Payloads as JSON objects keyed by lowercased column name
///
/// Two keys of one payload that fold to the same name are an error.
fn column_rows(record_type: &str, payloads: &[RecordPayload]) -> IngestResult<Vec<Value>> {
    payloads
        .iter()
        .map(|payload| {
            let mut row = serde_json::Map::with_capacity(payload.len());
            for (key, value) in payload {
                let column = key.to_lowercase();
                if row.contains_key(&column) {
                    return Err(IngestError::WriteFailed {
                        record_type: record_type.to_string(),
                        reason: format!("payload keys collide on column '{}'", column),
                    });
                }
                row.insert(column, value.clone());
            }
            Ok(Value::Object(row))
        })
        .collect()
}

#[async_trait]
impl BulkWriter for PgBulkWriter {
    async fn write(&self, record_type: &str, payloads: &[RecordPayload]) -> IngestResult<()> {
        if payloads.is_empty() {
            return Ok(());
        }

        let destination = self.registry.resolve(record_type).await?;

        let rows = column_rows(record_type, payloads)?;

        let present: BTreeSet<&String> = rows
            .iter()
            .filter_map(Value::as_object)
            .flat_map(|row| row.keys())
            .collect();

        let unmatched: Vec<&String> = present
            .iter()
            .copied()
            .filter(|key| !destination.columns.contains(*key))
            .collect();
        if !unmatched.is_empty() {
            return Err(IngestError::WriteFailed {
                record_type: record_type.to_string(),
                reason: format!("{} has no column for {:?}", destination.table, unmatched),
            });
        }

        let columns: Vec<&String> = destination
            .columns
            .iter()
            .filter(|column| present.contains(column))
            .collect();

        if columns.is_empty() {
            return Err(IngestError::WriteFailed {
                record_type: record_type.to_string(),
                reason: format!("no payload key matches a column of {}", destination.table),
            });
        }

        let column_list = columns
            .iter()
            .map(|column| quote_identifier(column))
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            r#"
            INSERT INTO {table} ({columns})
            SELECT {columns} FROM jsonb_populate_recordset(NULL::{table}, $1)
            ON CONFLICT DO NOTHING
            "#,
            table = destination.table,
            columns = column_list
        );

        let result = sqlx::query(&sql)
            .bind(sqlx::types::Json(&rows))
            .execute(&self.pool)
            .await?;

        debug!(
            record_type = %record_type,
            table = %destination.table,
            submitted = rows.len(),
            inserted = result.rows_affected(),
            "Bulk insert committed"
        );

        Ok(())
    }
}
