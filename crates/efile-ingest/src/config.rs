//! Ingestion configuration
//!
//! Values come from the environment (a `.env` file is honored), falling back
//! to the `DEFAULT_*` constants below.

use chrono::Datelike;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{IngestError, IngestResult};

// ============================================================================
// Defaults
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/efile";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default directory holding `<object_id>_public.xml` files.
pub const DEFAULT_FILING_DIR: &str = "./filings";

/// Default filing status table.
pub const DEFAULT_FILINGS_TABLE: &str = "filing_filing";

/// Default prefix of per-record-type tables.
pub const DEFAULT_RECORD_TABLE_PREFIX: &str = "return_";

/// Default number of filings claimed per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default per-type buffer length that triggers a bulk write.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 1000;

/// Default number of parser calls in flight within a batch.
pub const DEFAULT_PARSE_CONCURRENCY: usize = 1;

/// Default per-filing parser timeout in seconds.
pub const DEFAULT_PARSE_TIMEOUT_SECS: u64 = 60;

/// Default timeout for a single storage operation in seconds.
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 120;

/// First submission year electronic filings exist for.
pub const MIN_SUBMISSION_YEAR: i32 = 2014;

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub database: DatabaseConfig,
    pub filing_dir: PathBuf,
    pub filings_table: String,
    pub record_table_prefix: String,
    pub batch_size: usize,
    pub flush_threshold: usize,
    /// Per-record-type overrides of `flush_threshold`
    pub flush_thresholds: HashMap<String, usize>,
    pub parse_concurrency: usize,
    pub parse_timeout_secs: u64,
    pub write_timeout_secs: u64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl IngestConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> IngestResult<Self> {
        dotenvy::dotenv().ok();

        let flush_thresholds = match std::env::var("EFILE_FLUSH_THRESHOLDS") {
            Ok(overrides) => parse_thresholds(&overrides)?,
            Err(_) => HashMap::new(),
        };

        let config = Self {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
            },
            filing_dir: std::env::var("EFILE_FILING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_FILING_DIR)),
            filings_table: std::env::var("EFILE_FILINGS_TABLE")
                .unwrap_or_else(|_| DEFAULT_FILINGS_TABLE.to_string()),
            record_table_prefix: std::env::var("EFILE_RECORD_TABLE_PREFIX")
                .unwrap_or_else(|_| DEFAULT_RECORD_TABLE_PREFIX.to_string()),
            batch_size: env_or("EFILE_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            flush_threshold: env_or("EFILE_FLUSH_THRESHOLD", DEFAULT_FLUSH_THRESHOLD),
            flush_thresholds,
            parse_concurrency: env_or("EFILE_PARSE_CONCURRENCY", DEFAULT_PARSE_CONCURRENCY),
            parse_timeout_secs: env_or("EFILE_PARSE_TIMEOUT_SECS", DEFAULT_PARSE_TIMEOUT_SECS),
            write_timeout_secs: env_or("EFILE_WRITE_TIMEOUT_SECS", DEFAULT_WRITE_TIMEOUT_SECS),
        };

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> IngestResult<()> {
        if self.database.url.is_empty() {
            return Err(IngestError::Config("Database URL cannot be empty".into()));
        }
        if self.database.max_connections == 0 {
            return Err(IngestError::Config(
                "DATABASE_MAX_CONNECTIONS must be greater than 0".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(IngestError::Config("EFILE_BATCH_SIZE must be greater than 0".into()));
        }
        if self.flush_threshold == 0 || self.flush_thresholds.values().any(|n| *n == 0) {
            return Err(IngestError::Config("Flush thresholds must be greater than 0".into()));
        }
        if self.parse_concurrency == 0 {
            return Err(IngestError::Config(
                "EFILE_PARSE_CONCURRENCY must be greater than 0".into(),
            ));
        }
        if self.parse_timeout_secs == 0 || self.write_timeout_secs == 0 {
            return Err(IngestError::Config("Timeouts must be greater than 0".into()));
        }
        if !is_sql_identifier(&self.filings_table) {
            return Err(IngestError::Config(format!(
                "EFILE_FILINGS_TABLE '{}' is not a plain SQL identifier",
                self.filings_table
            )));
        }
        // The prefix may be empty; a non-empty one must itself be identifier-safe
        if !self.record_table_prefix.is_empty() && !is_sql_identifier(&self.record_table_prefix) {
            return Err(IngestError::Config(format!(
                "EFILE_RECORD_TABLE_PREFIX '{}' is not a plain SQL identifier",
                self.record_table_prefix
            )));
        }

        Ok(())
    }

    pub fn parse_timeout(&self) -> Duration {
        Duration::from_secs(self.parse_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            },
            filing_dir: PathBuf::from(DEFAULT_FILING_DIR),
            filings_table: DEFAULT_FILINGS_TABLE.to_string(),
            record_table_prefix: DEFAULT_RECORD_TABLE_PREFIX.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            flush_thresholds: HashMap::new(),
            parse_concurrency: DEFAULT_PARSE_CONCURRENCY,
            parse_timeout_secs: DEFAULT_PARSE_TIMEOUT_SECS,
            write_timeout_secs: DEFAULT_WRITE_TIMEOUT_SECS,
        }
    }
}

/// Parse `type=n,type2=m` threshold overrides
pub fn parse_thresholds(overrides: &str) -> IngestResult<HashMap<String, usize>> {
    let mut thresholds = HashMap::new();

    for entry in overrides.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (record_type, value) = entry.split_once('=').ok_or_else(|| {
            IngestError::Config(format!("Threshold override '{}' is not type=n", entry))
        })?;
        let value: usize = value.trim().parse().map_err(|_| {
            IngestError::Config(format!("Threshold override '{}' has a non-numeric value", entry))
        })?;
        thresholds.insert(record_type.trim().to_string(), value);
    }

    Ok(thresholds)
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {},
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Reject submission years outside the range filings can exist for
pub fn validate_submission_year(year: i32) -> IngestResult<i32> {
    let max = chrono::Utc::now().year() + 1;
    if (MIN_SUBMISSION_YEAR..=max).contains(&year) {
        Ok(year)
    } else {
        Err(IngestError::InvalidPeriod {
            year,
            min: MIN_SUBMISSION_YEAR,
            max,
        })
    }
}
