//! EIN filter files
//!
//! A filter file is a CSV with a header row and an `ein` column. Values are
//! normalized to the fixed-width form stored on filings.

use efile_common::types::normalize_ein;
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

use crate::error::{IngestError, IngestResult};

const EIN_COLUMN: &str = "ein";

/// Load the normalized, de-duplicated EINs listed in `path`
///
/// Order of first appearance is kept.
pub fn load_ein_filter(path: impl AsRef<Path>) -> IngestResult<Vec<String>> {
    let path = path.as_ref();

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(|e| IngestError::invalid_filter(path, e.to_string()))?;

    let column = reader
        .headers()
        .map_err(|e| IngestError::invalid_filter(path, e.to_string()))?
        .iter()
        .position(|h| h.eq_ignore_ascii_case(EIN_COLUMN))
        .ok_or_else(|| IngestError::invalid_filter(path, "no 'ein' column in header"))?;

    let mut seen = HashSet::new();
    let mut eins = Vec::new();

    for (index, record) in reader.records().enumerate() {
        let record = record.map_err(|e| IngestError::invalid_filter(path, e.to_string()))?;
        let raw = match record.get(column) {
            Some(raw) if !raw.is_empty() => raw,
            _ => continue,
        };

        // Header is line 1
        let ein = normalize_ein(raw).map_err(|e| {
            IngestError::invalid_filter(path, format!("line {}: {}", index + 2, e))
        })?;
        if seen.insert(ein.clone()) {
            eins.push(ein);
        }
    }

    info!(path = %path.display(), eins = eins.len(), "Loaded EIN filter");

    Ok(eins)
}
