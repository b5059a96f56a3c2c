//! Shared domain types for filing ingestion

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::error::{CommonError, Result};

/// Width of a normalized employer identification number.
pub const EIN_WIDTH: usize = 9;

/// Flat key/value body of one parsed record.
pub type RecordPayload = serde_json::Map<String, Value>;

/// A filing document and its processing state (maps to the filings table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filing {
    /// Globally unique, immutable identifier
    pub object_id: String,
    /// Target period the filing was submitted in
    pub submission_year: i32,
    /// Normalized employer identification number
    pub ein: String,
    pub parse_started: bool,
    pub parse_complete: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub schema_version: Option<String>,
    pub is_error: bool,
    /// JSON array of [`KeyError`] descriptors
    pub error_details: Option<String>,
    pub key_error_count: i32,
}

impl Filing {
    /// A freshly discovered filing with no processing state
    pub fn new(object_id: impl Into<String>, submission_year: i32, ein: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
            submission_year,
            ein: ein.into(),
            parse_started: false,
            parse_complete: false,
            processed_at: None,
            schema_version: None,
            is_error: false,
            error_details: None,
            key_error_count: 0,
        }
    }

    /// Started by an earlier run that never reached completion
    pub fn is_interrupted(&self) -> bool {
        self.parse_started && !self.parse_complete
    }
}

/// A parser lookup that expected a value and did not find a place for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyError {
    pub xpath: String,
    pub message: String,
}

impl KeyError {
    pub fn new(xpath: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            xpath: xpath.into(),
            message: message.into(),
        }
    }

    /// Serialize a list of key errors for the `error_details` column
    pub fn serialize_list(errors: &[KeyError]) -> Result<String> {
        Ok(serde_json::to_string(errors)?)
    }
}

/// Keys every payload is stamped with before it is written
pub const ORIGIN_KEYS: [&str; 2] = ["object_id", "ein"];

/// One record emitted by the parser, tagged with its type and origin filing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRecord {
    /// Name of the schedule part or group this record belongs to
    pub record_type: String,
    pub object_id: String,
    pub ein: String,
    pub data: RecordPayload,
}

impl ParsedRecord {
    pub fn new(
        record_type: impl Into<String>,
        filing: &Filing,
        data: RecordPayload,
    ) -> Self {
        Self {
            record_type: record_type.into(),
            object_id: filing.object_id.clone(),
            ein: filing.ein.clone(),
            data,
        }
    }

    /// Remove payload keys that clash with another key once case is folded
    ///
    /// Destination columns are lowercase, so `EIN` and the stamped `ein`
    /// would land in the same column. The later key in sorted order loses
    /// and is reported as a key error carrying its value.
    pub fn take_case_collisions(&mut self) -> Vec<KeyError> {
        let mut seen: HashMap<String, String> = ORIGIN_KEYS
            .iter()
            .map(|key| (key.to_string(), key.to_string()))
            .collect();
        let mut clashes = Vec::new();
        for key in self.data.keys() {
            let folded = key.to_lowercase();
            match seen.get(&folded) {
                Some(kept) => clashes.push((key.clone(), kept.clone())),
                None => {
                    seen.insert(folded, key.clone());
                }
            }
        }

        clashes
            .into_iter()
            .map(|(key, kept)| {
                let value = self.data.remove(&key).unwrap_or(Value::Null);
                KeyError::new(
                    format!("{}/{}", self.record_type, key),
                    format!("value {} dropped: key collides with '{}'", value, kept),
                )
            })
            .collect()
    }

    /// Payload with `object_id` and `ein` stamped in, ready for a bulk write
    pub fn into_payload(self) -> RecordPayload {
        let mut data = self.data;
        data.insert("object_id".to_string(), Value::String(self.object_id));
        data.insert("ein".to_string(), Value::String(self.ein));
        data
    }
}

/// Records produced for one schedule of a filing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleResult {
    pub name: String,
    /// Part name -> part payload
    pub parts: BTreeMap<String, RecordPayload>,
    /// Group name -> one payload per group instance
    pub groups: BTreeMap<String, Vec<RecordPayload>>,
}

impl ScheduleResult {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parts plus group instances
    pub fn record_count(&self) -> usize {
        self.parts.len() + self.groups.values().map(Vec::len).sum::<usize>()
    }
}

/// Successful parser output for one filing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseResult {
    pub schedules: Vec<ScheduleResult>,
    pub schema_version: String,
    pub key_errors: Vec<KeyError>,
}

impl ParseResult {
    pub fn record_count(&self) -> usize {
        self.schedules.iter().map(ScheduleResult::record_count).sum()
    }

    /// Every part and group instance, in schedule order
    pub fn into_records(self, filing: &Filing) -> Vec<ParsedRecord> {
        let mut records = Vec::with_capacity(self.record_count());
        for schedule in self.schedules {
            for (part_name, part) in schedule.parts {
                records.push(ParsedRecord::new(part_name, filing, part));
            }
            for (group_name, instances) in schedule.groups {
                for instance in instances {
                    records.push(ParsedRecord::new(group_name.clone(), filing, instance));
                }
            }
        }
        records
    }
}

/// Normalize an EIN to a fixed-width, zero-padded string of digits
///
/// Whitespace and `-` separators are removed; anything else that is not an
/// ASCII digit is rejected.
pub fn normalize_ein(raw: &str) -> Result<String> {
    let digits: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();

    if digits.is_empty() {
        return Err(CommonError::invalid_ein(raw, "empty value"));
    }
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(CommonError::invalid_ein(raw, "contains non-digit characters"));
    }
    if digits.len() > EIN_WIDTH {
        return Err(CommonError::invalid_ein(
            raw,
            format!("longer than {} digits", EIN_WIDTH),
        ));
    }

    Ok(format!("{:0>width$}", digits, width = EIN_WIDTH))
}
