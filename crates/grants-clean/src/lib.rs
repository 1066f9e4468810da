//! Record cleaning for raw grants exports.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::Context;
use grants_core::{
    is_present, OpportunityRecord, ALREADY_POSTED, DROPPED_FIELDS, ESTIMATED_POST_DATE,
    FILLABLE_FIELDS, NOT_APPLICABLE_TOKENS, NOT_PROVIDED, POSTED_DATE, REQUIRED_FIELDS,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "grants-clean";

/// Keys under which the search API has been seen to nest its record array.
pub const RECORD_ARRAY_KEYS: [&str; 3] = ["oppHits", "records", "data"];

#[derive(Debug, Error)]
pub enum CleanError {
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("serializing cleaned records: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanReport {
    pub input_records: usize,
    pub kept_records: usize,
    pub dropped_records: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CleanedExport {
    pub records: Vec<OpportunityRecord>,
    pub report: CleanReport,
}

/// Locate the record array inside a raw API response.
pub fn extract_records(response: &JsonValue) -> Result<&Vec<JsonValue>, CleanError> {
    match response {
        JsonValue::Array(records) => Ok(records),
        JsonValue::Object(map) => {
            if let Some(records) = RECORD_ARRAY_KEYS
                .iter()
                .find_map(|key| map.get(*key).and_then(JsonValue::as_array))
            {
                return Ok(records);
            }
            let mut arrays = map.values().filter_map(JsonValue::as_array);
            match (arrays.next(), arrays.next()) {
                (Some(records), None) => Ok(records),
                (None, _) => Err(CleanError::MalformedInput(
                    "response object holds no record array".to_string(),
                )),
                (Some(_), Some(_)) => Err(CleanError::MalformedInput(
                    "response object holds several arrays and none under a known key".to_string(),
                )),
            }
        }
        other => Err(CleanError::MalformedInput(format!(
            "expected a record array or response object, found {}",
            json_kind(other)
        ))),
    }
}

/// Clean a raw JSON array of records. Anything but an array of objects is rejected.
pub fn clean_records(raw_records: &JsonValue) -> Result<CleanedExport, CleanError> {
    let JsonValue::Array(items) = raw_records else {
        return Err(CleanError::MalformedInput(format!(
            "expected an array of records, found {}",
            json_kind(raw_records)
        )));
    };

    let records = items
        .iter()
        .enumerate()
        .map(|(index, item)| match item {
            JsonValue::Object(record) => Ok(record.clone()),
            other => Err(CleanError::MalformedInput(format!(
                "record {index} is {}, expected an object",
                json_kind(other)
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(clean_record_list(records))
}

/// Run the cleaning pipeline. Required-field filtering happens before any fill so a
/// sentinel can never satisfy a required column. The export is column-oriented: every
/// kept record ends up with the same columns.
pub fn clean_record_list(records: Vec<OpportunityRecord>) -> CleanedExport {
    let input_records = records.len();

    let kept = records
        .into_iter()
        .filter(has_required_fields)
        .map(|mut record| {
            drop_unneeded_fields(&mut record);
            record
        })
        .collect::<Vec<_>>();

    let records = align_columns(kept)
        .into_iter()
        .map(|mut record| {
            fill_not_provided(&mut record);
            resolve_posted_dates(&mut record);
            record
        })
        .collect::<Vec<_>>();

    let report = CleanReport {
        input_records,
        kept_records: records.len(),
        dropped_records: input_records - records.len(),
    };
    info!(
        input = report.input_records,
        kept = report.kept_records,
        dropped = report.dropped_records,
        "cleaned grant records"
    );
    CleanedExport { records, report }
}

pub fn has_required_fields(record: &OpportunityRecord) -> bool {
    let missing = REQUIRED_FIELDS
        .iter()
        .filter(|field| !is_present(record.get(**field)))
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        debug!(?missing, "dropping record without required fields");
    }
    missing.is_empty()
}

/// Give every record the ordered union of all records' columns, `null` where missing.
pub fn align_columns(records: Vec<OpportunityRecord>) -> Vec<OpportunityRecord> {
    let mut seen = HashSet::new();
    let mut columns = Vec::new();
    for key in records.iter().flat_map(|record| record.keys()) {
        if seen.insert(key.as_str()) {
            columns.push(key.clone());
        }
    }

    records
        .iter()
        .map(|record| {
            columns
                .iter()
                .map(|column| {
                    let value = record.get(column).cloned().unwrap_or(JsonValue::Null);
                    (column.clone(), value)
                })
                .collect()
        })
        .collect()
}

pub fn drop_unneeded_fields(record: &mut OpportunityRecord) {
    for field in DROPPED_FIELDS {
        record.shift_remove(field);
    }
}

pub fn fill_not_provided(record: &mut OpportunityRecord) {
    for field in FILLABLE_FIELDS {
        let Some(value) = record.get_mut(field) else {
            continue;
        };
        let blank = match value {
            JsonValue::Null => true,
            JsonValue::String(s) => NOT_APPLICABLE_TOKENS.contains(&s.as_str()),
            _ => false,
        };
        if blank {
            *value = JsonValue::String(NOT_PROVIDED.to_string());
        }
    }
}

pub fn resolve_posted_dates(record: &mut OpportunityRecord) {
    for field in [POSTED_DATE, ESTIMATED_POST_DATE] {
        if let Some(value) = record.get_mut(field) {
            if value.as_str() == Some("") {
                *value = JsonValue::Null;
            }
        }
    }

    if is_present(record.get(POSTED_DATE)) && is_present(record.get(ESTIMATED_POST_DATE)) {
        record.insert(
            ESTIMATED_POST_DATE.to_string(),
            JsonValue::String(ALREADY_POSTED.to_string()),
        );
    }
}

/// Cleaned export document: 4-space indentation, non-ASCII left unescaped.
pub fn to_pretty_json(records: &[OpportunityRecord]) -> Result<Vec<u8>, CleanError> {
    Ok(grants_core::to_pretty_json(records, 4)?)
}

/// Read a raw export file (response object or bare array) and clean it.
pub fn clean_export_file(path: impl AsRef<Path>) -> anyhow::Result<CleanedExport> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let response: JsonValue =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    let records = extract_records(&response)
        .with_context(|| format!("locating records in {}", path.display()))?;
    let cleaned = clean_records(&JsonValue::Array(records.clone()))
        .with_context(|| format!("cleaning {}", path.display()))?;
    Ok(cleaned)
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}
