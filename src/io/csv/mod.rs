// src/io/csv/mod.rs
//
// CSV ingestion: preview with column-role and timestamp-unit suggestions,
// then a row-by-row import into a new frame buffer.
// Accepts GVRET/SavvyCAN exports and ad-hoc logs (id, time, hex payload).

mod detect;
mod import;

pub use detect::preview_csv_file;
pub use import::{import_csv_file, parse_csv_with_mapping};

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::{BufferError, Result};

// ============================================================================
// Types
// ============================================================================

/// What a CSV column means to the importer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CsvColumnRole {
    FrameId,
    Timestamp,
    /// Hex payload. Several columns (D1..D8) are concatenated in column order.
    DataBytes,
    Bus,
    Dlc,
    Extended,
    Direction,
    Ignore,
}

/// Assignment of a role to one column (0-based)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvColumnMapping {
    pub column_index: usize,
    pub role: CsvColumnRole,
}

/// Unit of the raw timestamp values in a CSV file
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampUnit {
    Seconds,
    Milliseconds,
    #[default]
    Microseconds,
    Nanoseconds,
}

impl TimestampUnit {
    /// Convert a raw cell to signed microseconds. Integers are converted
    /// exactly; fractional values are rounded to the nearest microsecond.
    pub fn to_micros(self, raw: &str) -> Option<i64> {
        let raw = raw.trim();
        if let Ok(value) = raw.parse::<i128>() {
            let micros = match self {
                TimestampUnit::Seconds => value.checked_mul(1_000_000)?,
                TimestampUnit::Milliseconds => value.checked_mul(1_000)?,
                TimestampUnit::Microseconds => value,
                TimestampUnit::Nanoseconds => value / 1_000,
            };
            return i64::try_from(micros).ok();
        }

        let value: f64 = raw.parse().ok()?;
        let micros = match self {
            TimestampUnit::Seconds => value * 1e6,
            TimestampUnit::Milliseconds => value * 1e3,
            TimestampUnit::Microseconds => value,
            TimestampUnit::Nanoseconds => value / 1e3,
        }
        .round();
        (micros.is_finite() && micros.abs() < i64::MAX as f64).then_some(micros as i64)
    }
}

/// Result of sampling the head of a CSV file
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CsvPreview {
    /// Header cells, when the first row looks like a header
    pub headers: Option<Vec<String>>,
    /// Up to `max_rows` data rows, split into cells
    pub rows: Vec<Vec<String>>,
    /// Data rows in the whole file (header excluded)
    pub total_rows: usize,
    /// One suggested role per column
    pub suggested_mappings: Vec<CsvColumnMapping>,
    pub has_header: bool,
    pub suggested_timestamp_unit: TimestampUnit,
    /// Every sampled timestamp is negative (likely a sign error upstream)
    pub has_negative_timestamps: bool,
}

/// How to interpret a CSV file on import
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CsvImportOptions {
    pub mappings: Vec<CsvColumnMapping>,
    #[serde(default)]
    pub skip_first_row: bool,
    #[serde(default)]
    pub timestamp_unit: TimestampUnit,
    #[serde(default)]
    pub negate_timestamps: bool,
}

impl CsvImportOptions {
    /// Options taken straight from a preview's suggestions.
    pub fn from_preview(preview: &CsvPreview) -> Self {
        Self {
            mappings: preview.suggested_mappings.clone(),
            skip_first_row: preview.has_header,
            timestamp_unit: preview.suggested_timestamp_unit,
            negate_timestamps: preview.has_negative_timestamps,
        }
    }
}

/// Frames parsed from a CSV file, before they are stored
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedCsv {
    pub frames: Vec<crate::io::FrameMessage>,
    /// Data rows read (header and blank lines excluded)
    pub data_rows: usize,
    /// Rows dropped because a cell could not be parsed
    pub skipped_rows: usize,
}

/// Outcome of a committed import
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CsvImportSummary {
    pub metadata: crate::buffer_store::BufferMetadata,
    pub skipped_rows: usize,
}

// ============================================================================
// Reading
// ============================================================================

pub(crate) fn open_csv(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).map_err(|e| BufferError::File {
        path: path.display().to_string(),
        message: format!("Failed to open CSV file: {}", e),
    })?;
    Ok(BufReader::new(file))
}

/// Unreadable line (I/O failure or invalid UTF-8), 1-based.
pub(crate) fn line_error(path: &Path, line: usize, e: std::io::Error) -> BufferError {
    BufferError::Csv {
        path: path.display().to_string(),
        line,
        message: format!("Failed to read line: {}", e),
    }
}

// ============================================================================
// Line Splitting
// ============================================================================

/// Split one CSV line into trimmed cells. Double quotes group commas and
/// `""` inside quotes is a literal quote.
pub(crate) fn split_csv_line(line: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut cell = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                cell.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => cells.push(std::mem::take(&mut cell).trim().to_string()),
            _ => cell.push(c),
        }
    }
    cells.push(cell.trim().to_string());
    cells
}

/// Parse a frame id: `0x` prefix or hex letters mean hex, 8 hex digits
/// (GVRET) mean hex, anything else is decimal.
pub(crate) fn parse_frame_id(cell: &str) -> Option<u32> {
    let cell = cell.trim();
    if let Some(hex) = cell.strip_prefix("0x").or_else(|| cell.strip_prefix("0X")) {
        return u32::from_str_radix(hex, 16).ok();
    }
    if cell.is_empty() || !cell.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    if cell.len() == 8 || cell.chars().any(|c| c.is_ascii_alphabetic()) {
        u32::from_str_radix(cell, 16).ok()
    } else {
        cell.parse().ok()
    }
}

/// Decode a hex payload cell ("0102", "01 02", "0x01"). Empty gives no bytes.
pub(crate) fn parse_hex_bytes(cell: &str) -> Option<Vec<u8>> {
    let joined: String = cell.split_whitespace().collect();
    let compact = joined
        .strip_prefix("0x")
        .or_else(|| joined.strip_prefix("0X"))
        .unwrap_or(joined.as_str());
    match compact.len() {
        // GVRET writes single-digit bytes as "A"
        1 => u8::from_str_radix(compact, 16).ok().map(|b| vec![b]),
        n if n % 2 == 1 => None,
        _ => hex::decode(compact).ok(),
    }
}
