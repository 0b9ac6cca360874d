// src/io/csv/import.rs
//
// Row-by-row CSV import using caller-supplied column roles.

use std::io::BufRead;
use std::path::Path;

use super::{
    line_error, open_csv, parse_frame_id, parse_hex_bytes, split_csv_line, CsvColumnMapping, CsvColumnRole,
    CsvImportOptions, CsvImportSummary, ParsedCsv,
};
use crate::buffer_store::BufferRegistry;
use crate::error::{BufferError, Result};
use crate::io::{dlc_for, FrameMessage, TaskControl};

/// Rows parsed between cancellation checks
const CANCEL_CHECK_ROWS: usize = 1024;

/// Largest standard (11-bit) CAN identifier
const MAX_STANDARD_ID: u32 = 0x7FF;

/// Column positions resolved from the mappings
#[derive(Debug, Default)]
struct RowLayout {
    frame_id: Option<usize>,
    timestamp: Option<usize>,
    data: Vec<usize>,
    bus: Option<usize>,
    dlc: Option<usize>,
    extended: Option<usize>,
    direction: Option<usize>,
}

impl RowLayout {
    fn new(mappings: &[CsvColumnMapping]) -> Result<Self> {
        let mut layout = RowLayout::default();
        let mut sorted: Vec<&CsvColumnMapping> = mappings.iter().collect();
        sorted.sort_by_key(|m| m.column_index);

        for mapping in sorted {
            let slot = match mapping.role {
                CsvColumnRole::DataBytes => {
                    layout.data.push(mapping.column_index);
                    continue;
                }
                CsvColumnRole::Ignore => continue,
                CsvColumnRole::FrameId => &mut layout.frame_id,
                CsvColumnRole::Timestamp => &mut layout.timestamp,
                CsvColumnRole::Bus => &mut layout.bus,
                CsvColumnRole::Dlc => &mut layout.dlc,
                CsvColumnRole::Extended => &mut layout.extended,
                CsvColumnRole::Direction => &mut layout.direction,
            };
            if let Some(existing) = slot.replace(mapping.column_index) {
                return Err(BufferError::config(
                    "mappings",
                    format!(
                        "columns {} and {} are both mapped to {:?}",
                        existing, mapping.column_index, mapping.role
                    ),
                ));
            }
        }
        Ok(layout)
    }

    /// Highest mapped column, if any
    fn last_column(&self) -> Option<usize> {
        [self.frame_id, self.timestamp, self.bus, self.dlc, self.extended, self.direction]
            .into_iter()
            .flatten()
            .chain(self.data.iter().copied())
            .max()
    }
}

/// Assemble one frame from a row. `Err` names the cell that failed to parse;
/// the row is then skipped and counted.
fn parse_row(cells: &[String], layout: &RowLayout, options: &CsvImportOptions) -> std::result::Result<FrameMessage, &'static str> {
    let cell = |col: Option<usize>| col.and_then(|c| cells.get(c)).map(|s| s.trim());

    let frame_id = match cell(layout.frame_id) {
        Some(raw) => parse_frame_id(raw).ok_or("frame id")?,
        None => 0,
    };

    let timestamp_us = match cell(layout.timestamp) {
        Some(raw) => {
            let mut micros = options.timestamp_unit.to_micros(raw).ok_or("timestamp")?;
            if options.negate_timestamps {
                micros = micros.saturating_abs();
            }
            u64::try_from(micros).map_err(|_| "negative timestamp")?
        }
        None => 0,
    };

    let mut bytes = Vec::new();
    for &col in &layout.data {
        let raw = cells.get(col).map(String::as_str).unwrap_or("");
        bytes.extend(parse_hex_bytes(raw).ok_or("data bytes")?);
    }

    let dlc = match cell(layout.dlc).filter(|raw| !raw.is_empty()) {
        Some(raw) => {
            let dlc: u16 = raw.parse().map_err(|_| "dlc")?;
            bytes.truncate(dlc as usize);
            dlc
        }
        None => dlc_for(bytes.len()),
    };

    let bus = match cell(layout.bus).filter(|raw| !raw.is_empty()) {
        Some(raw) => Some(raw.parse::<u8>().map_err(|_| "bus")?),
        None => None,
    };

    let is_extended = match cell(layout.extended) {
        Some(raw) => matches!(raw.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "x" | "ext"),
        None => frame_id > MAX_STANDARD_ID,
    };

    let direction = cell(layout.direction)
        .filter(|raw| !raw.is_empty())
        .map(|raw| (if raw.eq_ignore_ascii_case("tx") { "tx" } else { "rx" }).to_string());

    Ok(FrameMessage {
        protocol: "can".to_string(),
        timestamp_us,
        frame_id,
        bus,
        dlc,
        is_fd: bytes.len() > 8,
        bytes,
        is_extended,
        source_address: None,
        incomplete: None,
        crc_valid: None,
        id_unresolved: None,
        direction,
    })
}

/// Parse a whole CSV file with explicit column roles.
///
/// Rows with an unparsable cell are skipped and counted. A row whose column
/// count differs from the first row aborts the parse with its line number.
pub fn parse_csv_with_mapping(path: &Path, options: &CsvImportOptions, control: &TaskControl) -> Result<ParsedCsv> {
    let layout = RowLayout::new(&options.mappings)?;
    let reader = open_csv(path)?;

    let mut parsed = ParsedCsv::default();
    let mut width: Option<usize> = None;
    let mut first_skipped: Option<(usize, &'static str)> = None;

    for (i, line) in reader.lines().enumerate() {
        let line_number = i + 1;
        let line = line.map_err(|e| line_error(path, line_number, e))?;
        if line.trim().is_empty() {
            continue;
        }

        let cells = split_csv_line(&line);
        let expected = match width {
            Some(w) => w,
            None => {
                // First row fixes the layout of the file
                if let Some(last) = layout.last_column().filter(|&c| c >= cells.len()) {
                    return Err(BufferError::config(
                        "mappings",
                        format!("column {} is beyond the {} columns in {:?}", last, cells.len(), path),
                    ));
                }
                width = Some(cells.len());
                if options.skip_first_row {
                    continue;
                }
                cells.len()
            }
        };
        if cells.len() != expected {
            return Err(BufferError::Csv {
                path: path.display().to_string(),
                line: line_number,
                message: format!("expected {} columns, found {}", expected, cells.len()),
            });
        }

        parsed.data_rows += 1;
        if parsed.data_rows % CANCEL_CHECK_ROWS == 0 {
            control.check()?;
            control.set_progress(parsed.data_rows as u64);
        }

        match parse_row(&cells, &layout, options) {
            Ok(frame) => parsed.frames.push(frame),
            Err(reason) => {
                parsed.skipped_rows += 1;
                first_skipped.get_or_insert((line_number, reason));
            }
        }
    }
    control.check()?;
    control.set_progress(parsed.data_rows as u64);

    if let Some((line, reason)) = first_skipped {
        tracing::warn!(
            "[CSV] Skipped {} unparsable rows in {:?} (first at line {}: bad {})",
            parsed.skipped_rows,
            path,
            line,
            reason
        );
    }
    tracing::info!("[CSV] Parsed {} frames from {:?}", parsed.frames.len(), path);
    Ok(parsed)
}

/// Import a CSV file into a new frame buffer named after the file.
pub fn import_csv_file(
    registry: &BufferRegistry,
    path: &Path,
    options: &CsvImportOptions,
    control: &TaskControl,
) -> Result<CsvImportSummary> {
    let parsed = parse_csv_with_mapping(path, options, control)?;
    if parsed.frames.is_empty() {
        return Err(BufferError::Empty(format!(
            "No frames parsed from {:?} ({} rows skipped)",
            path, parsed.skipped_rows
        )));
    }

    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "CSV import".to_string());
    let metadata = registry.create_frames(name, parsed.frames)?;

    Ok(CsvImportSummary {
        metadata,
        skipped_rows: parsed.skipped_rows,
    })
}
