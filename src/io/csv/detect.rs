// src/io/csv/detect.rs
//
// CSV preview heuristics: header detection, column-role and timestamp-unit
// suggestions. Everything here is a suggestion the user can override.

use std::collections::HashSet;
use std::io::BufRead;
use std::path::Path;

use super::{
    line_error, open_csv, parse_frame_id, split_csv_line, CsvColumnMapping, CsvColumnRole, CsvPreview,
    TimestampUnit,
};
use crate::error::Result;

/// Largest 29-bit CAN identifier
const MAX_FRAME_ID: u32 = 0x1FFF_FFFF;

/// Sample the head of a CSV file and suggest how to import it.
/// Reads at most `max_rows` data rows into memory; the rest of the file is
/// only counted.
pub fn preview_csv_file(path: &Path, max_rows: usize) -> Result<CsvPreview> {
    let reader = open_csv(path)?;

    let mut sample: Vec<Vec<String>> = Vec::new();
    let mut non_empty = 0usize;
    for (i, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| line_error(path, i + 1, e))?;
        if line.trim().is_empty() {
            continue;
        }
        non_empty += 1;
        // One extra row in case the first turns out to be a header
        if sample.len() <= max_rows {
            sample.push(split_csv_line(&line));
        }
    }

    let has_header = detect_header(&sample);
    let (headers, mut rows) = if has_header && !sample.is_empty() {
        let rows = sample.split_off(1);
        (sample.pop(), rows)
    } else {
        (None, sample)
    };
    rows.truncate(max_rows);

    let columns = headers
        .iter()
        .chain(rows.iter())
        .map(Vec::len)
        .max()
        .unwrap_or(0);
    let suggested_mappings = suggest_roles(headers.as_deref(), &rows, columns);

    let timestamps: Vec<&str> = suggested_mappings
        .iter()
        .find(|m| m.role == CsvColumnRole::Timestamp)
        .map(|m| column_values(&rows, m.column_index))
        .unwrap_or_default();

    let preview = CsvPreview {
        headers,
        total_rows: non_empty - usize::from(has_header),
        suggested_mappings,
        has_header,
        suggested_timestamp_unit: suggest_timestamp_unit(&timestamps),
        has_negative_timestamps: all_negative(&timestamps),
        rows,
    };

    tracing::info!(
        "[CSV] Preview of {:?}: {} rows, header: {}, unit: {:?}",
        path,
        preview.total_rows,
        preview.has_header,
        preview.suggested_timestamp_unit
    );
    Ok(preview)
}

// ============================================================================
// Header Detection
// ============================================================================

/// Role implied by a well-known column name (GVRET/SavvyCAN and common exports)
pub(crate) fn role_for_header(name: &str) -> Option<CsvColumnRole> {
    let name = name.trim().to_lowercase();
    let role = match name.as_str() {
        "time stamp" | "timestamp" | "time" | "ts" => CsvColumnRole::Timestamp,
        "id" | "frame id" | "frame_id" | "can id" | "arbitration id" => CsvColumnRole::FrameId,
        "extended" | "ext" => CsvColumnRole::Extended,
        "dir" | "direction" => CsvColumnRole::Direction,
        "bus" | "channel" => CsvColumnRole::Bus,
        "len" | "dlc" | "length" => CsvColumnRole::Dlc,
        "data" | "payload" | "bytes" => CsvColumnRole::DataBytes,
        _ => {
            // D1..D64, data1.., byte1..
            let digits = name
                .strip_prefix("data")
                .or_else(|| name.strip_prefix("byte"))
                .or_else(|| name.strip_prefix('d'))?;
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            CsvColumnRole::DataBytes
        }
    };
    Some(role)
}

/// Number (decimal, float or hex id) rather than free text
fn looks_numeric(cell: &str) -> bool {
    cell.parse::<f64>().is_ok() || parse_frame_id(cell).is_some()
}

/// The first row is a header if it uses known column names, or if one of its
/// cells is text while the cells below it are predominantly numeric.
fn detect_header(rows: &[Vec<String>]) -> bool {
    let Some(first) = rows.first() else {
        return false;
    };
    if first.iter().any(|cell| role_for_header(cell).is_some()) {
        return true;
    }

    let below = &rows[1..];
    if below.is_empty() {
        return first.iter().all(|cell| !cell.is_empty() && !looks_numeric(cell));
    }

    first.iter().enumerate().any(|(col, cell)| {
        if cell.is_empty() || looks_numeric(cell) {
            return false;
        }
        let values = column_values(below, col);
        let numeric = values.iter().filter(|v| looks_numeric(v)).count();
        !values.is_empty() && numeric * 2 > values.len()
    })
}

// ============================================================================
// Column Roles
// ============================================================================

/// Non-empty cells of one column
fn column_values(rows: &[Vec<String>], col: usize) -> Vec<&str> {
    rows.iter()
        .filter_map(|row| row.get(col))
        .map(String::as_str)
        .filter(|cell| !cell.is_empty())
        .collect()
}

fn distinct(values: &[&str]) -> usize {
    values.iter().collect::<HashSet<_>>().len()
}

/// Numeric and monotonic with mostly distinct values. All-negative columns
/// may run the other way (sign-flipped timestamps).
fn is_timestamp_like(values: &[&str]) -> bool {
    let Some(parsed) = values
        .iter()
        .map(|v| v.parse::<f64>().ok().filter(|f| f.is_finite()))
        .collect::<Option<Vec<f64>>>()
    else {
        return false;
    };
    if parsed.is_empty() {
        return false;
    }
    if parsed.len() == 1 {
        return true;
    }

    let rising = parsed.windows(2).all(|w| w[1] >= w[0]);
    let falling_negative = parsed.iter().all(|v| *v < 0.0) && parsed.windows(2).all(|w| w[1] <= w[0]);
    (rising || falling_negative) && distinct(values) * 2 > values.len()
}

/// Integers in identifier range that repeat, but are not constant
fn is_frame_id_like(values: &[&str]) -> bool {
    let all_ids = values
        .iter()
        .all(|v| parse_frame_id(v).is_some_and(|id| id <= MAX_FRAME_ID));
    let n = distinct(values);
    all_ids && n > 1 && n < values.len()
}

/// Even-length hex digit strings (spaces allowed between bytes)
fn is_hex_payload_like(values: &[&str]) -> bool {
    !values.is_empty()
        && values.iter().all(|v| {
            let compact: String = v.split_whitespace().collect();
            !compact.is_empty() && compact.len() % 2 == 0 && compact.chars().all(|c| c.is_ascii_hexdigit())
        })
}

/// One mapping per column. Header names are honoured first; remaining
/// columns are classified from their values. The earliest timestamp-like
/// and id-like columns win.
fn suggest_roles(headers: Option<&[String]>, rows: &[Vec<String>], columns: usize) -> Vec<CsvColumnMapping> {
    let mut roles: Vec<Option<CsvColumnRole>> = vec![None; columns];

    if let Some(headers) = headers {
        for (col, name) in headers.iter().enumerate().take(columns) {
            let role = role_for_header(name);
            // Only one timestamp and one id column
            let taken = matches!(role, Some(CsvColumnRole::Timestamp | CsvColumnRole::FrameId)) && roles.contains(&role);
            if !taken {
                roles[col] = role;
            }
        }
    }

    let unassigned = |roles: &[Option<CsvColumnRole>]| -> Vec<usize> {
        (0..columns).filter(|&col| roles[col].is_none()).collect()
    };

    if !roles.contains(&Some(CsvColumnRole::Timestamp)) {
        if let Some(col) = unassigned(&roles)
            .into_iter()
            .find(|&col| is_timestamp_like(&column_values(rows, col)))
        {
            roles[col] = Some(CsvColumnRole::Timestamp);
        }
    }

    if !roles.contains(&Some(CsvColumnRole::FrameId)) {
        if let Some(col) = unassigned(&roles)
            .into_iter()
            .find(|&col| is_frame_id_like(&column_values(rows, col)))
        {
            roles[col] = Some(CsvColumnRole::FrameId);
        }
    }

    for col in unassigned(&roles) {
        if is_hex_payload_like(&column_values(rows, col)) {
            roles[col] = Some(CsvColumnRole::DataBytes);
        }
    }

    roles
        .into_iter()
        .enumerate()
        .map(|(column_index, role)| CsvColumnMapping {
            column_index,
            role: role.unwrap_or(CsvColumnRole::Ignore),
        })
        .collect()
}

// ============================================================================
// Timestamps
// ============================================================================

/// Digits before the decimal point, ignoring sign
fn integer_digits(value: &str) -> Option<usize> {
    let unsigned = value.trim().trim_start_matches(['-', '+']);
    let integer = unsigned.split('.').next().unwrap_or("");
    (!integer.is_empty() && integer.chars().all(|c| c.is_ascii_digit())).then_some(integer.len())
}

/// Pick the unit whose epoch magnitude matches the widest value.
/// Short fractional values read as seconds; anything else as microseconds.
fn suggest_timestamp_unit(values: &[&str]) -> TimestampUnit {
    let digits = values.iter().filter_map(|v| integer_digits(v)).max();
    let fractional = values.iter().any(|v| v.contains('.'));
    match digits {
        Some(d) if d >= 18 => TimestampUnit::Nanoseconds,
        Some(15..=17) => TimestampUnit::Microseconds,
        Some(12..=14) => TimestampUnit::Milliseconds,
        Some(10..=11) => TimestampUnit::Seconds,
        Some(_) if fractional => TimestampUnit::Seconds,
        _ => TimestampUnit::Microseconds,
    }
}

fn all_negative(values: &[&str]) -> bool {
    !values.is_empty() && values.iter().all(|v| v.parse::<f64>().is_ok_and(|f| f < 0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn rows(lines: &[&str]) -> Vec<Vec<String>> {
        lines.iter().map(|l| split_csv_line(l)).collect()
    }

    fn csv_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn roles(preview: &CsvPreview) -> Vec<CsvColumnRole> {
        preview.suggested_mappings.iter().map(|m| m.role).collect()
    }

    // ========================================================================
    // Header Detection
    // ========================================================================

    #[test]
    fn test_header_by_name() {
        assert!(detect_header(&rows(&["Time Stamp,ID,Extended,Bus,LEN,D1"])));
    }

    #[test]
    fn test_header_by_text_over_numbers() {
        assert!(detect_header(&rows(&["when,who", "100,7", "200,8"])));
        assert!(!detect_header(&rows(&["100,7", "200,8"])));
        // Text under text is not a header signal
        assert!(!detect_header(&rows(&["alpha,7", "beta,8", "gamma,9"])));
    }

    #[test]
    fn test_no_rows_no_header() {
        assert!(!detect_header(&[]));
    }

    // ========================================================================
    // Roles
    // ========================================================================

    #[test]
    fn test_roles_from_values() {
        let data = rows(&[
            "1000,0x100,DEADBEEF,x",
            "1010,0x200,0102,y",
            "1020,0x100,FF00,z",
            "1030,0x200,00,w",
        ]);
        let roles: Vec<CsvColumnRole> = suggest_roles(None, &data, 4).into_iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                CsvColumnRole::Timestamp,
                CsvColumnRole::FrameId,
                CsvColumnRole::DataBytes,
                CsvColumnRole::Ignore
            ]
        );
    }

    #[test]
    fn test_earliest_timestamp_column_wins() {
        let data = rows(&["1,10", "2,20", "3,30"]);
        let mappings = suggest_roles(None, &data, 2);
        assert_eq!(mappings[0].role, CsvColumnRole::Timestamp);
        assert_ne!(mappings[1].role, CsvColumnRole::Timestamp);
    }

    #[test]
    fn test_constant_and_unique_columns_are_not_ids() {
        assert!(!is_frame_id_like(&["5", "5", "5"]));
        assert!(!is_frame_id_like(&["0x1", "0x2", "0x3"]));
        assert!(is_frame_id_like(&["0x1", "0x2", "0x1"]));
        assert!(!is_frame_id_like(&["0x1", "0xFFFFFFFF", "0x1"]));
    }

    #[test]
    fn test_decreasing_positive_column_is_not_timestamp() {
        assert!(!is_timestamp_like(&["30", "20", "10"]));
        assert!(is_timestamp_like(&["-10", "-20", "-30"]));
        assert!(!is_timestamp_like(&["7", "7", "7"]));
    }

    // ========================================================================
    // Timestamp Unit
    // ========================================================================

    #[test]
    fn test_unit_by_magnitude() {
        assert_eq!(suggest_timestamp_unit(&["1700000000"]), TimestampUnit::Seconds);
        assert_eq!(suggest_timestamp_unit(&["1700000000.25"]), TimestampUnit::Seconds);
        assert_eq!(suggest_timestamp_unit(&["1700000000123"]), TimestampUnit::Milliseconds);
        assert_eq!(suggest_timestamp_unit(&["1700000000123456"]), TimestampUnit::Microseconds);
        assert_eq!(suggest_timestamp_unit(&["1700000000123456789"]), TimestampUnit::Nanoseconds);
        assert_eq!(suggest_timestamp_unit(&["0.5", "1.25"]), TimestampUnit::Seconds);
        assert_eq!(suggest_timestamp_unit(&["150", "300"]), TimestampUnit::Microseconds);
        assert_eq!(suggest_timestamp_unit(&[]), TimestampUnit::Microseconds);
    }

    // ========================================================================
    // Preview
    // ========================================================================

    #[test]
    fn test_preview_gvret_export() {
        let file = csv_file(
            "Time Stamp,ID,Extended,Dir,Bus,LEN,D1,D2\n\
             1700000000000001,00000100,false,Rx,0,2,01,02\n\
             1700000000000101,00000200,true,Rx,0,2,03,04\n\
             \n\
             1700000000000201,00000100,false,Tx,1,2,05,06\n",
        );
        let preview = preview_csv_file(file.path(), 2).unwrap();

        assert!(preview.has_header);
        assert_eq!(preview.headers.as_ref().map(Vec::len), Some(8));
        assert_eq!(preview.rows.len(), 2);
        assert_eq!(preview.total_rows, 3);
        assert_eq!(
            roles(&preview),
            vec![
                CsvColumnRole::Timestamp,
                CsvColumnRole::FrameId,
                CsvColumnRole::Extended,
                CsvColumnRole::Direction,
                CsvColumnRole::Bus,
                CsvColumnRole::Dlc,
                CsvColumnRole::DataBytes,
                CsvColumnRole::DataBytes
            ]
        );
        assert_eq!(preview.suggested_timestamp_unit, TimestampUnit::Microseconds);
        assert!(!preview.has_negative_timestamps);
    }

    #[test]
    fn test_preview_flags_negative_timestamps() {
        let file = csv_file("-1.5,0x10,AA\n-2.5,0x11,BB\n-3.5,0x10,CC\n");
        let preview = preview_csv_file(file.path(), 10).unwrap();

        assert!(!preview.has_header);
        assert_eq!(preview.total_rows, 3);
        assert_eq!(preview.suggested_mappings[0].role, CsvColumnRole::Timestamp);
        assert_eq!(preview.suggested_timestamp_unit, TimestampUnit::Seconds);
        assert!(preview.has_negative_timestamps);
    }

    #[test]
    fn test_preview_missing_file() {
        let err = preview_csv_file(Path::new("/nonexistent/capture.csv"), 5).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/capture.csv"));
    }
}
