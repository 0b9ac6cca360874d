// src/io/mod.rs
//
// Ingestion-side types and readers: the frame record stored in frame buffers,
// serial framing algorithms, CSV ingestion and cancellable task control.

pub mod control;
pub mod csv;
pub mod serial;

pub use control::{TaskControl, TaskHandle};
pub use csv::{
    import_csv_file, parse_csv_with_mapping, preview_csv_file, CsvColumnMapping, CsvColumnRole,
    CsvImportOptions, CsvImportSummary, CsvPreview, ParsedCsv, TimestampUnit,
};

use serde::{Deserialize, Serialize};

// ============================================================================
// Shared Types
// ============================================================================

/// Parsed frame message - the unit stored in frame buffers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameMessage {
    pub protocol: String, // e.g., "can", "modbus", "serial"
    /// Timestamp in microseconds.
    pub timestamp_us: u64,
    pub frame_id: u32,
    /// Bus/interface number, if the source distinguishes interfaces
    #[serde(default)]
    pub bus: Option<u8>,
    pub dlc: u16,
    pub bytes: Vec<u8>,
    // CAN-specific flags (ignored by other protocols)
    pub is_extended: bool,
    pub is_fd: bool,
    /// Source address (for protocols like J1939, TWC that embed sender ID in frame)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_address: Option<u16>,
    /// Indicates incomplete frame (e.g., no delimiter found at end of stream)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub incomplete: Option<bool>,
    /// Modbus RTU: whether the trailing CRC matched
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub crc_valid: Option<bool>,
    /// Set when the configured id/source-address bytes fell outside the frame
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id_unresolved: Option<bool>,
    /// Direction: "rx" for received, "tx" for transmitted
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub direction: Option<String>,
}

impl FrameMessage {
    /// A frame cut from a serial byte stream. Flags default to unset.
    pub fn serial(bytes: Vec<u8>, timestamp_us: u64, bus: Option<u8>) -> Self {
        Self {
            protocol: "serial".to_string(),
            timestamp_us,
            frame_id: 0,
            bus,
            dlc: dlc_for(bytes.len()),
            bytes,
            is_extended: false,
            is_fd: false,
            source_address: None,
            incomplete: None,
            crc_valid: None,
            id_unresolved: None,
            direction: None,
        }
    }
}

/// Payload length as stored in `dlc`, saturating for oversized serial frames.
pub fn dlc_for(len: usize) -> u16 {
    u16::try_from(len).unwrap_or(u16::MAX)
}
