// src/io/serial/framer.rs
//
// Serial framing implementations for raw/delimiter, SLIP, and Modbus RTU framing.
// Each framer is incremental: feed() as bytes arrive, flush() at end of stream.

use serde::{Deserialize, Serialize};

use crate::checksums::{crc16_modbus_checksum, resolve_byte_index};
use crate::error::{BufferError, Result};

use super::modbus::{self, Match, MAX_ADU};

// =============================================================================
// SLIP Constants (RFC 1055)
// =============================================================================

const SLIP_END: u8 = 0xC0;
const SLIP_ESC: u8 = 0xDB;
const SLIP_ESC_END: u8 = 0xDC;
const SLIP_ESC_ESC: u8 = 0xDD;

// =============================================================================
// Types
// =============================================================================

/// Framing mode. Each variant carries only the options that apply to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramingMode {
    /// Split on a delimiter sequence, force-splitting at `max_length`.
    /// Without a delimiter, `max_length` alone gives fixed-size chunks.
    Raw {
        delimiter: Option<Vec<u8>>,
        max_length: usize,
    },
    /// SLIP framing (RFC 1055)
    Slip,
    /// Modbus RTU framing
    ModbusRtu { validate_crc: bool },
}

impl Default for FramingMode {
    fn default() -> Self {
        FramingMode::Slip
    }
}

/// A frame cut from the serial stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialFrame {
    /// Frame data bytes (SLIP-decoded, delimiter removed)
    pub bytes: Vec<u8>,
    /// Stream offset of the first byte that belongs to this frame
    pub start: usize,
    /// Whether this frame came from flush() and may be incomplete
    pub incomplete: bool,
    /// False for frames that failed an integrity check the mode enforces
    /// (bad SLIP escape, rejected Modbus CRC)
    pub valid: bool,
    /// For Modbus RTU: whether the CRC matched (None for other modes)
    pub crc_valid: Option<bool>,
}

/// Location of a frame id or source address inside a frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteIndexConfig {
    /// Start byte index (negative = from end)
    pub start_byte: i32,
    /// Number of bytes (1 or 2)
    pub num_bytes: u8,
    /// Whether to interpret as big-endian
    pub big_endian: bool,
}

impl Default for ByteIndexConfig {
    fn default() -> Self {
        ByteIndexConfig {
            start_byte: 0,
            num_bytes: 1,
            big_endian: false,
        }
    }
}

impl ByteIndexConfig {
    /// Reject configurations that can never resolve. `field` names the config
    /// being checked in the error.
    pub fn validate(&self, field: &str) -> Result<()> {
        if !matches!(self.num_bytes, 1 | 2) {
            return Err(BufferError::config(
                &format!("{}.num_bytes", field),
                format!("must be 1 or 2, got {}", self.num_bytes),
            ));
        }
        if self.start_byte < 0 && self.start_byte.unsigned_abs() < self.num_bytes as u32 {
            return Err(BufferError::config(
                &format!("{}.start_byte", field),
                format!(
                    "{} leaves fewer than {} bytes before the end of the frame",
                    self.start_byte, self.num_bytes
                ),
            ));
        }
        Ok(())
    }
}

/// Read a 1- or 2-byte unsigned value from a frame.
/// Returns `None` when the resolved range falls outside the frame.
pub fn extract_byte_index(frame: &[u8], config: &ByteIndexConfig) -> Option<u32> {
    let start = resolve_byte_index(config.start_byte, frame.len())?;
    let bytes = frame.get(start..start.checked_add(config.num_bytes as usize)?)?;

    match bytes {
        [b] => Some(*b as u32),
        [a, b] if config.big_endian => Some(u16::from_be_bytes([*a, *b]) as u32),
        [a, b] => Some(u16::from_le_bytes([*a, *b]) as u32),
        _ => None,
    }
}

// =============================================================================
// Internal Framer Trait
// =============================================================================

trait FramerImpl {
    fn feed(&mut self, data: &[u8]) -> Vec<SerialFrame>;
    fn flush(&mut self) -> Vec<SerialFrame>;
}

// =============================================================================
// Raw / Delimiter Framer
// =============================================================================

struct RawFramer {
    buffer: Vec<u8>,
    /// Empty = no delimiter, chunk by max_length only
    delimiter: Vec<u8>,
    max_length: usize,
    /// Stream position of the next byte to be fed
    pos: usize,
    /// Stream position of buffer[0]
    frame_start: usize,
}

impl RawFramer {
    fn new(delimiter: Option<Vec<u8>>, max_length: usize) -> Self {
        RawFramer {
            buffer: Vec::new(),
            delimiter: delimiter.unwrap_or_default(),
            max_length: max_length.max(1),
            pos: 0,
            frame_start: 0,
        }
    }

    fn take(&mut self, len: usize, incomplete: bool) -> SerialFrame {
        let bytes: Vec<u8> = self.buffer.drain(..len).collect();
        SerialFrame {
            bytes,
            start: self.frame_start,
            incomplete,
            valid: true,
            crc_valid: None,
        }
    }
}

impl FramerImpl for RawFramer {
    fn feed(&mut self, data: &[u8]) -> Vec<SerialFrame> {
        let mut frames = Vec::new();

        for &byte in data {
            self.buffer.push(byte);
            self.pos += 1;

            // Check for delimiter match at end of buffer
            if !self.delimiter.is_empty() && self.buffer.ends_with(&self.delimiter) {
                let len = self.buffer.len() - self.delimiter.len();
                if len > 0 {
                    frames.push(self.take(len, false));
                }
                self.buffer.clear(); // Delimiter is consumed
                self.frame_start = self.pos;
            } else if self.buffer.len() >= self.max_length {
                // Force split on max length
                let len = self.buffer.len();
                frames.push(self.take(len, false));
                self.frame_start = self.pos;
            }
        }

        frames
    }

    fn flush(&mut self) -> Vec<SerialFrame> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let len = self.buffer.len();
        let frame = self.take(len, true);
        self.frame_start = self.pos;
        vec![frame]
    }
}

// =============================================================================
// SLIP Framer (RFC 1055)
// =============================================================================

struct SlipFramer {
    buffer: Vec<u8>,
    in_escape: bool,
    /// An escape in the current frame was not followed by ESC_END/ESC_ESC
    invalid: bool,
    pos: usize,
    frame_start: usize,
}

impl SlipFramer {
    fn new() -> Self {
        SlipFramer {
            buffer: Vec::new(),
            in_escape: false,
            invalid: false,
            pos: 0,
            frame_start: 0,
        }
    }

    /// Close the current frame. Zero-length frames are discarded.
    fn finish(&mut self, incomplete: bool) -> Option<SerialFrame> {
        let frame = (!self.buffer.is_empty()).then(|| SerialFrame {
            bytes: std::mem::take(&mut self.buffer),
            start: self.frame_start,
            incomplete,
            valid: !self.invalid,
            crc_valid: None,
        });
        self.invalid = false;
        self.in_escape = false;
        self.frame_start = self.pos;
        frame
    }

    /// Keep the stray escape byte in the frame and mark the frame invalid.
    fn bad_escape(&mut self) {
        self.buffer.push(SLIP_ESC);
        self.invalid = true;
        self.in_escape = false;
    }
}

impl FramerImpl for SlipFramer {
    fn feed(&mut self, data: &[u8]) -> Vec<SerialFrame> {
        let mut frames = Vec::new();

        for &byte in data {
            self.pos += 1;
            match byte {
                SLIP_END => {
                    if self.in_escape {
                        self.bad_escape();
                    }
                    frames.extend(self.finish(false));
                }
                SLIP_ESC => {
                    if self.in_escape {
                        self.bad_escape();
                    }
                    self.in_escape = true;
                }
                SLIP_ESC_END if self.in_escape => {
                    self.buffer.push(SLIP_END);
                    self.in_escape = false;
                }
                SLIP_ESC_ESC if self.in_escape => {
                    self.buffer.push(SLIP_ESC);
                    self.in_escape = false;
                }
                _ => {
                    if self.in_escape {
                        self.bad_escape();
                    }
                    self.buffer.push(byte);
                }
            }
        }

        frames
    }

    fn flush(&mut self) -> Vec<SerialFrame> {
        if self.in_escape {
            // Escape at end of stream
            self.bad_escape();
        }
        self.finish(true).into_iter().collect()
    }
}

// =============================================================================
// Modbus RTU Framer
// =============================================================================

struct ModbusRtuFramer {
    buffer: Vec<u8>,
    validate_crc: bool,
    /// Stream position of buffer[0]
    consumed: usize,
}

impl ModbusRtuFramer {
    fn new(validate_crc: bool) -> Self {
        ModbusRtuFramer {
            buffer: Vec::new(),
            validate_crc,
            consumed: 0,
        }
    }

    fn take(&mut self, len: usize, incomplete: bool, crc_valid: bool) -> SerialFrame {
        let bytes: Vec<u8> = self.buffer.drain(..len).collect();
        let frame = SerialFrame {
            bytes,
            start: self.consumed,
            incomplete,
            valid: crc_valid || !self.validate_crc,
            crc_valid: Some(crc_valid),
        };
        self.consumed += len;
        frame
    }

    /// Try to extract the next frame from the beginning of the buffer.
    /// Returns None when more bytes are needed to decide.
    fn next_frame(&mut self, at_end: bool) -> Option<SerialFrame> {
        if self.buffer.is_empty() {
            return None;
        }

        match modbus::match_frame(&self.buffer, at_end) {
            Match::Frame(len) => Some(self.take(len, false, true)),
            Match::NeedMore => None,
            Match::NoMatch => {
                let available = self.buffer.len();
                if !self.validate_crc {
                    match modbus::tolerated_length(&self.buffer, at_end) {
                        Match::Frame(len) => return Some(self.take(len, false, false)),
                        Match::NeedMore => return None,
                        Match::NoMatch => {}
                    }
                }
                // Skip ahead to where the next valid frame starts; the
                // skipped bytes become one rejected candidate.
                match modbus::resync_offset(&self.buffer) {
                    Some(skip) => Some(self.take(skip, false, false)),
                    None if !at_end && available < 2 * MAX_ADU => None,
                    None => {
                        let len = modbus::primary_length(&self.buffer).unwrap_or(available.min(MAX_ADU));
                        Some(self.take(len, at_end && len == available, false))
                    }
                }
            }
        }
    }
}

impl FramerImpl for ModbusRtuFramer {
    fn feed(&mut self, data: &[u8]) -> Vec<SerialFrame> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame(false) {
            frames.push(frame);
        }
        frames
    }

    fn flush(&mut self) -> Vec<SerialFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame(true) {
            frames.push(frame);
        }
        frames
    }
}

// =============================================================================
// Public SerialFramer
// =============================================================================

/// Stateful serial framer for streaming data.
/// Creates frames from raw bytes based on the specified framing mode.
pub struct SerialFramer {
    framer: Box<dyn FramerImpl + Send>,
}

impl SerialFramer {
    /// Create a new framer for the given mode
    pub fn new(mode: &FramingMode) -> Self {
        let framer: Box<dyn FramerImpl + Send> = match mode {
            FramingMode::Raw {
                delimiter,
                max_length,
            } => Box::new(RawFramer::new(delimiter.clone(), *max_length)),
            FramingMode::Slip => Box::new(SlipFramer::new()),
            FramingMode::ModbusRtu { validate_crc } => Box::new(ModbusRtuFramer::new(*validate_crc)),
        };

        SerialFramer { framer }
    }

    /// Feed raw bytes into the framer.
    /// Returns any complete frames that were parsed.
    pub fn feed(&mut self, data: &[u8]) -> Vec<SerialFrame> {
        self.framer.feed(data)
    }

    /// Flush any remaining buffered data. Call when the stream ends.
    pub fn flush(&mut self) -> Vec<SerialFrame> {
        self.framer.flush()
    }
}

/// Frame a complete byte sequence in one pass.
pub fn frame_all(mode: &FramingMode, data: &[u8]) -> Vec<SerialFrame> {
    let mut framer = SerialFramer::new(mode);
    let mut frames = framer.feed(data);
    frames.extend(framer.flush());
    frames
}

// =============================================================================
// Encoding Helpers
// =============================================================================

/// SLIP encode data (for transmission and test fixtures)
pub fn slip_encode(data: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(data.len() + 2);
    encoded.push(SLIP_END); // Start with END to flush any line noise

    for &byte in data {
        match byte {
            SLIP_END => encoded.extend_from_slice(&[SLIP_ESC, SLIP_ESC_END]),
            SLIP_ESC => encoded.extend_from_slice(&[SLIP_ESC, SLIP_ESC_ESC]),
            _ => encoded.push(byte),
        }
    }

    encoded.push(SLIP_END);
    encoded
}

/// Calculate and append CRC-16 Modbus to data
pub fn append_modbus_crc(data: &[u8]) -> Vec<u8> {
    let crc = crc16_modbus_checksum(data);
    let mut result = Vec::with_capacity(data.len() + 2);
    result.extend_from_slice(data);
    result.extend_from_slice(&crc.to_le_bytes()); // Low byte first
    result
}

/// Validate Modbus RTU frame CRC
pub fn validate_modbus_crc(frame: &[u8]) -> bool {
    modbus::crc_ok(frame)
}
