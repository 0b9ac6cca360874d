// src/framing.rs
//
// Framing engine and its commands.
// Converts a byte buffer into structured frames using raw, SLIP or Modbus RTU
// framing, optionally per interface, and writes the result into a frame buffer.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::buffer_store::{BufferKind, BufferRegistry, TimestampedByte};
use crate::error::{BufferError, Result};
use crate::io::serial::{extract_byte_index, ByteIndexConfig, FramingMode, SerialFrame, SerialFramer};
use crate::io::{FrameMessage, TaskControl, TaskHandle};
use crate::settings::StoreSettings;

/// Bytes fed to a framer between cancellation checks
const FEED_CHUNK: usize = 4096;

// ============================================================================
// Configuration (wire form)
// ============================================================================

/// Framing mode as supplied by callers: delimiter as hex, optional limits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FramingModeConfig {
    Raw {
        /// Delimiter bytes as hex string (e.g., "0D0A"); unset = fixed-size chunks
        #[serde(default)]
        delimiter: Option<String>,
        /// Max frame length before forced split
        #[serde(default)]
        max_length: Option<usize>,
    },
    Slip,
    ModbusRtu {
        #[serde(default = "default_validate_crc")]
        validate_crc: bool,
    },
}

fn default_validate_crc() -> bool {
    true
}

/// Configuration for backend framing
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendFramingConfig {
    /// Default framing mode
    #[serde(flatten)]
    pub mode: FramingModeConfig,
    /// Minimum frame length to accept (shorter frames are filtered)
    #[serde(default)]
    pub min_length: Option<usize>,
    /// Frame ID extraction config
    #[serde(default)]
    pub frame_id_config: Option<ByteIndexConfig>,
    /// Source address extraction config
    #[serde(default)]
    pub source_address_config: Option<ByteIndexConfig>,
    /// Per-interface framing overrides, keyed by bus number ("0", "1", ...)
    #[serde(default)]
    pub per_interface: Option<HashMap<String, FramingModeConfig>>,
    /// Write filtered frames to a secondary buffer
    #[serde(default)]
    pub keep_filtered: Option<bool>,
}

impl FramingModeConfig {
    fn resolve(&self, field: &str, raw_max_length: usize) -> Result<FramingMode> {
        match self {
            FramingModeConfig::Slip => Ok(FramingMode::Slip),
            FramingModeConfig::ModbusRtu { validate_crc } => Ok(FramingMode::ModbusRtu {
                validate_crc: *validate_crc,
            }),
            FramingModeConfig::Raw {
                delimiter,
                max_length,
            } => {
                let delimiter = match delimiter.as_deref().map(str::trim) {
                    None | Some("") => None,
                    Some(hex_str) => Some(hex::decode(hex_str).map_err(|e| {
                        BufferError::config(&format!("{}.delimiter", field), format!("'{}' is not hex: {}", hex_str, e))
                    })?),
                };
                Ok(FramingMode::Raw {
                    delimiter,
                    max_length: max_length.unwrap_or(raw_max_length),
                })
            }
        }
    }
}

impl BackendFramingConfig {
    /// Decode hex delimiters and fill unset options from settings.
    pub fn resolve(&self, settings: &StoreSettings) -> Result<FramingConfig> {
        let mut per_interface = HashMap::new();
        for (key, mode) in self.per_interface.iter().flatten() {
            let field = format!("per_interface.{}", key);
            let bus: u8 = key
                .trim()
                .parse()
                .map_err(|_| BufferError::config(&field, format!("'{}' is not a bus number", key)))?;
            per_interface.insert(bus, mode.resolve(&field, settings.raw_max_length)?);
        }

        let config = FramingConfig {
            mode: self.mode.resolve("framing", settings.raw_max_length)?,
            min_length: self.min_length.unwrap_or(settings.default_min_length),
            frame_id_config: self.frame_id_config.clone(),
            source_address_config: self.source_address_config.clone(),
            per_interface,
            keep_filtered: self.keep_filtered.unwrap_or(settings.keep_filtered),
        };
        config.validate()?;
        Ok(config)
    }
}

// ============================================================================
// Configuration (resolved)
// ============================================================================

/// Fully resolved framing configuration
#[derive(Clone, Debug, PartialEq)]
pub struct FramingConfig {
    pub mode: FramingMode,
    pub min_length: usize,
    pub frame_id_config: Option<ByteIndexConfig>,
    pub source_address_config: Option<ByteIndexConfig>,
    /// Bus number -> mode override
    pub per_interface: HashMap<u8, FramingMode>,
    pub keep_filtered: bool,
}

impl FramingConfig {
    pub fn new(mode: FramingMode) -> Self {
        Self {
            mode,
            min_length: 1,
            frame_id_config: None,
            source_address_config: None,
            per_interface: HashMap::new(),
            keep_filtered: true,
        }
    }

    /// Mode for one interface: its override if present, else the default.
    pub fn mode_for(&self, bus: Option<u8>) -> &FramingMode {
        bus.and_then(|b| self.per_interface.get(&b)).unwrap_or(&self.mode)
    }

    /// Reject configurations that can never work, before any byte is framed.
    pub fn validate(&self) -> Result<()> {
        if let Some(cfg) = &self.frame_id_config {
            cfg.validate("frame_id_config")?;
        }
        if let Some(cfg) = &self.source_address_config {
            cfg.validate("source_address_config")?;
        }
        let mut modes: Vec<(String, &FramingMode)> = vec![("framing".to_string(), &self.mode)];
        modes.extend(self.per_interface.iter().map(|(bus, m)| (format!("per_interface.{}", bus), m)));
        for (field, mode) in modes {
            if let FramingMode::Raw { max_length: 0, .. } = mode {
                return Err(BufferError::config(&format!("{}.max_length", field), "must be at least 1"));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Framing Engine
// ============================================================================

/// Frames cut from a byte buffer, split into accepted and filtered.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FramedStream {
    pub frames: Vec<FrameMessage>,
    /// Too short, failed CRC (when validating) or invalid SLIP escapes
    pub filtered: Vec<FrameMessage>,
}

/// Result from a framing operation
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FramingResult {
    /// Number of frames extracted
    pub frame_count: usize,
    /// ID of the frame buffer holding the result
    pub buffer_id: String,
    /// Number of frames excluded by min_length or integrity checks
    pub filtered_count: usize,
    /// ID of the filtered frames buffer
    pub filtered_buffer_id: Option<String>,
}

/// Delimit a byte sequence into frames. Each interface (bus) is framed as its
/// own stream so bytes from different interfaces never mix; results are
/// ordered by the position of their first byte.
pub fn frame_bytes(bytes: &[TimestampedByte], config: &FramingConfig, control: &TaskControl) -> Result<FramedStream> {
    config.validate()?;

    // Group byte positions by bus/interface
    let mut by_bus: BTreeMap<Option<u8>, Vec<usize>> = BTreeMap::new();
    for (i, byte) in bytes.iter().enumerate() {
        by_bus.entry(byte.bus).or_default().push(i);
    }

    // (first byte index in `bytes`, bus, frame)
    let mut cut: Vec<(usize, Option<u8>, SerialFrame)> = Vec::new();
    let mut done = 0u64;

    for (bus, positions) in &by_bus {
        let stream: Vec<u8> = positions.iter().map(|&i| bytes[i].byte).collect();
        let mut framer = SerialFramer::new(config.mode_for(*bus));
        let origin = |frame: &SerialFrame| positions.get(frame.start).or(positions.last()).copied().unwrap_or(0);

        for chunk in stream.chunks(FEED_CHUNK) {
            control.check()?;
            for frame in framer.feed(chunk) {
                cut.push((origin(&frame), *bus, frame));
            }
            done += chunk.len() as u64;
            control.set_progress(done);
        }
        for frame in framer.flush() {
            cut.push((origin(&frame), *bus, frame));
        }
    }

    // Sort frames by their start index (original byte order)
    cut.sort_by_key(|(start, _, _)| *start);

    let mut framed = FramedStream::default();
    for (seq, (start, bus, frame)) in cut.into_iter().enumerate() {
        let rejected = !frame.valid || frame.bytes.len() < config.min_length;
        let message = to_message(seq, bytes[start].timestamp_us, bus, frame, config);
        if rejected {
            framed.filtered.push(message);
        } else {
            framed.frames.push(message);
        }
    }
    Ok(framed)
}

fn to_message(seq: usize, timestamp_us: u64, bus: Option<u8>, frame: SerialFrame, config: &FramingConfig) -> FrameMessage {
    let mut unresolved = false;

    let frame_id = match &config.frame_id_config {
        Some(id_config) => extract_byte_index(&frame.bytes, id_config).unwrap_or_else(|| {
            unresolved = true;
            0
        }),
        None => seq as u32,
    };

    let source_address = config.source_address_config.as_ref().and_then(|src_config| {
        let value = extract_byte_index(&frame.bytes, src_config);
        unresolved |= value.is_none();
        value.map(|v| v as u16)
    });

    let mut message = FrameMessage::serial(frame.bytes, timestamp_us, bus);
    message.frame_id = frame_id;
    message.source_address = source_address;
    message.incomplete = frame.incomplete.then_some(true);
    message.crc_valid = frame.crc_valid;
    message.id_unresolved = unresolved.then_some(true);
    message
}

/// Reuse targets as they stood when framing started.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ReuseTargets {
    pub(crate) frames: Option<String>,
    pub(crate) filtered: Option<String>,
}

impl ReuseTargets {
    /// Keep each requested target only if it currently exists as a frame buffer.
    pub(crate) fn resolve(registry: &BufferRegistry, frames: Option<&str>, filtered: Option<&str>) -> Result<Self> {
        Ok(Self {
            frames: reusable(registry, frames)?,
            filtered: reusable(registry, filtered)?,
        })
    }
}

fn reusable(registry: &BufferRegistry, id: Option<&str>) -> Result<Option<String>> {
    let Some(id) = id else {
        return Ok(None);
    };
    Ok(registry
        .get_metadata(id)?
        .filter(|meta| meta.kind == BufferKind::Frames)
        .map(|meta| meta.id))
}

/// Frame a byte buffer and store the result.
///
/// With `reuse_buffer_id` naming an existing frame buffer, that buffer's
/// contents are replaced (id and owner kept); otherwise a new buffer is
/// created. Nothing is written until framing has fully succeeded, and the
/// result is discarded if the source or a reuse target is deleted meanwhile.
pub fn apply_framing(
    registry: &BufferRegistry,
    source_id: &str,
    config: &FramingConfig,
    reuse_buffer_id: Option<&str>,
    reuse_filtered_buffer_id: Option<&str>,
    control: &TaskControl,
) -> Result<FramingResult> {
    let targets = ReuseTargets::resolve(registry, reuse_buffer_id, reuse_filtered_buffer_id)?;
    let framed = frame_source(registry, source_id, config, control)?;
    store_framed(registry, source_id, &targets, framed, config.keep_filtered)
}

/// Read and frame the whole source buffer.
pub(crate) fn frame_source(
    registry: &BufferRegistry,
    source_id: &str,
    config: &FramingConfig,
    control: &TaskControl,
) -> Result<FramedStream> {
    let bytes = registry.all_bytes(source_id)?;
    if bytes.is_empty() {
        return Err(BufferError::Empty(format!("Buffer '{}' has no bytes to frame", source_id)));
    }
    let framed = frame_bytes(&bytes, config, control)?;
    control.check()?;
    Ok(framed)
}

/// Write a framing result into its target buffers.
pub(crate) fn store_framed(
    registry: &BufferRegistry,
    source_id: &str,
    targets: &ReuseTargets,
    framed: FramedStream,
    keep_filtered: bool,
) -> Result<FramingResult> {
    // Source or reuse target deleted while framing: drop the result
    let watched = std::iter::once(source_id)
        .chain(targets.frames.as_deref())
        .chain(targets.filtered.as_deref());
    for id in watched {
        if registry.get_metadata(id)?.is_none() {
            tracing::info!("[framing] '{}' was deleted, discarding result for '{}'", id, source_id);
            return Err(BufferError::Discarded { id: id.to_string() });
        }
    }

    let frame_count = framed.frames.len();
    let filtered_count = framed.filtered.len();

    let buffer_id = store_frames(
        registry,
        targets.frames.as_deref(),
        format!("Framed from {}", source_id),
        framed.frames,
    )?;

    let filtered_buffer_id = if keep_filtered && (filtered_count > 0 || targets.filtered.is_some()) {
        let stored = store_frames(
            registry,
            targets.filtered.as_deref(),
            format!("Filtered from {}", source_id),
            framed.filtered,
        );
        match stored {
            Ok(id) => Some(id),
            Err(e) => {
                // Leave no half-written result behind
                if targets.frames.is_none() {
                    if let Err(del) = registry.delete(&buffer_id) {
                        tracing::warn!("[framing] Failed to remove '{}': {}", buffer_id, del);
                    }
                }
                return Err(e);
            }
        }
    } else {
        None
    };

    tracing::info!(
        "[framing] '{}' -> '{}': {} frames, {} filtered",
        source_id,
        buffer_id,
        frame_count,
        filtered_count
    );

    Ok(FramingResult {
        frame_count,
        buffer_id,
        filtered_count,
        filtered_buffer_id,
    })
}

/// Replace the target's frames, or create a new buffer already holding them.
fn store_frames(registry: &BufferRegistry, target: Option<&str>, name: String, frames: Vec<FrameMessage>) -> Result<String> {
    match target {
        Some(id) => registry.replace_frames(id, frames).map(|meta| meta.id).map_err(|e| {
            if e.is_not_found() {
                BufferError::Discarded { id: id.to_string() }
            } else {
                e
            }
        }),
        None => registry.create_frames(name, frames).map(|meta| meta.id),
    }
}

// ============================================================================
// Commands
// ============================================================================

pub type FramingHandle = TaskHandle<FramingResult>;

/// Run framing on the blocking pool. The returned handle can cancel it.
pub fn spawn_framing(
    registry: Arc<BufferRegistry>,
    source_id: String,
    config: FramingConfig,
    reuse_buffer_id: Option<String>,
    reuse_filtered_buffer_id: Option<String>,
) -> FramingHandle {
    TaskHandle::spawn(move |control| {
        apply_framing(
            &registry,
            &source_id,
            &config,
            reuse_buffer_id.as_deref(),
            reuse_filtered_buffer_id.as_deref(),
            control,
        )
    })
}

/// Apply framing to a byte buffer (the active buffer when `buffer_id` is None).
/// If `reuse_buffer_id` is provided and valid, that buffer is cleared and reused,
/// which avoids buffer proliferation while a user tunes framing on a live capture.
pub async fn apply_framing_to_buffer(
    registry: &Arc<BufferRegistry>,
    settings: &StoreSettings,
    buffer_id: Option<String>,
    config: BackendFramingConfig,
    reuse_buffer_id: Option<String>,
    reuse_filtered_buffer_id: Option<String>,
) -> std::result::Result<FramingResult, String> {
    let source_id = match buffer_id {
        Some(id) => id,
        None => registry
            .active_id()
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "No active buffer".to_string())?,
    };
    let config = config.resolve(settings).map_err(|e| e.to_string())?;

    spawn_framing(
        Arc::clone(registry),
        source_id,
        config,
        reuse_buffer_id,
        reuse_filtered_buffer_id,
    )
    .join()
    .await
    .map_err(|e| e.to_string())
}
