// src/buffers.rs
//
// Command surface for buffer management.
// Handles CSV import, binary capture import, buffer CRUD, pagination and the
// multi-buffer registry. Commands return plain error strings for the UI.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{
    buffer_query::TailResponse,
    buffer_store::{BufferFrameInfo, BufferItems, BufferKind, BufferMetadata, BufferRegistry, TimestampedByte},
    error::{BufferError, Result},
    io::{self, CsvImportOptions, FrameMessage, TaskHandle},
    settings::StoreSettings,
};

/// Bytes appended per registry write when importing a capture file
const BINARY_IMPORT_CHUNK: usize = 64 * 1024;

/// Response for paginated buffer frames
#[derive(Clone, Debug, serde::Serialize)]
pub struct PaginatedFramesResponse {
    pub frames: Vec<FrameMessage>,
    pub total_count: usize,
    pub offset: usize,
    pub limit: usize,
    /// 1-based original buffer position for each frame.
    /// Parallel to `frames`: `original_indices[i]` is the position of `frames[i]`.
    pub original_indices: Vec<usize>,
}

/// Response for paginated buffer bytes
#[derive(Clone, Debug, serde::Serialize)]
pub struct PaginatedBytesResponse {
    pub bytes: Vec<TimestampedByte>,
    pub total_count: usize,
    pub offset: usize,
    pub limit: usize,
    pub original_indices: Vec<usize>,
}

fn selected_set(selected_ids: Vec<u32>) -> HashSet<u32> {
    selected_ids.into_iter().collect()
}

fn active_buffer_id(registry: &BufferRegistry) -> std::result::Result<String, String> {
    registry
        .active_id()
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "No active buffer".to_string())
}

fn wrong_kind(id: &str, expected: BufferKind, actual: BufferKind) -> String {
    BufferError::WrongKind {
        id: id.to_string(),
        expected,
        actual,
    }
    .to_string()
}

// ============================================================================
// CSV Import Commands
// ============================================================================

pub type ImportHandle = TaskHandle<io::CsvImportSummary>;

/// Run a CSV import on the blocking pool. The returned handle can cancel it.
pub fn spawn_csv_import(registry: Arc<BufferRegistry>, path: PathBuf, options: CsvImportOptions) -> ImportHandle {
    TaskHandle::spawn(move |control| io::import_csv_file(&registry, &path, &options, control))
}

/// Preview a CSV file: read first N rows, detect headers, suggest column mappings
pub async fn preview_csv(
    settings: &StoreSettings,
    file_path: String,
    max_rows: Option<usize>,
) -> std::result::Result<io::CsvPreview, String> {
    let max = max_rows.unwrap_or(settings.preview_rows);
    io::preview_csv_file(Path::new(&file_path), max).map_err(|e| e.to_string())
}

/// Import a CSV file with user-provided column mappings into a new frame buffer
pub async fn import_csv_with_mapping(
    registry: &Arc<BufferRegistry>,
    file_path: String,
    mappings: Vec<io::CsvColumnMapping>,
    skip_first_row: bool,
    timestamp_unit: io::TimestampUnit,
    negate_timestamps: bool,
) -> std::result::Result<io::CsvImportSummary, String> {
    let options = CsvImportOptions {
        mappings,
        skip_first_row,
        timestamp_unit,
        negate_timestamps,
    };
    spawn_csv_import(Arc::clone(registry), PathBuf::from(file_path), options)
        .join()
        .await
        .map_err(|e| e.to_string())
}

// ============================================================================
// Binary Capture Import
// ============================================================================

/// Load a raw capture file into a new byte buffer. Byte `i` is stamped
/// `start_time_us + i * byte_interval_us`.
pub fn import_binary_file(
    registry: &BufferRegistry,
    path: &Path,
    bus: Option<u8>,
    start_time_us: u64,
    byte_interval_us: u64,
) -> Result<BufferMetadata> {
    let data = std::fs::read(path).map_err(|e| BufferError::File {
        path: path.display().to_string(),
        message: format!("Failed to read capture file: {}", e),
    })?;
    if data.is_empty() {
        return Err(BufferError::Empty(format!("{:?} is empty", path)));
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "capture.bin".to_string());
    let created = registry.create(BufferKind::Bytes, name)?;

    let mut metadata = created.clone();
    for (chunk_index, chunk) in data.chunks(BINARY_IMPORT_CHUNK).enumerate() {
        let base = (chunk_index * BINARY_IMPORT_CHUNK) as u64;
        let bytes: Vec<TimestampedByte> = chunk
            .iter()
            .enumerate()
            .map(|(i, &byte)| TimestampedByte {
                byte,
                timestamp_us: start_time_us.saturating_add((base + i as u64).saturating_mul(byte_interval_us)),
                bus,
            })
            .collect();
        metadata = registry.append_bytes(&created.id, bytes).map_err(|e| {
            if e.is_not_found() {
                BufferError::Discarded { id: created.id.clone() }
            } else {
                e
            }
        })?;
    }

    tracing::info!("[buffers] Imported {} bytes from {:?} into '{}'", data.len(), path, metadata.id);
    Ok(metadata)
}

/// Import a raw capture file into a new byte buffer
pub async fn import_binary_to_buffer(
    registry: &Arc<BufferRegistry>,
    file_path: String,
    bus: Option<u8>,
    start_time_us: Option<u64>,
    byte_interval_us: Option<u64>,
) -> std::result::Result<BufferMetadata, String> {
    let registry = Arc::clone(registry);
    tokio::task::spawn_blocking(move || {
        import_binary_file(
            &registry,
            Path::new(&file_path),
            bus,
            start_time_us.unwrap_or(0),
            byte_interval_us.unwrap_or(1),
        )
    })
    .await
    .map_err(|e| e.to_string())?
    .map_err(|e| e.to_string())
}

// ============================================================================
// Active Buffer Commands (Legacy Single-Buffer API)
// ============================================================================

/// Get the active buffer metadata (if any)
pub async fn get_buffer_metadata(registry: &BufferRegistry) -> std::result::Result<Option<BufferMetadata>, String> {
    registry.active_metadata().map_err(|e| e.to_string())
}

/// Set a specific buffer as active (for legacy single-buffer compatibility)
pub async fn set_active_buffer(registry: &BufferRegistry, buffer_id: String) -> std::result::Result<(), String> {
    registry.set_active(&buffer_id).map_err(|e| e.to_string())
}

/// Get the most recent N frames from the active buffer, optionally filtered by frame IDs.
/// Used for "tail mode" during streaming - shows latest frames without frontend accumulation.
pub async fn get_buffer_frames_tail(
    registry: &BufferRegistry,
    limit: usize,
    selected_ids: Vec<u32>,
) -> std::result::Result<TailResponse, String> {
    let buffer_id = active_buffer_id(registry)?;
    registry
        .tail(&buffer_id, limit, &selected_set(selected_ids))
        .map_err(|e| e.to_string())
}

/// Get a page of frames from the active buffer, filtered by selected frame IDs
pub async fn get_buffer_frames_paginated_filtered(
    registry: &BufferRegistry,
    offset: usize,
    limit: usize,
    selected_ids: Vec<u32>,
) -> std::result::Result<PaginatedFramesResponse, String> {
    let buffer_id = active_buffer_id(registry)?;
    let page = registry
        .page_filtered(&buffer_id, offset, limit, &selected_set(selected_ids))
        .map_err(|e| e.to_string())?;
    match page.items {
        BufferItems::Frames(frames) => Ok(PaginatedFramesResponse {
            frames,
            total_count: page.total_count,
            offset,
            limit,
            original_indices: page.original_indices,
        }),
        BufferItems::Bytes(_) => Err(wrong_kind(&buffer_id, BufferKind::Frames, BufferKind::Bytes)),
    }
}

/// Get unique frame IDs and their metadata from the active buffer.
/// Used to build the frame picker after a large ingest
pub async fn get_buffer_frame_info(registry: &BufferRegistry) -> std::result::Result<Vec<BufferFrameInfo>, String> {
    let buffer_id = active_buffer_id(registry)?;
    registry.frame_info(&buffer_id).map_err(|e| e.to_string())
}

/// Find the offset in the filtered view of a buffer for a given timestamp.
/// Used for timeline scrubber navigation in buffer mode
pub async fn find_buffer_offset_for_timestamp(
    registry: &BufferRegistry,
    buffer_id: Option<String>,
    timestamp_us: u64,
    selected_ids: Vec<u32>,
) -> std::result::Result<usize, String> {
    let buffer_id = match buffer_id {
        Some(id) => id,
        None => active_buffer_id(registry)?,
    };
    registry
        .find_offset_for_timestamp(&buffer_id, timestamp_us, &selected_set(selected_ids))
        .map_err(|e| e.to_string())
}

// ============================================================================
// Multi-Buffer Registry Commands
// ============================================================================

/// Create an empty buffer
pub async fn create_buffer(
    registry: &BufferRegistry,
    kind: BufferKind,
    name: String,
) -> std::result::Result<BufferMetadata, String> {
    registry.create(kind, name).map_err(|e| e.to_string())
}

/// List all buffers in the registry
pub async fn list_buffers(registry: &BufferRegistry) -> std::result::Result<Vec<BufferMetadata>, String> {
    registry.list().map_err(|e| e.to_string())
}

/// Delete a specific buffer by ID
pub async fn delete_buffer(registry: &BufferRegistry, buffer_id: String) -> std::result::Result<(), String> {
    registry.delete(&buffer_id).map_err(|e| e.to_string())
}

/// Delete every buffer
pub async fn clear_buffers(registry: &BufferRegistry) -> std::result::Result<(), String> {
    registry.clear_all().map_err(|e| e.to_string())
}

/// Get metadata for a specific buffer by ID
pub async fn get_buffer_metadata_by_id(
    registry: &BufferRegistry,
    buffer_id: String,
) -> std::result::Result<Option<BufferMetadata>, String> {
    registry.get_metadata(&buffer_id).map_err(|e| e.to_string())
}

/// Append frames or bytes to a buffer
pub async fn append_to_buffer(
    registry: &BufferRegistry,
    buffer_id: String,
    items: BufferItems,
) -> std::result::Result<BufferMetadata, String> {
    registry.append(&buffer_id, items).map_err(|e| e.to_string())
}

/// Create a new frame buffer from frames passed from the frontend.
/// Used when accepting client-side framing to persist the framed data.
pub async fn create_frame_buffer_from_frames(
    registry: &BufferRegistry,
    name: String,
    frames: Vec<FrameMessage>,
) -> std::result::Result<BufferMetadata, String> {
    if frames.is_empty() {
        return Err("No frames to create buffer from".to_string());
    }
    registry.create_frames(name, frames).map_err(|e| e.to_string())
}

/// Duplicate a buffer into a new, unowned buffer
pub async fn copy_buffer(
    registry: &BufferRegistry,
    buffer_id: String,
    new_name: String,
) -> std::result::Result<BufferMetadata, String> {
    registry.copy_buffer(&buffer_id, new_name).map_err(|e| e.to_string())
}

/// Get a page of frames from a specific buffer by ID
pub async fn get_buffer_frames_paginated_by_id(
    registry: &BufferRegistry,
    buffer_id: String,
    offset: usize,
    limit: usize,
) -> std::result::Result<PaginatedFramesResponse, String> {
    let page = registry.page(&buffer_id, offset, limit).map_err(|e| e.to_string())?;
    match page.items {
        BufferItems::Frames(frames) => Ok(PaginatedFramesResponse {
            frames,
            total_count: page.total_count,
            offset,
            limit,
            original_indices: page.original_indices,
        }),
        BufferItems::Bytes(_) => Err(wrong_kind(&buffer_id, BufferKind::Frames, BufferKind::Bytes)),
    }
}

// ============================================================================
// Byte Buffer Commands (Serial Discovery)
// ============================================================================

/// Get bytes from a specific buffer by ID with pagination
pub async fn get_buffer_bytes_paginated_by_id(
    registry: &BufferRegistry,
    buffer_id: String,
    offset: usize,
    limit: usize,
) -> std::result::Result<PaginatedBytesResponse, String> {
    let page = registry.page(&buffer_id, offset, limit).map_err(|e| e.to_string())?;
    match page.items {
        BufferItems::Bytes(bytes) => Ok(PaginatedBytesResponse {
            bytes,
            total_count: page.total_count,
            offset,
            limit,
            original_indices: page.original_indices,
        }),
        BufferItems::Frames(_) => Err(wrong_kind(&buffer_id, BufferKind::Bytes, BufferKind::Frames)),
    }
}

/// Find the byte offset at or after the given timestamp in a byte buffer.
/// Uses binary search for O(log n) performance.
pub async fn find_buffer_bytes_offset_for_timestamp(
    registry: &BufferRegistry,
    buffer_id: String,
    target_time_us: u64,
) -> std::result::Result<usize, String> {
    let meta = registry.metadata(&buffer_id).map_err(|e| e.to_string())?;
    if meta.kind != BufferKind::Bytes {
        return Err(wrong_kind(&buffer_id, BufferKind::Bytes, meta.kind));
    }
    registry
        .find_offset_for_timestamp(&buffer_id, target_time_us, &HashSet::new())
        .map_err(|e| e.to_string())
}

// ============================================================================
// Session-Aware Buffer Commands
// ============================================================================

/// List only orphaned buffers (no owning session).
/// These are buffers available for standalone selection in the IO picker.
/// Includes CSV imports and buffers from destroyed sessions.
pub async fn list_orphaned_buffers(registry: &BufferRegistry) -> std::result::Result<Vec<BufferMetadata>, String> {
    registry.list_orphaned().map_err(|e| e.to_string())
}

/// Release every buffer owned by a session that is going away
pub async fn orphan_session_buffers(
    registry: &BufferRegistry,
    session_id: String,
) -> std::result::Result<Vec<crate::buffer_store::OrphanedBufferInfo>, String> {
    registry.orphan_all_for_session(&session_id).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn frame(frame_id: u32, timestamp_us: u64) -> FrameMessage {
        let mut f = FrameMessage::serial(vec![frame_id as u8], timestamp_us, None);
        f.protocol = "can".to_string();
        f.frame_id = frame_id;
        f
    }

    fn temp_file(content: &[u8], suffix: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content).unwrap();
        file
    }

    // ========================================================================
    // Binary Import
    // ========================================================================

    #[test]
    fn test_binary_import_stamps_bytes() {
        let file = temp_file(&[0xC0, 0x01, 0xC0], ".bin");
        let registry = BufferRegistry::in_memory().unwrap();
        let meta = import_binary_file(&registry, file.path(), Some(2), 1_000, 100).unwrap();

        assert_eq!(meta.kind, BufferKind::Bytes);
        assert_eq!(meta.count, 3);
        assert_eq!(meta.start_time_us, Some(1_000));
        assert_eq!(meta.end_time_us, Some(1_200));
        let bytes = registry.all_bytes(&meta.id).unwrap();
        assert!(bytes.iter().all(|b| b.bus == Some(2)));
    }

    #[test]
    fn test_binary_import_empty_file_creates_nothing() {
        let file = temp_file(&[], ".bin");
        let registry = BufferRegistry::in_memory().unwrap();
        assert!(matches!(
            import_binary_file(&registry, file.path(), None, 0, 1),
            Err(BufferError::Empty(_))
        ));
        assert!(registry.list().unwrap().is_empty());
    }

    // ========================================================================
    // Commands
    // ========================================================================

    #[tokio::test]
    async fn test_csv_preview_then_import() {
        let file = temp_file(b"time,id,data\n1000,0x10,0102\n2000,0x20,0304\n3000,0x10,0506\n", ".csv");
        let registry = Arc::new(BufferRegistry::in_memory().unwrap());
        let path = file.path().to_string_lossy().into_owned();

        let preview = preview_csv(&StoreSettings::default(), path.clone(), None).await.unwrap();
        assert!(preview.has_header);

        let options = CsvImportOptions::from_preview(&preview);
        let summary = import_csv_with_mapping(
            &registry,
            path,
            options.mappings,
            options.skip_first_row,
            options.timestamp_unit,
            options.negate_timestamps,
        )
        .await
        .unwrap();

        assert_eq!(summary.metadata.count, 3);
        assert_eq!(summary.skipped_rows, 0);
        assert_eq!(list_orphaned_buffers(&registry).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_active_buffer_commands() {
        let registry = BufferRegistry::in_memory().unwrap();
        assert!(get_buffer_frames_tail(&registry, 10, vec![]).await.is_err());

        let meta = create_frame_buffer_from_frames(&registry, "f".to_string(), vec![frame(1, 10), frame(2, 20), frame(1, 30)])
            .await
            .unwrap();
        set_active_buffer(&registry, meta.id.clone()).await.unwrap();

        let tail = get_buffer_frames_tail(&registry, 1, vec![1]).await.unwrap();
        assert_eq!(tail.original_indices, vec![3]);
        assert_eq!(tail.total_filtered_count, 2);

        let page = get_buffer_frames_paginated_filtered(&registry, 0, 10, vec![2]).await.unwrap();
        assert_eq!(page.original_indices, vec![2]);

        let offset = find_buffer_offset_for_timestamp(&registry, None, 25, vec![]).await.unwrap();
        assert_eq!(offset, 2);

        delete_buffer(&registry, meta.id).await.unwrap();
        assert_eq!(get_buffer_metadata(&registry).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_kind_checked_pagination() {
        let registry = BufferRegistry::in_memory().unwrap();
        let bytes = create_buffer(&registry, BufferKind::Bytes, "b".to_string()).await.unwrap();
        append_to_buffer(
            &registry,
            bytes.id.clone(),
            BufferItems::Bytes(vec![TimestampedByte {
                byte: 1,
                timestamp_us: 5,
                bus: None,
            }]),
        )
        .await
        .unwrap();

        let page = get_buffer_bytes_paginated_by_id(&registry, bytes.id.clone(), 0, 10).await.unwrap();
        assert_eq!(page.bytes.len(), 1);
        assert_eq!(page.original_indices, vec![1]);

        let err = get_buffer_frames_paginated_by_id(&registry, bytes.id.clone(), 0, 10)
            .await
            .unwrap_err();
        assert!(err.contains("bytes buffer"));
        assert_eq!(
            find_buffer_bytes_offset_for_timestamp(&registry, bytes.id, 6).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_orphan_session_keeps_data() {
        let registry = BufferRegistry::in_memory().unwrap();
        let meta = registry
            .start_stream(BufferKind::Frames, "live", Some("session-a"))
            .unwrap();
        registry
            .append_to_stream(BufferItems::Frames(vec![frame(7, 1)]))
            .unwrap();
        assert!(list_orphaned_buffers(&registry).await.unwrap().is_empty());

        let orphaned = orphan_session_buffers(&registry, "session-a".to_string()).await.unwrap();
        assert_eq!(orphaned.len(), 1);
        assert_eq!(orphaned[0].buffer_id, meta.id);
        assert_eq!(registry.metadata(&meta.id).unwrap().count, 1);
        assert_eq!(list_orphaned_buffers(&registry).await.unwrap().len(), 1);
    }
}
