// src/buffer_store.rs
//
// Multi-buffer registry for storing captured data.
// Metadata lives in RAM; bulk frame/byte data lives in SQLite (buffer_db).
// Supports multiple named buffers, each typed as either Frames or Bytes.
//
// Locking: every mutation holds the registry write lock across its SQLite
// write, and every read holds the read lock across its SQLite query, so a
// reader never sees a count that disagrees with the stored rows. Lock order
// is state -> filter cache -> database.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::buffer_db::BufferDb;
use crate::buffer_query::FilterIndexCache;
use crate::error::{BufferError, Result};
use crate::io::FrameMessage;
use crate::settings::StoreSettings;

// ============================================================================
// Types
// ============================================================================

/// Buffer kind - determines what kind of data the buffer contains
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BufferKind {
    /// CAN frames, framed serial messages
    Frames,
    /// Raw serial bytes (unframed)
    Bytes,
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferKind::Frames => write!(f, "frames"),
            BufferKind::Bytes => write!(f, "bytes"),
        }
    }
}

/// Timestamped byte for raw serial data
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampedByte {
    /// The byte value
    pub byte: u8,
    /// Timestamp in microseconds
    pub timestamp_us: u64,
    /// Bus/interface number (for multi-source sessions)
    #[serde(default)]
    pub bus: Option<u8>,
}

/// Metadata about a buffer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BufferMetadata {
    /// Unique buffer ID (e.g., "buf_1", "buf_2")
    pub id: String,
    pub kind: BufferKind,
    /// Display name (e.g., "GVRET 10:30am", "Serial dump")
    pub name: String,
    /// Number of items (frames or bytes depending on kind)
    pub count: usize,
    /// Timestamp of first item (microseconds)
    pub start_time_us: Option<u64>,
    /// Timestamp of last item (microseconds)
    pub end_time_us: Option<u64>,
    /// When the buffer was created (Unix timestamp in seconds)
    pub created_at: u64,
    /// Whether this buffer is the live streaming target
    #[serde(default)]
    pub is_streaming: bool,
    /// Session ID that owns this buffer (None = orphaned, available for standalone use).
    /// When a session is destroyed, the buffer is orphaned, never deleted.
    #[serde(default)]
    pub owning_session_id: Option<String>,
}

/// Items handed to or returned from a buffer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "items", rename_all = "snake_case")]
pub enum BufferItems {
    Frames(Vec<FrameMessage>),
    Bytes(Vec<TimestampedByte>),
}

impl BufferItems {
    pub fn kind(&self) -> BufferKind {
        match self {
            BufferItems::Frames(_) => BufferKind::Frames,
            BufferItems::Bytes(_) => BufferKind::Bytes,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BufferItems::Frames(f) => f.len(),
            BufferItems::Bytes(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn first_timestamp(&self) -> Option<u64> {
        match self {
            BufferItems::Frames(f) => f.first().map(|f| f.timestamp_us),
            BufferItems::Bytes(b) => b.first().map(|b| b.timestamp_us),
        }
    }

    fn last_timestamp(&self) -> Option<u64> {
        match self {
            BufferItems::Frames(f) => f.last().map(|f| f.timestamp_us),
            BufferItems::Bytes(b) => b.last().map(|b| b.timestamp_us),
        }
    }
}

/// Info about an orphaned buffer for event emission
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OrphanedBufferInfo {
    pub buffer_id: String,
    pub buffer_name: String,
    pub kind: BufferKind,
    pub count: usize,
}

/// Per-id summary of a frame buffer, for building id pickers
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BufferFrameInfo {
    pub frame_id: u32,
    pub max_dlc: u16,
    pub bus: Option<u8>,
    pub is_extended: bool,
    pub has_dlc_mismatch: bool,
    pub count: usize,
}

// ============================================================================
// Internal Types
// ============================================================================

/// A named buffer. Metadata only, data lives in SQLite.
pub(crate) struct NamedBuffer {
    pub(crate) metadata: BufferMetadata,
    /// Bumped whenever contents are replaced rather than extended
    pub(crate) generation: u64,
}

pub(crate) struct RegistryState {
    /// All buffers indexed by ID
    pub(crate) buffers: HashMap<String, NamedBuffer>,
    /// Legacy single-buffer pointer (for viewing/operating on)
    active_id: Option<String>,
    /// ID of the buffer currently being streamed to (separate from active_id)
    pub(crate) streaming_id: Option<String>,
    /// Counter for generating unique buffer IDs
    next_id: u32,
}

/// What `list` last logged (reduces log spam)
#[derive(Default)]
struct ListLogState {
    streaming_id: Option<String>,
    buffer_count: usize,
}

impl Default for RegistryState {
    fn default() -> Self {
        Self {
            buffers: HashMap::new(),
            active_id: None,
            streaming_id: None,
            next_id: 1,
        }
    }
}

impl RegistryState {
    /// Metadata with `is_streaming` resolved against the current streaming target.
    pub(crate) fn snapshot(&self, buffer: &NamedBuffer) -> BufferMetadata {
        let mut meta = buffer.metadata.clone();
        meta.is_streaming = self.streaming_id.as_deref() == Some(meta.id.as_str());
        meta
    }

    pub(crate) fn get(&self, id: &str) -> Result<&NamedBuffer> {
        self.buffers.get(id).ok_or_else(|| BufferError::not_found(id))
    }

    pub(crate) fn get_kind(&self, id: &str, expected: BufferKind) -> Result<&NamedBuffer> {
        let buffer = self.get(id)?;
        if buffer.metadata.kind != expected {
            return Err(BufferError::WrongKind {
                id: id.to_string(),
                expected,
                actual: buffer.metadata.kind,
            });
        }
        Ok(buffer)
    }

    fn allocate(&mut self, kind: BufferKind, name: String) -> String {
        let id = format!("buf_{}", self.next_id);
        self.next_id += 1;

        let metadata = BufferMetadata {
            id: id.clone(),
            kind,
            name,
            count: 0,
            start_time_us: None,
            end_time_us: None,
            created_at: chrono::Utc::now().timestamp().max(0) as u64,
            is_streaming: false,
            owning_session_id: None,
        };
        self.buffers.insert(
            id.clone(),
            NamedBuffer {
                metadata,
                generation: 0,
            },
        );
        id
    }
}

/// Buffer registry holding multiple named buffers.
///
/// Shared between callers behind an `Arc`; all methods take `&self`.
pub struct BufferRegistry {
    pub(crate) state: RwLock<RegistryState>,
    pub(crate) db: BufferDb,
    pub(crate) filter_cache: Mutex<FilterIndexCache>,
    list_log: Mutex<ListLogState>,
}

// ============================================================================
// Construction
// ============================================================================

impl BufferRegistry {
    /// Registry backed by an in-memory database.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::with_db(BufferDb::open_in_memory()?, 8))
    }

    /// Registry backed by a database file (cleared on open).
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::with_db(BufferDb::open(path)?, 8))
    }

    /// Registry configured from settings: file or in-memory storage and the
    /// filtered index cache size.
    pub fn from_settings(settings: &StoreSettings) -> Result<Self> {
        let db = match &settings.database_path {
            Some(path) => BufferDb::open(path)?,
            None => BufferDb::open_in_memory()?,
        };
        Ok(Self::with_db(db, settings.filter_index_cache_size))
    }

    fn with_db(db: BufferDb, cache_size: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            db,
            filter_cache: Mutex::new(FilterIndexCache::new(cache_size)),
            list_log: Mutex::new(ListLogState::default()),
        }
    }

    pub(crate) fn read_state(&self) -> Result<RwLockReadGuard<'_, RegistryState>> {
        self.state.read().map_err(|_| BufferError::Poisoned("buffer registry"))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, RegistryState>> {
        self.state.write().map_err(|_| BufferError::Poisoned("buffer registry"))
    }

    pub(crate) fn cache(&self) -> Result<MutexGuard<'_, FilterIndexCache>> {
        self.filter_cache
            .lock()
            .map_err(|_| BufferError::Poisoned("filter index cache"))
    }
}

// ============================================================================
// Public API - Buffer Creation & Management
// ============================================================================

impl BufferRegistry {
    /// Create a new empty buffer. It is neither active nor streaming and has no owner.
    pub fn create(&self, kind: BufferKind, name: impl Into<String>) -> Result<BufferMetadata> {
        let name = name.into();
        let mut state = self.write_state()?;
        let id = state.allocate(kind, name.clone());
        tracing::info!("[BufferStore] Created buffer '{}' ({}) - '{}'", id, kind, name);
        let buffer = state.get(&id)?;
        Ok(state.snapshot(buffer))
    }

    /// Metadata for one buffer, `None` if the id is unknown.
    pub fn get_metadata(&self, id: &str) -> Result<Option<BufferMetadata>> {
        let state = self.read_state()?;
        Ok(state.buffers.get(id).map(|b| state.snapshot(b)))
    }

    /// Metadata for one buffer, NotFound if the id is unknown.
    pub fn metadata(&self, id: &str) -> Result<BufferMetadata> {
        let state = self.read_state()?;
        let buffer = state.get(id)?;
        Ok(state.snapshot(buffer))
    }

    /// List all buffers (metadata only), oldest first.
    pub fn list(&self) -> Result<Vec<BufferMetadata>> {
        let state = self.read_state()?;

        // Check if state changed since last log
        let streaming_id = state.streaming_id.clone();
        let buffer_count = state.buffers.len();
        let mut logged = self
            .list_log
            .lock()
            .map_err(|_| BufferError::Poisoned("list log"))?;
        if streaming_id != logged.streaming_id || buffer_count != logged.buffer_count {
            tracing::debug!(
                "[BufferStore] list - streaming_id: {:?}, buffers: {}",
                streaming_id.as_deref(),
                buffer_count
            );
            logged.streaming_id = streaming_id;
            logged.buffer_count = buffer_count;
        }
        drop(logged);

        Ok(sorted_snapshots(&state, |_| true))
    }

    /// List only orphaned buffers (no owning session).
    pub fn list_orphaned(&self) -> Result<Vec<BufferMetadata>> {
        let state = self.read_state()?;
        Ok(sorted_snapshots(&state, |b| b.metadata.owning_session_id.is_none()))
    }

    /// Delete a buffer and its data. Clears the active and streaming pointers if
    /// they referenced it.
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut state = self.write_state()?;
        if state.buffers.remove(id).is_none() {
            return Err(BufferError::not_found(id));
        }
        if state.active_id.as_deref() == Some(id) {
            state.active_id = None;
        }
        if state.streaming_id.as_deref() == Some(id) {
            state.streaming_id = None;
        }
        self.cache()?.purge(id);
        self.db.delete_buffer_data(id)?;
        tracing::info!("[BufferStore] Deleted buffer '{}'", id);
        Ok(())
    }

    /// Drop every buffer and clear the active and streaming pointers.
    pub fn clear_all(&self) -> Result<()> {
        let mut state = self.write_state()?;
        state.buffers.clear();
        state.active_id = None;
        state.streaming_id = None;
        self.cache()?.clear();
        self.db.delete_all_data()?;
        tracing::info!("[BufferStore] Cleared all buffers");
        Ok(())
    }

    /// Get the active buffer ID.
    pub fn active_id(&self) -> Result<Option<String>> {
        Ok(self.read_state()?.active_id.clone())
    }

    /// Metadata of the active buffer, if any.
    pub fn active_metadata(&self) -> Result<Option<BufferMetadata>> {
        let state = self.read_state()?;
        Ok(state
            .active_id
            .as_deref()
            .and_then(|id| state.buffers.get(id))
            .map(|b| state.snapshot(b)))
    }

    /// Set a specific buffer as active.
    pub fn set_active(&self, id: &str) -> Result<()> {
        let mut state = self.write_state()?;
        state.get(id)?;
        state.active_id = Some(id.to_string());
        tracing::info!("[BufferStore] Set active buffer: {}", id);
        Ok(())
    }

    /// Duplicate a buffer into a new orphaned buffer (for apps detaching from a session).
    pub fn copy_buffer(&self, source_id: &str, new_name: impl Into<String>) -> Result<BufferMetadata> {
        let new_name = new_name.into();
        let mut state = self.write_state()?;
        let source = state.get(source_id)?.metadata.clone();

        let id = state.allocate(source.kind, new_name.clone());
        // Copy data in SQLite (INSERT INTO ... SELECT, no memory spike)
        let copied = match self.db.copy_buffer_data(&source.kind, source_id, &id, source.count as u64) {
            Ok(copied) => copied,
            Err(e) => {
                state.buffers.remove(&id);
                return Err(e);
            }
        };

        let buffer = state
            .buffers
            .get_mut(&id)
            .ok_or_else(|| BufferError::not_found(&id))?;
        buffer.metadata.count = copied;
        buffer.metadata.start_time_us = source.start_time_us;
        buffer.metadata.end_time_us = source.end_time_us;

        tracing::info!(
            "[BufferStore] Copied buffer '{}' -> '{}' ('{}', {} items)",
            source_id,
            id,
            new_name,
            copied
        );
        let buffer = state.get(&id)?;
        Ok(state.snapshot(buffer))
    }
}

/// Snapshots of the buffers matching `keep`, ordered by creation.
fn sorted_snapshots(state: &RegistryState, keep: impl Fn(&NamedBuffer) -> bool) -> Vec<BufferMetadata> {
    let mut result: Vec<BufferMetadata> = state
        .buffers
        .values()
        .filter(|b| keep(b))
        .map(|b| state.snapshot(b))
        .collect();
    result.sort_by_key(|m| id_number(&m.id));
    result
}

fn id_number(id: &str) -> u32 {
    id.strip_prefix("buf_")
        .and_then(|n| n.parse().ok())
        .unwrap_or(u32::MAX)
}

// ============================================================================
// Public API - Session Ownership
// ============================================================================

impl BufferRegistry {
    /// Assign a buffer to a session.
    pub fn set_owner(&self, id: &str, session_id: &str) -> Result<()> {
        let mut state = self.write_state()?;
        let buffer = state
            .buffers
            .get_mut(id)
            .ok_or_else(|| BufferError::not_found(id))?;
        buffer.metadata.owning_session_id = Some(session_id.to_string());
        tracing::info!("[BufferStore] Assigned buffer '{}' to session '{}'", id, session_id);
        Ok(())
    }

    /// Orphan all buffers owned by a session. Data and counts are untouched.
    /// Returns the orphaned buffers for event emission.
    pub fn orphan_all_for_session(&self, session_id: &str) -> Result<Vec<OrphanedBufferInfo>> {
        let mut state = self.write_state()?;
        let mut orphaned = Vec::new();

        for buffer in state.buffers.values_mut() {
            if buffer.metadata.owning_session_id.as_deref() == Some(session_id) {
                buffer.metadata.owning_session_id = None;
                orphaned.push(OrphanedBufferInfo {
                    buffer_id: buffer.metadata.id.clone(),
                    buffer_name: buffer.metadata.name.clone(),
                    kind: buffer.metadata.kind,
                    count: buffer.metadata.count,
                });
            }
        }
        orphaned.sort_by_key(|o| id_number(&o.buffer_id));

        if !orphaned.is_empty() {
            tracing::info!(
                "[BufferStore] Orphaned {} buffer(s) for session '{}': {:?}",
                orphaned.len(),
                session_id,
                orphaned.iter().map(|o| &o.buffer_id).collect::<Vec<_>>()
            );
        }
        Ok(orphaned)
    }

    /// The first buffer owned by a session, if any.
    pub fn buffer_for_session(&self, session_id: &str) -> Result<Option<String>> {
        let state = self.read_state()?;
        Ok(sorted_snapshots(&state, |b| {
            b.metadata.owning_session_id.as_deref() == Some(session_id)
        })
        .into_iter()
        .next()
        .map(|m| m.id))
    }
}

// ============================================================================
// Public API - Writes
// ============================================================================

impl BufferRegistry {
    /// Append items to a buffer. Data and metadata are updated in one step.
    pub fn append(&self, id: &str, items: BufferItems) -> Result<BufferMetadata> {
        let mut state = self.write_state()?;
        let buffer = state.get_kind(id, items.kind())?;
        if items.is_empty() {
            return Ok(state.snapshot(buffer));
        }

        let first_seq = buffer.metadata.count as u64 + 1;
        match &items {
            BufferItems::Frames(frames) => self.db.insert_frames(id, first_seq, frames)?,
            BufferItems::Bytes(bytes) => self.db.insert_bytes(id, first_seq, bytes)?,
        }

        let buffer = state
            .buffers
            .get_mut(id)
            .ok_or_else(|| BufferError::not_found(id))?;
        if buffer.metadata.start_time_us.is_none() {
            buffer.metadata.start_time_us = items.first_timestamp();
        }
        buffer.metadata.end_time_us = items.last_timestamp();
        buffer.metadata.count += items.len();

        let buffer = state.get(id)?;
        Ok(state.snapshot(buffer))
    }

    /// Create a frame buffer already holding `frames`. The buffer becomes
    /// visible to readers only once its data is stored.
    pub fn create_frames(&self, name: impl Into<String>, frames: Vec<FrameMessage>) -> Result<BufferMetadata> {
        let name = name.into();
        let mut state = self.write_state()?;
        let id = state.allocate(BufferKind::Frames, name.clone());

        // Single transaction: a failed insert leaves no rows behind
        if let Err(e) = self.db.insert_frames(&id, 1, &frames) {
            state.buffers.remove(&id);
            return Err(e);
        }

        let buffer = state
            .buffers
            .get_mut(&id)
            .ok_or_else(|| BufferError::not_found(&id))?;
        buffer.metadata.count = frames.len();
        buffer.metadata.start_time_us = frames.first().map(|f| f.timestamp_us);
        buffer.metadata.end_time_us = frames.last().map(|f| f.timestamp_us);

        tracing::info!(
            "[BufferStore] Created buffer '{}' (frames) - '{}' with {} frames",
            id,
            name,
            frames.len()
        );
        let buffer = state.get(&id)?;
        Ok(state.snapshot(buffer))
    }

    pub fn append_frames(&self, id: &str, frames: Vec<FrameMessage>) -> Result<BufferMetadata> {
        self.append(id, BufferItems::Frames(frames))
    }

    pub fn append_bytes(&self, id: &str, bytes: Vec<TimestampedByte>) -> Result<BufferMetadata> {
        self.append(id, BufferItems::Bytes(bytes))
    }

    /// Replace every frame of a frame buffer in one exclusive step, keeping its
    /// id, name and owner. Used when framing is re-applied into the same buffer.
    pub fn replace_frames(&self, id: &str, frames: Vec<FrameMessage>) -> Result<BufferMetadata> {
        let mut state = self.write_state()?;
        state.get_kind(id, BufferKind::Frames)?;

        self.db.replace_frames(id, &frames)?;
        self.cache()?.purge(id);

        let buffer = state
            .buffers
            .get_mut(id)
            .ok_or_else(|| BufferError::not_found(id))?;
        buffer.metadata.count = frames.len();
        buffer.metadata.start_time_us = frames.first().map(|f| f.timestamp_us);
        buffer.metadata.end_time_us = frames.last().map(|f| f.timestamp_us);
        buffer.generation += 1;

        tracing::info!("[BufferStore] Refilled buffer '{}' with {} frames", id, frames.len());
        let buffer = state.get(id)?;
        Ok(state.snapshot(buffer))
    }

    /// The full contents of a byte buffer, in arrival order.
    pub fn all_bytes(&self, id: &str) -> Result<Vec<TimestampedByte>> {
        let state = self.read_state()?;
        let buffer = state.get_kind(id, BufferKind::Bytes)?;
        self.db.all_bytes(id, buffer.metadata.count as u64)
    }
}

// ============================================================================
// Public API - Live Streaming
// ============================================================================

impl BufferRegistry {
    /// Create a buffer and make it the single streaming target and the active
    /// buffer. Any previous streaming target stops streaming.
    pub fn start_stream(
        &self,
        kind: BufferKind,
        name: impl Into<String>,
        session_id: Option<&str>,
    ) -> Result<BufferMetadata> {
        let name = name.into();
        let mut state = self.write_state()?;
        let id = state.allocate(kind, name.clone());

        if let Some(previous) = state.streaming_id.replace(id.clone()) {
            tracing::info!("[BufferStore] Stream moved from '{}' to '{}'", previous, id);
        }
        state.active_id = Some(id.clone());
        if let Some(session_id) = session_id {
            if let Some(buffer) = state.buffers.get_mut(&id) {
                buffer.metadata.owning_session_id = Some(session_id.to_string());
            }
        }

        tracing::info!(
            "[BufferStore] Created buffer '{}' ({}) - '{}' [streaming=true]",
            id,
            kind,
            name
        );
        let buffer = state.get(&id)?;
        Ok(state.snapshot(buffer))
    }

    /// Append to the current streaming target.
    pub fn append_to_stream(&self, items: BufferItems) -> Result<BufferMetadata> {
        let id = self
            .read_state()?
            .streaming_id
            .clone()
            .ok_or_else(|| BufferError::Empty("No buffer is streaming".to_string()))?;
        self.append(&id, items)
    }

    /// Stop streaming. The active pointer is left unchanged.
    /// Returns the finished buffer's metadata if there was a streaming buffer.
    pub fn finalize_stream(&self) -> Result<Option<BufferMetadata>> {
        let mut state = self.write_state()?;
        let Some(id) = state.streaming_id.take() else {
            return Ok(None);
        };
        Ok(state.buffers.get(&id).map(|b| {
            tracing::info!(
                "[BufferStore] Finalized buffer '{}' with {} items",
                id,
                b.metadata.count
            );
            state.snapshot(b)
        }))
    }

    /// Id of the streaming target, if any.
    pub fn streaming_id(&self) -> Result<Option<String>> {
        Ok(self.read_state()?.streaming_id.clone())
    }
}
