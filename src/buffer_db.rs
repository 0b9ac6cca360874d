// src/buffer_db.rs
//
// SQLite-backed storage for buffer frame and byte data.
// Metadata lives in the registry (buffer_store.rs); this module only stores
// and retrieves items. Every row carries a 1-based per-buffer `seq` so a
// frame's position in its unfiltered buffer survives filtering.

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::buffer_store::{BufferFrameInfo, BufferKind, TimestampedByte};
use crate::error::{BufferError, Result};
use crate::io::FrameMessage;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS frames (
    buffer_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    protocol TEXT NOT NULL,
    timestamp_us INTEGER NOT NULL,
    frame_id INTEGER NOT NULL,
    bus INTEGER,
    dlc INTEGER NOT NULL,
    payload BLOB NOT NULL,
    is_extended INTEGER NOT NULL DEFAULT 0,
    is_fd INTEGER NOT NULL DEFAULT 0,
    source_address INTEGER,
    incomplete INTEGER,
    crc_valid INTEGER,
    id_unresolved INTEGER,
    direction TEXT,
    PRIMARY KEY (buffer_id, seq)
);

CREATE TABLE IF NOT EXISTS bytes (
    buffer_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    byte_val INTEGER NOT NULL,
    timestamp_us INTEGER NOT NULL,
    bus INTEGER,
    PRIMARY KEY (buffer_id, seq)
);

CREATE INDEX IF NOT EXISTS idx_frames_buffer_fid ON frames (buffer_id, frame_id, seq);
CREATE INDEX IF NOT EXISTS idx_frames_buffer_ts ON frames (buffer_id, timestamp_us);
";

const FRAME_COLUMNS: &str = "seq, protocol, timestamp_us, frame_id, bus, dlc, payload, is_extended, is_fd, source_address, incomplete, crc_valid, id_unresolved, direction";

const INSERT_FRAME_SQL: &str = "INSERT INTO frames (buffer_id, seq, protocol, timestamp_us, frame_id, bus, dlc, payload, is_extended, is_fd, source_address, incomplete, crc_valid, id_unresolved, direction)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)";

/// Bulk item storage. One connection, serialised by a mutex
/// (rusqlite::Connection is !Sync).
pub struct BufferDb {
    conn: Mutex<Connection>,
}

// ============================================================================
// Initialisation
// ============================================================================

impl BufferDb {
    /// Open (or create) a database file. Leftover data from a previous run is
    /// cleared: buffer contents are ephemeral, only the file is reused.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;

        // WAL mode for concurrent read/write
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        // Synchronous NORMAL is safe with WAL and faster than FULL
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        // 64 MB page cache for better read performance
        conn.execute_batch("PRAGMA cache_size=-65536;")?;
        conn.execute_batch("PRAGMA temp_store=MEMORY;")?;

        let db = Self::with_schema(conn)?;
        db.delete_all_data()?;
        tracing::info!("[buffer_db] Initialised at {:?}", path);
        Ok(db)
    }

    /// In-memory database, used when no database path is configured.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_schema(conn)
    }

    fn with_schema(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| BufferError::Poisoned("buffer_db"))
    }
}

// ============================================================================
// Helpers: row <-> item
// ============================================================================

fn row_to_frame(row: &rusqlite::Row) -> rusqlite::Result<(u64, FrameMessage)> {
    let seq: i64 = row.get("seq")?;
    let source_address: Option<i64> = row.get("source_address")?;
    let incomplete: Option<i64> = row.get("incomplete")?;
    let crc_valid: Option<i64> = row.get("crc_valid")?;
    let id_unresolved: Option<i64> = row.get("id_unresolved")?;
    let bus: Option<i64> = row.get("bus")?;

    let frame = FrameMessage {
        protocol: row.get("protocol")?,
        timestamp_us: row.get::<_, i64>("timestamp_us")? as u64,
        frame_id: row.get::<_, i64>("frame_id")? as u32,
        bus: bus.map(|v| v as u8),
        dlc: row.get::<_, i64>("dlc")? as u16,
        bytes: row.get("payload")?,
        is_extended: row.get::<_, i64>("is_extended")? != 0,
        is_fd: row.get::<_, i64>("is_fd")? != 0,
        source_address: source_address.map(|v| v as u16),
        incomplete: incomplete.map(|v| v != 0),
        crc_valid: crc_valid.map(|v| v != 0),
        id_unresolved: id_unresolved.map(|v| v != 0),
        direction: row.get("direction")?,
    };
    Ok((seq as u64, frame))
}

fn row_to_byte(row: &rusqlite::Row) -> rusqlite::Result<(u64, TimestampedByte)> {
    let seq: i64 = row.get(0)?;
    let bus: Option<i64> = row.get(3)?;
    Ok((
        seq as u64,
        TimestampedByte {
            byte: row.get::<_, i64>(1)? as u8,
            timestamp_us: row.get::<_, i64>(2)? as u64,
            bus: bus.map(|v| v as u8),
        },
    ))
}

fn insert_frame_rows(tx: &Transaction, buffer_id: &str, first_seq: u64, frames: &[FrameMessage]) -> rusqlite::Result<()> {
    let mut stmt = tx.prepare_cached(INSERT_FRAME_SQL)?;
    for (i, frame) in frames.iter().enumerate() {
        stmt.execute(params![
            buffer_id,
            (first_seq + i as u64) as i64,
            &frame.protocol,
            frame.timestamp_us as i64,
            frame.frame_id as i64,
            frame.bus.map(|v| v as i64),
            frame.dlc as i64,
            &frame.bytes,
            frame.is_extended as i32,
            frame.is_fd as i32,
            frame.source_address.map(|v| v as i64),
            frame.incomplete.map(|v| v as i32),
            frame.crc_valid.map(|v| v as i32),
            frame.id_unresolved.map(|v| v as i32),
            &frame.direction,
        ])?;
    }
    Ok(())
}

/// `AND frame_id IN (...)` clause for a frame-id filter; empty filter = no clause.
/// Ids are integers, so inlining them is safe.
fn frame_id_clause(frame_ids: &[u32]) -> String {
    if frame_ids.is_empty() {
        return String::new();
    }
    let placeholders = frame_ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!(" AND frame_id IN ({})", placeholders)
}

fn table_name(kind: &BufferKind) -> &'static str {
    match kind {
        BufferKind::Frames => "frames",
        BufferKind::Bytes => "bytes",
    }
}

fn sql_limit(limit: usize) -> i64 {
    limit.min(i64::MAX as usize) as i64
}

// ============================================================================
// Writes
// ============================================================================

impl BufferDb {
    /// Insert a batch of frames numbered from `first_seq`. Single transaction.
    pub fn insert_frames(&self, buffer_id: &str, first_seq: u64, frames: &[FrameMessage]) -> Result<()> {
        if frames.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        insert_frame_rows(&tx, buffer_id, first_seq, frames)?;
        tx.commit()?;
        Ok(())
    }

    /// Insert a batch of timestamped bytes numbered from `first_seq`. Single transaction.
    pub fn insert_bytes(&self, buffer_id: &str, first_seq: u64, bytes: &[TimestampedByte]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO bytes (buffer_id, seq, byte_val, timestamp_us, bus) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (i, b) in bytes.iter().enumerate() {
                stmt.execute(params![
                    buffer_id,
                    (first_seq + i as u64) as i64,
                    b.byte as i64,
                    b.timestamp_us as i64,
                    b.bus.map(|v| v as i64),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Replace every frame of a buffer in one transaction (framing reuse).
    pub fn replace_frames(&self, buffer_id: &str, frames: &[FrameMessage]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM frames WHERE buffer_id = ?1", params![buffer_id])?;
        insert_frame_rows(&tx, buffer_id, 1, frames)?;
        tx.commit()?;
        Ok(())
    }

    /// Copy the first `max_seq` items of one buffer into another (INSERT SELECT, no memory spike).
    pub fn copy_buffer_data(&self, kind: &BufferKind, source_id: &str, dest_id: &str, max_seq: u64) -> Result<usize> {
        let conn = self.lock()?;
        let copied = match kind {
            BufferKind::Frames => conn.execute(
                "INSERT INTO frames (buffer_id, seq, protocol, timestamp_us, frame_id, bus, dlc, payload, is_extended, is_fd, source_address, incomplete, crc_valid, id_unresolved, direction)
                 SELECT ?2, seq, protocol, timestamp_us, frame_id, bus, dlc, payload, is_extended, is_fd, source_address, incomplete, crc_valid, id_unresolved, direction
                 FROM frames WHERE buffer_id = ?1 AND seq <= ?3",
                params![source_id, dest_id, max_seq as i64],
            )?,
            BufferKind::Bytes => conn.execute(
                "INSERT INTO bytes (buffer_id, seq, byte_val, timestamp_us, bus)
                 SELECT ?2, seq, byte_val, timestamp_us, bus
                 FROM bytes WHERE buffer_id = ?1 AND seq <= ?3",
                params![source_id, dest_id, max_seq as i64],
            )?,
        };
        Ok(copied)
    }

    /// Delete all data for a specific buffer.
    pub fn delete_buffer_data(&self, buffer_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM frames WHERE buffer_id = ?1", params![buffer_id])?;
        conn.execute("DELETE FROM bytes WHERE buffer_id = ?1", params![buffer_id])?;
        Ok(())
    }

    /// Delete all data from both tables.
    pub fn delete_all_data(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM frames", [])?;
        conn.execute("DELETE FROM bytes", [])?;
        Ok(())
    }
}

// ============================================================================
// Frame Reads
// ============================================================================
//
// Every read is bounded by `max_seq`, the count the caller observed in the
// registry, so a page never includes rows the metadata does not yet report.

impl BufferDb {
    /// Frames with `after_seq < seq <= max_seq`, in buffer order.
    pub fn frames_range(&self, buffer_id: &str, after_seq: u64, max_seq: u64, limit: usize) -> Result<Vec<(u64, FrameMessage)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM frames WHERE buffer_id = ?1 AND seq > ?2 AND seq <= ?3 ORDER BY seq LIMIT ?4",
            FRAME_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![buffer_id, after_seq as i64, max_seq as i64, sql_limit(limit)],
            row_to_frame,
        )?;
        let mut frames = Vec::with_capacity(limit.min(4096));
        for row in rows {
            frames.push(row?);
        }
        Ok(frames)
    }

    /// A page of frames whose id is in `frame_ids`. Returns (frames, total_filtered_count).
    pub fn frames_page_filtered(
        &self,
        buffer_id: &str,
        frame_ids: &[u32],
        max_seq: u64,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<(u64, FrameMessage)>, usize)> {
        let conn = self.lock()?;
        let filter = frame_id_clause(frame_ids);

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM frames WHERE buffer_id = ?1 AND seq <= ?2{}", filter),
            params![buffer_id, max_seq as i64],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM frames WHERE buffer_id = ?1 AND seq <= ?2{} ORDER BY seq LIMIT ?3 OFFSET ?4",
            FRAME_COLUMNS, filter
        ))?;
        let rows = stmt.query_map(
            params![buffer_id, max_seq as i64, sql_limit(limit), sql_limit(offset)],
            row_to_frame,
        )?;
        let mut frames = Vec::with_capacity(limit.min(4096));
        for row in rows {
            frames.push(row?);
        }
        Ok((frames, total as usize))
    }

    /// The last `limit` matching frames, oldest first.
    /// Returns (frames, total_filtered_count, max_timestamp_us).
    pub fn frames_tail(
        &self,
        buffer_id: &str,
        frame_ids: &[u32],
        max_seq: u64,
        limit: usize,
    ) -> Result<(Vec<(u64, FrameMessage)>, usize, Option<u64>)> {
        let conn = self.lock()?;
        let filter = frame_id_clause(frame_ids);

        let (total, end_time_us): (i64, Option<i64>) = conn.query_row(
            &format!(
                "SELECT COUNT(*), MAX(timestamp_us) FROM frames WHERE buffer_id = ?1 AND seq <= ?2{}",
                filter
            ),
            params![buffer_id, max_seq as i64],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM frames WHERE buffer_id = ?1 AND seq <= ?2{} ORDER BY seq DESC LIMIT ?3",
            FRAME_COLUMNS, filter
        ))?;
        let rows = stmt.query_map(params![buffer_id, max_seq as i64, sql_limit(limit)], row_to_frame)?;
        let mut frames = Vec::with_capacity(limit.min(4096));
        for row in rows {
            frames.push(row?);
        }
        // Results came in DESC order, reverse to chronological
        frames.reverse();

        Ok((frames, total as usize, end_time_us.map(|v| v as u64)))
    }

    /// (seq, timestamp_us) of matching frames with `after_seq < seq <= max_seq`.
    /// Feeds the filtered position index used by timestamp search.
    pub fn filtered_positions(&self, buffer_id: &str, frame_ids: &[u32], after_seq: u64, max_seq: u64) -> Result<Vec<(u64, u64)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT seq, timestamp_us FROM frames WHERE buffer_id = ?1 AND seq > ?2 AND seq <= ?3{} ORDER BY seq",
            frame_id_clause(frame_ids)
        ))?;
        let rows = stmt.query_map(params![buffer_id, after_seq as i64, max_seq as i64], |row| {
            Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64))
        })?;
        let mut positions = Vec::new();
        for row in rows {
            positions.push(row?);
        }
        Ok(positions)
    }

    /// Timestamp of the item at a 1-based position, if present.
    pub fn timestamp_at(&self, kind: &BufferKind, buffer_id: &str, seq: u64) -> Result<Option<u64>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT timestamp_us FROM {} WHERE buffer_id = ?1 AND seq = ?2",
            table_name(kind)
        ))?;
        let ts = stmt
            .query_row(params![buffer_id, seq as i64], |row| row.get::<_, i64>(0))
            .optional()?;
        Ok(ts.map(|v| v as u64))
    }

    /// Unique frame info via aggregation query.
    pub fn frame_info(&self, buffer_id: &str, max_seq: u64) -> Result<Vec<BufferFrameInfo>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT frame_id, MAX(dlc) as max_dlc, MIN(bus) as bus, MAX(is_extended) as is_extended,
                    (MIN(dlc) != MAX(dlc)) as has_dlc_mismatch, COUNT(*) as frame_count
             FROM frames WHERE buffer_id = ?1 AND seq <= ?2 GROUP BY frame_id ORDER BY frame_id",
        )?;
        let rows = stmt.query_map(params![buffer_id, max_seq as i64], |row| {
            let bus: Option<i64> = row.get("bus")?;
            Ok(BufferFrameInfo {
                frame_id: row.get::<_, i64>("frame_id")? as u32,
                max_dlc: row.get::<_, i64>("max_dlc")? as u16,
                bus: bus.map(|v| v as u8),
                is_extended: row.get::<_, i64>("is_extended")? != 0,
                has_dlc_mismatch: row.get::<_, i64>("has_dlc_mismatch")? != 0,
                count: row.get::<_, i64>("frame_count")? as usize,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

// ============================================================================
// Byte Reads
// ============================================================================

impl BufferDb {
    /// Bytes with `after_seq < seq <= max_seq`, in buffer order.
    pub fn bytes_range(&self, buffer_id: &str, after_seq: u64, max_seq: u64, limit: usize) -> Result<Vec<(u64, TimestampedByte)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT seq, byte_val, timestamp_us, bus FROM bytes
             WHERE buffer_id = ?1 AND seq > ?2 AND seq <= ?3 ORDER BY seq LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![buffer_id, after_seq as i64, max_seq as i64, sql_limit(limit)],
            row_to_byte,
        )?;
        let mut bytes = Vec::with_capacity(limit.min(4096));
        for row in rows {
            bytes.push(row?);
        }
        Ok(bytes)
    }

    /// All bytes up to `max_seq` (used by framing which needs the full stream).
    pub fn all_bytes(&self, buffer_id: &str, max_seq: u64) -> Result<Vec<TimestampedByte>> {
        Ok(self
            .bytes_range(buffer_id, 0, max_seq, max_seq as usize)?
            .into_iter()
            .map(|(_, b)| b)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(frame_id: u32, timestamp_us: u64) -> FrameMessage {
        let mut f = FrameMessage::serial(vec![frame_id as u8, 0xAA], timestamp_us, Some(0));
        f.frame_id = frame_id;
        f
    }

    #[test]
    fn test_insert_and_range_read_preserves_seq() {
        let db = BufferDb::open_in_memory().unwrap();
        db.insert_frames("buf_1", 1, &[frame(1, 10), frame(2, 20)]).unwrap();
        db.insert_frames("buf_1", 3, &[frame(1, 30)]).unwrap();

        let rows = db.frames_range("buf_1", 1, 3, 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, 2);
        assert_eq!(rows[0].1.frame_id, 2);
        assert_eq!(rows[1].0, 3);
        assert_eq!(rows[1].1.timestamp_us, 30);
    }

    #[test]
    fn test_reads_bounded_by_max_seq() {
        let db = BufferDb::open_in_memory().unwrap();
        db.insert_frames("buf_1", 1, &[frame(1, 10), frame(2, 20), frame(3, 30)]).unwrap();

        assert_eq!(db.frames_range("buf_1", 0, 2, 10).unwrap().len(), 2);
        let (frames, total, end) = db.frames_tail("buf_1", &[], 2, 10).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(total, 2);
        assert_eq!(end, Some(20));
    }

    #[test]
    fn test_filtered_page_reports_original_positions() {
        let db = BufferDb::open_in_memory().unwrap();
        db.insert_frames("buf_1", 1, &[frame(1, 10), frame(2, 20), frame(1, 30), frame(2, 40)])
            .unwrap();

        let (frames, total) = db.frames_page_filtered("buf_1", &[2], 4, 0, 10).unwrap();
        assert_eq!(total, 2);
        let seqs: Vec<u64> = frames.iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![2, 4]);
    }

    #[test]
    fn test_replace_frames_renumbers_from_one() {
        let db = BufferDb::open_in_memory().unwrap();
        db.insert_frames("buf_1", 1, &[frame(1, 10), frame(2, 20), frame(3, 30)]).unwrap();
        db.replace_frames("buf_1", &[frame(9, 99)]).unwrap();

        let rows = db.frames_range("buf_1", 0, 10, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, 1);
        assert_eq!(rows[0].1.frame_id, 9);
    }

    #[test]
    fn test_bytes_roundtrip_keeps_optional_bus() {
        let db = BufferDb::open_in_memory().unwrap();
        let bytes = vec![
            TimestampedByte { byte: 0x01, timestamp_us: 5, bus: None },
            TimestampedByte { byte: 0x02, timestamp_us: 6, bus: Some(3) },
        ];
        db.insert_bytes("buf_2", 1, &bytes).unwrap();

        let all = db.all_bytes("buf_2", 2).unwrap();
        assert_eq!(all, bytes);
        assert_eq!(db.timestamp_at(&BufferKind::Bytes, "buf_2", 2).unwrap(), Some(6));
        assert_eq!(db.timestamp_at(&BufferKind::Bytes, "buf_2", 3).unwrap(), None);
    }

    #[test]
    fn test_frame_info_aggregates_per_id() {
        let db = BufferDb::open_in_memory().unwrap();
        let mut long = frame(1, 30);
        long.bytes.push(0xFF);
        long.dlc = 3;
        db.insert_frames("buf_1", 1, &[frame(1, 10), frame(2, 20), long]).unwrap();

        let info = db.frame_info("buf_1", 3).unwrap();
        assert_eq!(info.len(), 2);
        assert_eq!(info[0].frame_id, 1);
        assert_eq!(info[0].count, 2);
        assert_eq!(info[0].max_dlc, 3);
        assert!(info[0].has_dlc_mismatch);
        assert!(!info[1].has_dlc_mismatch);
    }

    #[test]
    fn test_delete_buffer_data_only_touches_that_buffer() {
        let db = BufferDb::open_in_memory().unwrap();
        db.insert_frames("buf_1", 1, &[frame(1, 10)]).unwrap();
        db.insert_frames("buf_2", 1, &[frame(1, 10)]).unwrap();
        db.delete_buffer_data("buf_1").unwrap();

        assert!(db.frames_range("buf_1", 0, 10, 10).unwrap().is_empty());
        assert_eq!(db.frames_range("buf_2", 0, 10, 10).unwrap().len(), 1);
    }
}
