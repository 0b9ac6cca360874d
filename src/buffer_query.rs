// src/buffer_query.rs
//
// Read-only access over buffers: windowed pages, id-filtered pages, tail
// reads for live views and timestamp-to-offset search.
//
// Every read resolves the buffer's count under the registry read lock and
// bounds its query by it, so a buffer growing between calls is tolerated.

use serde::Serialize;
use std::collections::HashSet;

use crate::buffer_store::{BufferFrameInfo, BufferItems, BufferKind, BufferRegistry, NamedBuffer};
use crate::error::{BufferError, Result};

// ============================================================================
// Response Types
// ============================================================================

/// One window of a buffer
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BufferPage {
    pub items: BufferItems,
    /// Items in the (filtered) view
    pub total_count: usize,
    pub offset: usize,
    pub limit: usize,
    /// 1-based position of each item in the unfiltered buffer, parallel to `items`
    pub original_indices: Vec<usize>,
}

/// Response from a tail fetch
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TailResponse {
    pub items: BufferItems,
    /// 1-based original buffer position for each item, parallel to `items`.
    pub original_indices: Vec<usize>,
    pub total_filtered_count: usize,
    pub end_time_us: Option<u64>,
}

// ============================================================================
// Filtered Position Index
// ============================================================================

/// Timestamps of the frames matching one id set, in buffer order.
/// Extended incrementally as the buffer grows; rebuilt when contents are replaced.
struct FilterIndex {
    buffer_id: String,
    frame_ids: Vec<u32>,
    generation: u64,
    /// Highest unfiltered position already scanned
    last_seq: u64,
    timestamps: Vec<u64>,
}

/// Small LRU of filtered indices, most recently used last.
pub(crate) struct FilterIndexCache {
    capacity: usize,
    entries: Vec<FilterIndex>,
}

impl FilterIndexCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Vec::new(),
        }
    }

    fn take(&mut self, buffer_id: &str, frame_ids: &[u32]) -> Option<FilterIndex> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.buffer_id == buffer_id && e.frame_ids == frame_ids)?;
        Some(self.entries.remove(pos))
    }

    fn put(&mut self, index: FilterIndex) {
        self.entries.push(index);
        if self.entries.len() > self.capacity {
            self.entries.remove(0);
        }
    }

    pub(crate) fn purge(&mut self, buffer_id: &str) {
        self.entries.retain(|e| e.buffer_id != buffer_id);
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn sorted_ids(selected_ids: &HashSet<u32>) -> Vec<u32> {
    let mut ids: Vec<u32> = selected_ids.iter().copied().collect();
    ids.sort_unstable();
    ids
}

fn require_frames_for_filter(buffer: &NamedBuffer) -> Result<()> {
    if buffer.metadata.kind != BufferKind::Frames {
        return Err(BufferError::WrongKind {
            id: buffer.metadata.id.clone(),
            expected: BufferKind::Frames,
            actual: buffer.metadata.kind,
        });
    }
    Ok(())
}

// ============================================================================
// Public API - Queries
// ============================================================================

impl BufferRegistry {
    /// A window of `limit` items starting at `offset`.
    pub fn page(&self, id: &str, offset: usize, limit: usize) -> Result<BufferPage> {
        let state = self.read_state()?;
        let buffer = state.get(id)?;
        let total = buffer.metadata.count;
        let max_seq = total as u64;

        let (items, original_indices) = if offset >= total || limit == 0 {
            (empty_items(buffer.metadata.kind), Vec::new())
        } else {
            match buffer.metadata.kind {
                BufferKind::Frames => {
                    let rows = self.db.frames_range(id, offset as u64, max_seq, limit)?;
                    let indices = rows.iter().map(|(seq, _)| *seq as usize).collect();
                    (BufferItems::Frames(rows.into_iter().map(|(_, f)| f).collect()), indices)
                }
                BufferKind::Bytes => {
                    let rows = self.db.bytes_range(id, offset as u64, max_seq, limit)?;
                    let indices = rows.iter().map(|(seq, _)| *seq as usize).collect();
                    (BufferItems::Bytes(rows.into_iter().map(|(_, b)| b).collect()), indices)
                }
            }
        };

        Ok(BufferPage {
            items,
            total_count: total,
            offset,
            limit,
            original_indices,
        })
    }

    /// A window over only the frames whose id is in `selected_ids`.
    /// An empty set means no filter.
    pub fn page_filtered(
        &self,
        id: &str,
        offset: usize,
        limit: usize,
        selected_ids: &HashSet<u32>,
    ) -> Result<BufferPage> {
        if selected_ids.is_empty() {
            return self.page(id, offset, limit);
        }

        let state = self.read_state()?;
        let buffer = state.get(id)?;
        require_frames_for_filter(buffer)?;

        let ids = sorted_ids(selected_ids);
        let (rows, total) =
            self.db
                .frames_page_filtered(id, &ids, buffer.metadata.count as u64, offset, limit)?;

        Ok(BufferPage {
            original_indices: rows.iter().map(|(seq, _)| *seq as usize).collect(),
            items: BufferItems::Frames(rows.into_iter().map(|(_, f)| f).collect()),
            total_count: total,
            offset,
            limit,
        })
    }

    /// The most recent `limit` matching items, oldest first.
    pub fn tail(&self, id: &str, limit: usize, selected_ids: &HashSet<u32>) -> Result<TailResponse> {
        let state = self.read_state()?;
        let buffer = state.get(id)?;
        let max_seq = buffer.metadata.count as u64;

        match buffer.metadata.kind {
            BufferKind::Frames => {
                let ids = sorted_ids(selected_ids);
                let (rows, total, end_time_us) = self.db.frames_tail(id, &ids, max_seq, limit)?;
                Ok(TailResponse {
                    original_indices: rows.iter().map(|(seq, _)| *seq as usize).collect(),
                    items: BufferItems::Frames(rows.into_iter().map(|(_, f)| f).collect()),
                    total_filtered_count: total,
                    end_time_us,
                })
            }
            BufferKind::Bytes => {
                if !selected_ids.is_empty() {
                    require_frames_for_filter(buffer)?;
                }
                let after = max_seq.saturating_sub(limit as u64);
                let rows = self.db.bytes_range(id, after, max_seq, limit)?;
                Ok(TailResponse {
                    original_indices: rows.iter().map(|(seq, _)| *seq as usize).collect(),
                    items: BufferItems::Bytes(rows.into_iter().map(|(_, b)| b).collect()),
                    total_filtered_count: buffer.metadata.count,
                    end_time_us: buffer.metadata.end_time_us,
                })
            }
        }
    }

    /// Offset (within the filtered view) of the first item with
    /// `timestamp_us >= target_time_us`, or the view length if none qualify.
    /// Assumes the view is time-ordered.
    pub fn find_offset_for_timestamp(
        &self,
        id: &str,
        target_time_us: u64,
        selected_ids: &HashSet<u32>,
    ) -> Result<usize> {
        let state = self.read_state()?;
        let buffer = state.get(id)?;

        if selected_ids.is_empty() {
            return self.search_unfiltered(buffer, target_time_us);
        }
        require_frames_for_filter(buffer)?;

        let ids = sorted_ids(selected_ids);
        let max_seq = buffer.metadata.count as u64;
        let mut cache = self.cache()?;

        let mut index = match cache.take(id, &ids) {
            Some(index) if index.generation == buffer.generation && index.last_seq <= max_seq => index,
            _ => FilterIndex {
                buffer_id: id.to_string(),
                frame_ids: ids.clone(),
                generation: buffer.generation,
                last_seq: 0,
                timestamps: Vec::new(),
            },
        };
        if index.last_seq < max_seq {
            let positions = self.db.filtered_positions(id, &ids, index.last_seq, max_seq)?;
            index.timestamps.extend(positions.iter().map(|(_, ts)| *ts));
            index.last_seq = max_seq;
        }

        let offset = index.timestamps.partition_point(|&ts| ts < target_time_us);
        cache.put(index);
        Ok(offset)
    }

    /// Binary search over the unfiltered buffer using point lookups by position.
    fn search_unfiltered(&self, buffer: &NamedBuffer, target_time_us: u64) -> Result<usize> {
        let kind = buffer.metadata.kind;
        let id = buffer.metadata.id.as_str();
        let (mut lo, mut hi) = (0usize, buffer.metadata.count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.db.timestamp_at(&kind, id, mid as u64 + 1)? {
                Some(ts) if ts < target_time_us => lo = mid + 1,
                _ => hi = mid,
            }
        }
        Ok(lo)
    }

    /// Unique frame ids in a frame buffer with their dlc/bus summary.
    pub fn frame_info(&self, id: &str) -> Result<Vec<BufferFrameInfo>> {
        let state = self.read_state()?;
        let buffer = state.get_kind(id, BufferKind::Frames)?;
        self.db.frame_info(id, buffer.metadata.count as u64)
    }
}

fn empty_items(kind: BufferKind) -> BufferItems {
    match kind {
        BufferKind::Frames => BufferItems::Frames(Vec::new()),
        BufferKind::Bytes => BufferItems::Bytes(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_store::TimestampedByte;
    use crate::io::FrameMessage;
    use proptest::prelude::*;

    fn frame(frame_id: u32, timestamp_us: u64) -> FrameMessage {
        let mut f = FrameMessage::serial(vec![0xAA], timestamp_us, Some(0));
        f.frame_id = frame_id;
        f
    }

    fn ids(list: &[u32]) -> HashSet<u32> {
        list.iter().copied().collect()
    }

    /// Frames with ids cycling 1,2,3 at timestamps 10, 20, 30, ...
    fn registry_with_frames(n: u64) -> (BufferRegistry, String) {
        let registry = BufferRegistry::in_memory().unwrap();
        let id = registry.create(BufferKind::Frames, "cap").unwrap().id;
        let frames = (0..n).map(|i| frame((i % 3 + 1) as u32, (i + 1) * 10)).collect();
        registry.append_frames(&id, frames).unwrap();
        (registry, id)
    }

    // ========================================================================
    // Pagination
    // ========================================================================

    #[test]
    fn test_page_reports_original_indices() {
        let (registry, id) = registry_with_frames(10);
        let page = registry.page(&id, 4, 3).unwrap();
        assert_eq!(page.total_count, 10);
        assert_eq!(page.original_indices, vec![5, 6, 7]);
        assert_eq!(page.items.len(), 3);
    }

    #[test]
    fn test_page_past_end_is_empty() {
        let (registry, id) = registry_with_frames(3);
        let page = registry.page(&id, 3, 10).unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.total_count, 3);
    }

    #[test]
    fn test_page_filtered_maps_back_to_unfiltered_positions() {
        let (registry, id) = registry_with_frames(9);
        let page = registry.page_filtered(&id, 1, 2, &ids(&[2])).unwrap();
        // id 2 sits at positions 2, 5, 8
        assert_eq!(page.total_count, 3);
        assert_eq!(page.original_indices, vec![5, 8]);
    }

    #[test]
    fn test_page_filtered_empty_set_is_unfiltered() {
        let (registry, id) = registry_with_frames(5);
        let page = registry.page_filtered(&id, 0, 10, &HashSet::new()).unwrap();
        assert_eq!(page.total_count, 5);
        assert_eq!(page.original_indices, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_filter_on_byte_buffer_rejected() {
        let registry = BufferRegistry::in_memory().unwrap();
        let id = registry.create(BufferKind::Bytes, "raw").unwrap().id;
        let err = registry.page_filtered(&id, 0, 10, &ids(&[1])).unwrap_err();
        assert!(matches!(err, BufferError::WrongKind { .. }));
    }

    #[test]
    fn test_unknown_buffer_not_found() {
        let registry = BufferRegistry::in_memory().unwrap();
        assert!(registry.page("buf_9", 0, 10).unwrap_err().is_not_found());
        assert!(registry.tail("buf_9", 10, &HashSet::new()).unwrap_err().is_not_found());
        assert!(registry
            .find_offset_for_timestamp("buf_9", 0, &HashSet::new())
            .unwrap_err()
            .is_not_found());
    }

    // ========================================================================
    // Tail
    // ========================================================================

    #[test]
    fn test_tail_returns_latest_matching_oldest_first() {
        let (registry, id) = registry_with_frames(9);
        let tail = registry.tail(&id, 2, &ids(&[1])).unwrap();
        // id 1 sits at positions 1, 4, 7
        assert_eq!(tail.original_indices, vec![4, 7]);
        assert_eq!(tail.total_filtered_count, 3);
        assert_eq!(tail.end_time_us, Some(70));
    }

    #[test]
    fn test_tail_on_byte_buffer() {
        let registry = BufferRegistry::in_memory().unwrap();
        let id = registry.create(BufferKind::Bytes, "raw").unwrap().id;
        let bytes = (0..5u8)
            .map(|b| TimestampedByte {
                byte: b,
                timestamp_us: b as u64,
                bus: None,
            })
            .collect();
        registry.append_bytes(&id, bytes).unwrap();

        let tail = registry.tail(&id, 2, &HashSet::new()).unwrap();
        assert_eq!(tail.original_indices, vec![4, 5]);
        assert_eq!(tail.total_filtered_count, 5);
        assert_eq!(tail.end_time_us, Some(4));
    }

    // ========================================================================
    // Timestamp Search
    // ========================================================================

    #[test]
    fn test_find_offset_unfiltered() {
        let (registry, id) = registry_with_frames(10);
        let none = HashSet::new();
        assert_eq!(registry.find_offset_for_timestamp(&id, 0, &none).unwrap(), 0);
        assert_eq!(registry.find_offset_for_timestamp(&id, 10, &none).unwrap(), 0);
        assert_eq!(registry.find_offset_for_timestamp(&id, 11, &none).unwrap(), 1);
        assert_eq!(registry.find_offset_for_timestamp(&id, 100, &none).unwrap(), 9);
        assert_eq!(registry.find_offset_for_timestamp(&id, 101, &none).unwrap(), 10);
    }

    #[test]
    fn test_find_offset_filtered_tracks_growth() {
        let (registry, id) = registry_with_frames(9);
        let filter = ids(&[3]);
        // id 3 at timestamps 30, 60, 90
        assert_eq!(registry.find_offset_for_timestamp(&id, 61, &filter).unwrap(), 2);
        assert_eq!(registry.find_offset_for_timestamp(&id, 1000, &filter).unwrap(), 3);

        registry.append_frames(&id, vec![frame(3, 120)]).unwrap();
        assert_eq!(registry.find_offset_for_timestamp(&id, 1000, &filter).unwrap(), 4);
        assert_eq!(registry.find_offset_for_timestamp(&id, 100, &filter).unwrap(), 3);
    }

    #[test]
    fn test_find_offset_filtered_rebuilds_after_replace() {
        let (registry, id) = registry_with_frames(9);
        let filter = ids(&[1]);
        assert_eq!(registry.find_offset_for_timestamp(&id, 1000, &filter).unwrap(), 3);

        registry.replace_frames(&id, vec![frame(1, 5)]).unwrap();
        assert_eq!(registry.find_offset_for_timestamp(&id, 1000, &filter).unwrap(), 1);
        assert_eq!(registry.find_offset_for_timestamp(&id, 5, &filter).unwrap(), 0);
    }

    #[test]
    fn test_filter_cache_is_bounded() {
        let (registry, id) = registry_with_frames(6);
        for fid in 0..20u32 {
            registry.find_offset_for_timestamp(&id, 0, &ids(&[fid])).unwrap();
        }
        assert!(registry.cache().unwrap().len() <= 8);
    }

    #[test]
    fn test_frame_info_counts_ids() {
        let (registry, id) = registry_with_frames(7);
        let info = registry.frame_info(&id).unwrap();
        let counts: Vec<(u32, usize)> = info.iter().map(|i| (i.frame_id, i.count)).collect();
        assert_eq!(counts, vec![(1, 3), (2, 2), (3, 2)]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_find_offset_is_monotonic_lower_bound(
            mut stamps in prop::collection::vec(0u64..1_000, 0..40),
            t1 in 0u64..1_100,
            t2 in 0u64..1_100,
        ) {
            stamps.sort_unstable();
            let registry = BufferRegistry::in_memory().unwrap();
            let id = registry.create(BufferKind::Frames, "p").unwrap().id;
            let frames: Vec<_> = stamps.iter().enumerate().map(|(i, &ts)| frame((i % 2) as u32, ts)).collect();
            registry.append_frames(&id, frames).unwrap();

            for filter in [HashSet::new(), ids(&[1])] {
                let view: Vec<u64> = stamps
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| filter.is_empty() || filter.contains(&((i % 2) as u32)))
                    .map(|(_, &ts)| ts)
                    .collect();
                let (lo, hi) = (t1.min(t2), t1.max(t2));
                let off_lo = registry.find_offset_for_timestamp(&id, lo, &filter).unwrap();
                let off_hi = registry.find_offset_for_timestamp(&id, hi, &filter).unwrap();
                prop_assert!(off_lo <= off_hi);
                prop_assert_eq!(off_lo, view.iter().position(|&ts| ts >= lo).unwrap_or(view.len()));
            }
        }
    }
}
