//! Segment-range — the ordered, trimmed sequence of segments covering a
//! requested byte window of a file.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::meta::SegmentData;
use crate::segment::Segment;

/// A segment trimmed to the portion of it a particular range actually
/// needs, paired with the handoff primitive that will carry its bytes.
#[derive(Clone)]
pub struct RangeSegment {
    pub message_id: String,
    pub handoff: Segment,
    /// Usable length of this (possibly trimmed) segment, in bytes.
    pub len: u64,
}

type LoaderFut = Pin<Box<dyn Future<Output = Result<SegmentData>> + Send>>;
/// Loads the raw `SegmentData` at index `i` of the file's segment list.
pub type Loader = Arc<dyn Fn(usize) -> LoaderFut + Send + Sync>;

/// A lazily materialized, per-descriptor offset index: `cum_offset[i]` is
/// the logical offset at which segment `i` begins, `usable_size[i]` is its
/// usable length. Supports O(log N) `find_segment_for_offset` and O(1)
/// `offset_at_segment`.
pub struct SegmentOffsetIndex {
    cum_offset: Vec<u64>,
    usable_size: Vec<u64>,
}

impl SegmentOffsetIndex {
    pub fn build(segments: &[SegmentData]) -> Self {
        let mut cum_offset = Vec::with_capacity(segments.len());
        let mut usable_size = Vec::with_capacity(segments.len());
        let mut offset = 0u64;
        for seg in segments {
            let usable = seg.usable_len();
            cum_offset.push(offset);
            usable_size.push(usable);
            offset += usable;
        }
        Self { cum_offset, usable_size }
    }

    pub fn total_len(&self) -> u64 {
        match (self.cum_offset.last(), self.usable_size.last()) {
            (Some(&c), Some(&u)) => c + u,
            _ => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.cum_offset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cum_offset.is_empty()
    }

    pub fn offset_at_segment(&self, i: usize) -> u64 {
        self.cum_offset[i]
    }

    pub fn usable_size(&self, i: usize) -> u64 {
        self.usable_size[i]
    }

    /// Find the unique segment index `i` such that
    /// `cum_offset[i] <= offset < cum_offset[i] + usable_size[i]`.
    /// Returns `None` if `offset` is at or beyond the file length.
    pub fn find_segment_for_offset(&self, offset: u64) -> Option<usize> {
        if self.cum_offset.is_empty() || offset >= self.total_len() {
            return None;
        }
        // partition_point finds the first index whose cum_offset > offset;
        // the containing segment is one before that.
        let idx = self.cum_offset.partition_point(|&c| c <= offset);
        Some(idx.saturating_sub(1))
    }
}

/// Hints allowing O(1) initialization of a `SegmentRange` when the caller
/// already knows the start/end segment indices (e.g. from a previous read
/// at a nearby offset).
#[derive(Clone, Copy, Debug)]
pub struct RangeHints {
    pub start_seg_idx: usize,
    pub start_file_pos: u64,
    pub end_seg_idx: usize,
    pub end_file_pos: u64,
}

struct RangeState {
    segments: Vec<RangeSegment>,
    cursor: usize,
}

/// The ordered, trimmed sequence of segments covering `[start, end]`
/// (inclusive) of a file.
pub struct SegmentRange {
    state: RwLock<RangeState>,
    loader: Option<Loader>,
}

impl SegmentRange {
    /// Build a range eagerly from a fully known segment list (used when no
    /// offset index is available: O(N) scan, as spec.md allows).
    pub fn from_segments(all: &[SegmentData], start: u64, end: u64) -> Self {
        let index = SegmentOffsetIndex::build(all);
        Self::new(all, &index, start, end, None, None)
    }

    /// Build a range using a precomputed offset index, optionally seeded
    /// with hints for O(1) initialization.
    pub fn new(
        all: &[SegmentData],
        index: &SegmentOffsetIndex,
        start: u64,
        end: u64,
        loader: Option<Loader>,
        hints: Option<RangeHints>,
    ) -> Self {
        let segments = Self::materialize(all, index, start, end, hints);
        Self { state: RwLock::new(RangeState { segments, cursor: 0 }), loader }
    }

    fn materialize(
        all: &[SegmentData],
        index: &SegmentOffsetIndex,
        start: u64,
        end: u64,
        hints: Option<RangeHints>,
    ) -> Vec<RangeSegment> {
        if end < start || index.is_empty() {
            return Vec::new();
        }
        let total_len = index.total_len();
        if total_len == 0 || start >= total_len {
            return Vec::new();
        }
        let end = end.min(total_len - 1);

        let (start_seg, end_seg) = match hints {
            Some(h) if h.start_file_pos <= start && h.end_file_pos >= end => {
                (h.start_seg_idx, h.end_seg_idx)
            }
            _ => {
                let s = match index.find_segment_for_offset(start) {
                    Some(i) => i,
                    None => return Vec::new(),
                };
                let e = match index.find_segment_for_offset(end) {
                    Some(i) => i,
                    None => index.len() - 1,
                };
                (s, e)
            }
        };

        if end_seg < start_seg {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(end_seg - start_seg + 1);
        for i in start_seg..=end_seg {
            let src = &all[i];
            let usable = index.usable_size(i);
            if usable == 0 {
                continue;
            }
            let base = index.offset_at_segment(i);

            let mut eff_start = src.start_offset;
            let mut eff_end = src.end_offset;

            if i == start_seg && start > base {
                eff_start = src.start_offset + (start - base);
            }
            if i == end_seg && end < base + usable - 1 {
                eff_end = src.end_offset.saturating_sub((base + usable - 1) - end);
            }

            if eff_start > eff_end {
                continue;
            }

            out.push(RangeSegment {
                message_id: src.message_id.clone(),
                // `Segment::get_reader` slices the full article body it is
                // handed, so these offsets must stay body-absolute — not
                // relative to `src.start_offset` — to match the bytes
                // `fetch_segment` actually hands to `set_data`.
                handoff: Segment::new(eff_start, eff_end),
                len: eff_end - eff_start + 1,
            });
        }
        out
    }

    pub fn len(&self) -> usize {
        self.state.read().segments.len()
    }

    pub fn has_segments(&self) -> bool {
        !self.state.read().segments.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.state.read().cursor
    }

    /// Return the segment at the current cursor position, if any.
    pub fn get(&self) -> Option<RangeSegment> {
        let state = self.state.read();
        state.segments.get(state.cursor).cloned()
    }

    /// Advance the cursor, releasing the just-consumed segment's data so
    /// memory is freed promptly. This is the primary back-pressure signal
    /// the downloader observes.
    pub fn next(&self) -> Option<RangeSegment> {
        let mut state = self.state.write();
        if let Some(seg) = state.segments.get(state.cursor) {
            seg.handoff.release();
        }
        state.cursor += 1;
        state.segments.get(state.cursor).cloned()
    }

    /// Random access by index, materializing lazily under a write lock if
    /// a loader was supplied. In this implementation segments are always
    /// fully materialized up front, so this is a plain lookup; the loader
    /// is retained for API parity with designs that defer materialization.
    pub fn get_segment(&self, i: usize) -> Option<RangeSegment> {
        let _ = &self.loader;
        self.state.read().segments.get(i).cloned()
    }

    pub fn close_segments(&self) {
        let state = self.state.read();
        for seg in &state.segments {
            seg.handoff.release();
        }
    }

    pub fn clear(&self) {
        self.close_segments();
        let mut state = self.state.write();
        state.segments.clear();
        state.cursor = 0;
    }
}

impl SegmentData {
    /// Usable length of this segment, or 0 if the invariants are violated
    /// (in which case spec.md requires it be treated as empty and skipped).
    pub fn usable_len(&self) -> u64 {
        if self.start_offset <= self.end_offset && self.end_offset < self.segment_size {
            self.end_offset - self.start_offset + 1
        } else {
            0
        }
    }
}
