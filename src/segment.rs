//! Byte-range segments and coalesced segment sets.
//!
//! A [`Segment`] is a `(start, length)` pair over a file's byte range. A
//! [`SegmentSet`] is an ordered, non-overlapping, coalesced set of segments;
//! it is the on-disk truth for which parts of a queued file have been
//! downloaded and verified.

use serde::{Deserialize, Serialize};

/// A contiguous byte range of a file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Segment {
    /// First byte offset
    pub start: u64,
    /// Length in bytes
    pub size: u64,
}

impl Segment {
    /// Create a new segment
    pub fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    /// One past the last byte
    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    /// True when the ranges share at least one byte
    pub fn overlaps(&self, other: &Segment) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// True when the ranges overlap or are directly adjacent
    pub fn touches(&self, other: &Segment) -> bool {
        self.start <= other.end() && other.start <= self.end()
    }

    /// Intersection of two ranges, if non-empty
    pub fn intersection(&self, other: &Segment) -> Option<Segment> {
        let start = self.start.max(other.start);
        let end = self.end().min(other.end());
        (end > start).then(|| Segment::new(start, end - start))
    }
}

/// Ordered, non-overlapping set of downloaded segments.
///
/// Inserting a range that overlaps existing entries merges them. Runs that
/// merely touch keep their boundaries: each persisted segment mirrors one
/// completed transfer chunk. The set never shrinks except through
/// [`SegmentSet::clear`] or [`SegmentSet::replace`] (integrity recheck).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSet {
    segments: Vec<Segment>,
}

impl SegmentSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Segments in ascending order
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Number of disjoint runs
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// True when nothing has been downloaded
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Insert a range, merging with any overlapping runs.
    ///
    /// Adjacent runs are kept separate so the set mirrors the chunks that
    /// were actually transferred. Zero-sized segments are ignored.
    pub fn add(&mut self, segment: Segment) {
        if segment.size == 0 {
            return;
        }

        // Find the insertion window: every run that overlaps the new one.
        let mut merged = segment;
        let mut first = self.segments.len();
        let mut last = 0usize;
        for (i, s) in self.segments.iter().enumerate() {
            if s.overlaps(&merged) {
                first = first.min(i);
                last = last.max(i + 1);
                let start = merged.start.min(s.start);
                let end = merged.end().max(s.end());
                merged = Segment::new(start, end - start);
            }
        }

        if first < last {
            self.segments.splice(first..last, [merged]);
        } else {
            let pos = self
                .segments
                .partition_point(|s| s.start < merged.start);
            self.segments.insert(pos, merged);
        }
    }

    /// Total downloaded bytes
    pub fn downloaded_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.size).sum()
    }

    /// True when the runs jointly cover `[0, file_size)`
    pub fn covers_file(&self, file_size: u64) -> bool {
        self.gaps(file_size).is_empty()
    }

    /// True when the byte at `offset` is downloaded
    pub fn covers(&self, offset: u64) -> bool {
        self.segments
            .iter()
            .any(|s| s.start <= offset && offset < s.end())
    }

    /// True when the whole range is downloaded
    pub fn covers_range(&self, range: &Segment) -> bool {
        self.segments
            .iter()
            .any(|s| s.start <= range.start && range.end() <= s.end())
    }

    /// Undownloaded ranges of a file of `file_size` bytes, ascending
    pub fn gaps(&self, file_size: u64) -> Vec<Segment> {
        let mut out = Vec::new();
        let mut cursor = 0u64;
        for s in &self.segments {
            if s.start > cursor {
                out.push(Segment::new(cursor, s.start - cursor));
            }
            cursor = cursor.max(s.end());
        }
        if cursor < file_size {
            out.push(Segment::new(cursor, file_size - cursor));
        }
        out
    }

    /// The largest undownloaded range, if any
    pub fn largest_gap(&self, file_size: u64) -> Option<Segment> {
        self.gaps(file_size).into_iter().max_by_key(|s| s.size)
    }

    /// Ranges needed from this file that a partial source can supply.
    ///
    /// `parts` is the remote parts-info list; the result is the intersection
    /// of the remote parts with our gaps, ascending.
    pub fn needed_from(&self, parts: &[Segment], file_size: u64) -> Vec<Segment> {
        let gaps = self.gaps(file_size);
        let mut out = Vec::new();
        for gap in &gaps {
            for part in parts {
                if let Some(i) = gap.intersection(part) {
                    out.push(i);
                }
            }
        }
        out.sort_by_key(|s| s.start);
        out
    }

    /// Drop everything (explicit reset)
    pub fn clear(&mut self) {
        self.segments.clear();
    }

    /// Replace the contents with exactly `segments` (integrity recheck).
    ///
    /// Input may be unsorted and fragmented; adjacent verified runs are
    /// coalesced into minimal form.
    pub fn replace(&mut self, segments: impl IntoIterator<Item = Segment>) {
        self.segments.clear();
        for s in segments {
            self.add(s);
        }
        let mut coalesced: Vec<Segment> = Vec::with_capacity(self.segments.len());
        for s in self.segments.drain(..) {
            match coalesced.last_mut() {
                Some(prev) if prev.end() >= s.start => {
                    let end = prev.end().max(s.end());
                    prev.size = end - prev.start;
                }
                _ => coalesced.push(s),
            }
        }
        self.segments = coalesced;
    }
}
