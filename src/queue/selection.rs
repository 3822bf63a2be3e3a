//! Segment selection and download-side slot admission.

use crate::segment::Segment;
use crate::types::{Priority, QueueToken};

use super::item::{QueueItem, Source};

/// Transfer class requested by the connection manager
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadType {
    /// Any queued file
    Any,
    /// Small transfers only (lists, tiny files)
    Small,
    /// An additional MCN connection for a running bundle
    McnNormal,
}

/// A granted download start
#[derive(Clone, Debug)]
pub struct StartInfo {
    /// Item to fetch from
    pub item: QueueToken,
    /// Owning bundle, if any
    pub bundle: Option<QueueToken>,
    /// Byte range to request
    pub segment: Segment,
    /// Rides the always-admitted small slot
    pub small_slot: bool,
    /// Hub to handshake through
    pub hub_hint: String,
}

/// Why no download could start
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    /// The user has nothing we want right now
    #[error("no downloadable items for this user")]
    NoItems,
    /// Global download slots are taken
    #[error("all download slots in use")]
    NoSlots,
    /// The global speed cap is reached
    #[error("download speed cap reached")]
    SpeedCapReached,
    /// Partial source with no blocks we still need
    #[error("source has no needed parts")]
    NoNeededParts,
    /// Every wanted range is already assigned to a connection
    #[error("no free segments")]
    NoFreeSegments,
    /// The target volume is out of space
    #[error("insufficient disk space")]
    NoDiskSpace,
}

/// Pick the byte range a new connection should fetch.
///
/// Partial sources are intersected with the undownloaded, unassigned ranges;
/// full sources take the largest free range, split to the negotiated chunk
/// size.
pub fn select_segment(
    item: &QueueItem,
    source: &Source,
    chunk_size: u64,
    block_size: u64,
) -> Result<Segment, StartError> {
    let gaps = item.free_gaps();
    if gaps.is_empty() {
        return Err(StartError::NoFreeSegments);
    }

    if source.partial {
        let mut needed = Vec::new();
        for gap in &gaps {
            for part in &source.parts {
                if let Some(i) = gap.intersection(part) {
                    needed.push(i);
                }
            }
        }
        let best = needed.into_iter().max_by_key(|s| s.size);
        return match best {
            Some(range) => Ok(clip_to_chunk(range, chunk_size, block_size)),
            None => Err(StartError::NoNeededParts),
        };
    }

    let largest = gaps
        .into_iter()
        .max_by_key(|s| s.size)
        .ok_or(StartError::NoFreeSegments)?;
    Ok(clip_to_chunk(largest, chunk_size, block_size))
}

fn clip_to_chunk(gap: Segment, chunk_size: u64, block_size: u64) -> Segment {
    let chunk = chunk_size.max(block_size).max(1);
    if gap.size <= chunk {
        return gap;
    }
    // Consecutive fetches continue exactly where the previous chunk ended;
    // failure handling commits on block boundaries, so interrupted gaps start
    // block-aligned on their own.
    Segment::new(gap.start, chunk)
}

/// Slot class granted to an admitted download
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadSlotKind {
    /// Counts against the configured slots
    Normal,
    /// One of the `Highest`-priority extra slots
    Extra,
    /// Small transfer, never counted
    Small,
}

/// Download-slot policy snapshot
#[derive(Clone, Copy, Debug)]
pub struct SlotPolicy {
    /// Configured download slots
    pub download_slots: usize,
    /// Extra slots reserved for `Highest`-priority items
    pub extra_slots: usize,
    /// Speed cap in KiB/s; 0 means uncapped
    pub speed_cap_kib: u64,
}

/// Decide whether a new download may start.
///
/// `Highest`-priority items bypass the slot and speed caps up to the extra
/// budget; small transfers always pass; everything else needs a free slot and
/// headroom under the cap.
pub fn admit_download(
    priority: Priority,
    small_slot: bool,
    running: usize,
    extra_running: usize,
    current_rate_kib: u64,
    policy: &SlotPolicy,
) -> Result<DownloadSlotKind, StartError> {
    if small_slot {
        return Ok(DownloadSlotKind::Small);
    }

    let slot_free = running < policy.download_slots;
    let under_cap = policy.speed_cap_kib == 0 || current_rate_kib < policy.speed_cap_kib;

    if priority == Priority::Highest {
        if slot_free && under_cap {
            return Ok(DownloadSlotKind::Normal);
        }
        if extra_running < policy.extra_slots {
            return Ok(DownloadSlotKind::Extra);
        }
        return Err(StartError::NoSlots);
    }

    if !slot_free {
        return Err(StartError::NoSlots);
    }
    if !under_cap {
        return Err(StartError::SpeedCapReached);
    }
    Ok(DownloadSlotKind::Normal)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::item::ItemFlags;
    use crate::tth::hash_buffer;
    use crate::types::{Cid, HintedUser};
    use std::path::PathBuf;

    const BLOCK: u64 = 65536;
    const MIB: u64 = 1_048_576;

    fn user() -> HintedUser {
        HintedUser::new(Cid([1; 24]), "u", "adc://hub:1511")
    }

    fn item(size: u64) -> QueueItem {
        QueueItem::new(
            PathBuf::from("/dl/a.bin"),
            PathBuf::from("/tmp/a.dctmp"),
            size,
            hash_buffer(b"x").root(),
            Priority::Normal,
            ItemFlags::default(),
            3,
            0,
        )
    }

    #[test]
    fn fresh_file_yields_chunk_from_the_front() {
        let qi = item(8 * MIB);
        let seg = select_segment(&qi, &Source::new(user()), MIB, BLOCK).unwrap();
        assert_eq!(seg.start, 0);
        assert_eq!(seg.size, MIB);
    }

    #[test]
    fn resume_after_partial_block_failure_starts_at_block_boundary() {
        // Committed bytes [0, 65536); next fetch must start at 65536.
        let mut qi = item(MIB);
        qi.downloaded.add(Segment::new(0, BLOCK));
        let seg = select_segment(&qi, &Source::new(user()), MIB, BLOCK).unwrap();
        assert_eq!(seg.start, BLOCK);
        assert_eq!(seg.end(), MIB);
    }

    #[test]
    fn small_gap_is_taken_whole() {
        let mut qi = item(MIB);
        qi.downloaded.add(Segment::new(0, MIB - 1000));
        let seg = select_segment(&qi, &Source::new(user()), MIB, BLOCK).unwrap();
        assert_eq!(seg, Segment::new(MIB - 1000, 1000));
    }

    #[test]
    fn running_segments_are_never_reassigned() {
        let mut qi = item(2 * MIB);
        qi.running_segments.push(Segment::new(0, MIB));
        let seg = select_segment(&qi, &Source::new(user()), MIB, BLOCK).unwrap();
        assert_eq!(seg.start, MIB, "second connection gets the other half");

        qi.running_segments.push(seg);
        assert_eq!(
            select_segment(&qi, &Source::new(user()), MIB, BLOCK),
            Err(StartError::NoFreeSegments)
        );
    }

    #[test]
    fn consecutive_chunks_stay_contiguous() {
        // Three 350 KiB fetches of a 1 MiB file land back to back.
        let chunk = 358_400u64;
        let mut qi = item(MIB);
        let first = select_segment(&qi, &Source::new(user()), chunk, BLOCK).unwrap();
        assert_eq!(first, Segment::new(0, chunk));
        qi.downloaded.add(first);

        let second = select_segment(&qi, &Source::new(user()), chunk, BLOCK).unwrap();
        assert_eq!(second, Segment::new(chunk, chunk));
        qi.downloaded.add(second);

        let third = select_segment(&qi, &Source::new(user()), chunk, BLOCK).unwrap();
        assert_eq!(third, Segment::new(chunk * 2, MIB - chunk * 2));
        qi.downloaded.add(third);
        assert!(qi.downloaded.covers_file(MIB));
    }

    #[test]
    fn partial_source_intersects_parts_with_needs() {
        let mut qi = item(4 * MIB);
        qi.downloaded.add(Segment::new(0, MIB));
        let src = Source::partial(user(), vec![Segment::new(0, 2 * MIB)]);

        let seg = select_segment(&qi, &src, 4 * MIB, BLOCK).unwrap();
        assert_eq!(seg, Segment::new(MIB, MIB), "only the undownloaded overlap");
    }

    #[test]
    fn exhausted_partial_source_reports_no_needed_parts() {
        let mut qi = item(4 * MIB);
        qi.downloaded.add(Segment::new(0, 2 * MIB));
        let src = Source::partial(user(), vec![Segment::new(0, 2 * MIB)]);
        assert_eq!(
            select_segment(&qi, &src, MIB, BLOCK),
            Err(StartError::NoNeededParts)
        );
    }

    #[test]
    fn finished_file_has_no_free_segments() {
        let mut qi = item(MIB);
        qi.downloaded.add(Segment::new(0, MIB));
        assert_eq!(
            select_segment(&qi, &Source::new(user()), MIB, BLOCK),
            Err(StartError::NoFreeSegments)
        );
    }

    const POLICY: SlotPolicy = SlotPolicy {
        download_slots: 2,
        extra_slots: 3,
        speed_cap_kib: 1000,
    };

    #[test]
    fn normal_priority_needs_slot_and_speed_headroom() {
        assert_eq!(
            admit_download(Priority::Normal, false, 1, 0, 500, &POLICY),
            Ok(DownloadSlotKind::Normal)
        );
        assert_eq!(
            admit_download(Priority::Normal, false, 2, 0, 500, &POLICY),
            Err(StartError::NoSlots)
        );
        assert_eq!(
            admit_download(Priority::Normal, false, 1, 0, 1000, &POLICY),
            Err(StartError::SpeedCapReached)
        );
    }

    #[test]
    fn highest_priority_taps_the_extra_budget() {
        assert_eq!(
            admit_download(Priority::Highest, false, 2, 0, 2000, &POLICY),
            Ok(DownloadSlotKind::Extra)
        );
        assert_eq!(
            admit_download(Priority::Highest, false, 2, 3, 2000, &POLICY),
            Err(StartError::NoSlots),
            "extra budget is bounded"
        );
        assert_eq!(
            admit_download(Priority::Highest, false, 0, 0, 0, &POLICY),
            Ok(DownloadSlotKind::Normal),
            "prefer a normal slot when one is free"
        );
    }

    #[test]
    fn small_transfers_always_admit() {
        assert_eq!(
            admit_download(Priority::Lowest, true, 99, 99, 99_999, &POLICY),
            Ok(DownloadSlotKind::Small)
        );
    }

    #[test]
    fn zero_speed_cap_means_uncapped() {
        let policy = SlotPolicy {
            speed_cap_kib: 0,
            ..POLICY
        };
        assert_eq!(
            admit_download(Priority::Normal, false, 0, 0, u64::MAX, &policy),
            Ok(DownloadSlotKind::Normal)
        );
    }
}
