//! Queued files and their sources.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::segment::{Segment, SegmentSet};
use crate::tth::Tth;
use crate::types::{HintedUser, Priority, QueueItemStatus, QueueToken};

/// Behavioral flags of a queue item
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFlags {
    /// Full file list download
    pub user_list: bool,
    /// Partial file list download
    pub partial_list: bool,
    /// Downloaded for in-client viewing, not for the share
    pub client_view: bool,
    /// Hidden from other peers
    pub private_file: bool,
    /// Match the remote queue once the list arrives
    pub match_queue: bool,
}

impl ItemFlags {
    /// Lists and views are standalone items that never join a bundle
    pub fn is_standalone(&self) -> bool {
        self.user_list || self.partial_list || self.client_view
    }

    /// Small transfers that use the "small" slot path
    pub fn uses_small_slot(&self) -> bool {
        self.partial_list || self.user_list
    }
}

/// Why a source was demoted to the bad list
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BadSourceReason {
    /// Remote denied access
    NoAccess,
    /// Transfer was below the slow-source threshold
    SlowSource,
    /// Remote has no hash tree for the file
    NoTree,
    /// Remote no longer has the file
    FileNotAvailable,
    /// Remote data failed hash verification; never re-promoted
    TthInconsistency,
    /// Partial source with no blocks we still need
    NoNeededParts,
}

impl BadSourceReason {
    /// May a source demoted for this reason be promoted back to good?
    pub fn recoverable(self) -> bool {
        !matches!(self, BadSourceReason::TthInconsistency)
    }
}

/// A download source: a user plus transfer-relevant state
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Source {
    /// The user offering the file
    pub user: HintedUser,
    /// True when the remote shares only part of the file
    pub partial: bool,
    /// Remote parts-info for partial sources
    pub parts: Vec<Segment>,
}

impl Source {
    /// A full source for the user
    pub fn new(user: HintedUser) -> Self {
        Self {
            user,
            partial: false,
            parts: Vec::new(),
        }
    }

    /// A partial source advertising the given parts
    pub fn partial(user: HintedUser, parts: Vec<Segment>) -> Self {
        Self {
            user,
            partial: true,
            parts,
        }
    }
}

/// One queued file
#[derive(Clone, Debug)]
pub struct QueueItem {
    /// Process-unique token
    pub token: QueueToken,
    /// Final target path
    pub target: PathBuf,
    /// In-progress temp path
    pub temp_target: PathBuf,
    /// Total size in bytes
    pub size: u64,
    /// Content hash
    pub tth: Tth,
    /// Scheduling priority
    pub priority: Priority,
    /// Managed by auto-priority
    pub auto_priority: bool,
    /// Verified bytes on disk
    pub downloaded: SegmentSet,
    /// Good sources
    pub sources: Vec<Source>,
    /// Demoted sources with the reason
    pub bad_sources: Vec<(Source, BadSourceReason)>,
    /// Lifecycle status
    pub status: QueueItemStatus,
    /// Behavioral flags
    pub flags: ItemFlags,
    /// Cap on concurrent segments
    pub max_segments: u8,
    /// Creation time, seconds since the epoch
    pub added: i64,
    /// Remote file timestamp, seconds since the epoch
    pub remote_time: i64,
    /// Owning bundle; `None` only for standalone `Highest` items
    pub bundle: Option<QueueToken>,
    /// Byte ranges currently assigned to running downloads
    pub running_segments: Vec<Segment>,
    /// Nick of the last source a finished file came from
    pub last_source: String,
}

impl QueueItem {
    /// Create a fresh queued item
    pub fn new(
        target: PathBuf,
        temp_target: PathBuf,
        size: u64,
        tth: Tth,
        priority: Priority,
        flags: ItemFlags,
        max_segments: u8,
        added: i64,
    ) -> Self {
        Self {
            token: QueueToken::next(),
            target,
            temp_target,
            size,
            tth,
            priority,
            auto_priority: false,
            downloaded: SegmentSet::new(),
            sources: Vec::new(),
            bad_sources: Vec::new(),
            status: QueueItemStatus::Queued,
            flags,
            max_segments,
            added,
            remote_time: 0,
            bundle: None,
            running_segments: Vec::new(),
            last_source: String::new(),
        }
    }

    /// True for both pause levels
    pub fn is_paused(&self) -> bool {
        self.priority.is_paused()
    }

    /// All bytes verified on disk?
    pub fn is_downloaded(&self) -> bool {
        self.status >= QueueItemStatus::Downloaded
    }

    /// Downloaded fraction in `[0, 1]`
    pub fn progress(&self) -> f64 {
        if self.size == 0 {
            1.0
        } else {
            self.downloaded.downloaded_bytes() as f64 / self.size as f64
        }
    }

    /// Is the user a good source?
    pub fn has_source(&self, user: &HintedUser) -> bool {
        self.sources.iter().any(|s| s.user.cid == user.cid)
    }

    /// Is the user a bad source?
    pub fn has_bad_source(&self, user: &HintedUser) -> bool {
        self.bad_sources.iter().any(|(s, _)| s.user.cid == user.cid)
    }

    /// Add a good source.
    ///
    /// Adding an existing good source refreshes its parts-info and reports
    /// `false` (no-op for the source count). A source demoted for an
    /// unrecoverable reason is refused.
    pub fn add_source(&mut self, source: Source) -> bool {
        if let Some(existing) = self
            .sources
            .iter_mut()
            .find(|s| s.user.cid == source.user.cid)
        {
            existing.partial = source.partial;
            existing.parts = source.parts;
            return false;
        }
        if let Some(pos) = self
            .bad_sources
            .iter()
            .position(|(s, _)| s.user.cid == source.user.cid)
        {
            if !self.bad_sources[pos].1.recoverable() {
                return false;
            }
            self.bad_sources.remove(pos);
        }
        self.sources.push(source);
        true
    }

    /// Move a good source to the bad list. Returns true when the user was a
    /// good source.
    pub fn mark_bad(&mut self, user: &HintedUser, reason: BadSourceReason) -> bool {
        let Some(pos) = self.sources.iter().position(|s| s.user.cid == user.cid) else {
            // Upgrade the recorded reason for an already-bad source; the
            // unrecoverable grade must stick.
            if let Some(entry) = self
                .bad_sources
                .iter_mut()
                .find(|(s, _)| s.user.cid == user.cid)
                && entry.1.recoverable()
            {
                entry.1 = reason;
            }
            return false;
        };
        let source = self.sources.remove(pos);
        self.bad_sources.push((source, reason));
        true
    }

    /// Remove a user from both source lists
    pub fn remove_source(&mut self, user: &HintedUser) -> bool {
        let before = self.sources.len() + self.bad_sources.len();
        self.sources.retain(|s| s.user.cid != user.cid);
        self.bad_sources.retain(|(s, _)| s.user.cid != user.cid);
        self.sources.len() + self.bad_sources.len() != before
    }

    /// Gaps neither downloaded nor currently assigned to a connection
    pub fn free_gaps(&self) -> Vec<Segment> {
        let mut occupied = self.downloaded.clone();
        for s in &self.running_segments {
            occupied.add(*s);
        }
        occupied.gaps(self.size)
    }

    /// Effective concurrent-segment cap
    pub fn effective_max_segments(&self) -> usize {
        self.max_segments.max(1) as usize
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::tth::hash_buffer;
    use crate::types::Cid;

    fn user(byte: u8) -> HintedUser {
        HintedUser::new(Cid([byte; 24]), format!("user{byte}"), "adc://hub:1511")
    }

    fn item() -> QueueItem {
        QueueItem::new(
            PathBuf::from("/dl/a.bin"),
            PathBuf::from("/dl/.incomplete/a.bin.dctmp"),
            1_048_576,
            hash_buffer(b"a").root(),
            Priority::Normal,
            ItemFlags::default(),
            3,
            1_700_000_000,
        )
    }

    #[test]
    fn duplicate_source_add_is_a_no_op_for_the_count() {
        let mut qi = item();
        assert!(qi.add_source(Source::new(user(1))));
        assert!(!qi.add_source(Source::new(user(1))));
        assert_eq!(qi.sources.len(), 1);
    }

    #[test]
    fn good_and_bad_source_sets_stay_disjoint() {
        let mut qi = item();
        qi.add_source(Source::new(user(1)));
        assert!(qi.mark_bad(&user(1), BadSourceReason::SlowSource));

        assert!(!qi.has_source(&user(1)));
        assert!(qi.has_bad_source(&user(1)));

        // Promote back: allowed for recoverable reasons
        assert!(qi.add_source(Source::new(user(1))));
        assert!(qi.has_source(&user(1)));
        assert!(!qi.has_bad_source(&user(1)));
    }

    #[test]
    fn tth_inconsistency_is_never_re_promoted() {
        let mut qi = item();
        qi.add_source(Source::new(user(1)));
        qi.mark_bad(&user(1), BadSourceReason::TthInconsistency);

        assert!(!qi.add_source(Source::new(user(1))));
        assert!(qi.has_bad_source(&user(1)));
        assert!(!qi.has_source(&user(1)));
    }

    #[test]
    fn bad_reason_upgrades_but_never_downgrades() {
        let mut qi = item();
        qi.add_source(Source::new(user(1)));
        qi.mark_bad(&user(1), BadSourceReason::SlowSource);
        qi.mark_bad(&user(1), BadSourceReason::TthInconsistency);
        assert_eq!(qi.bad_sources[0].1, BadSourceReason::TthInconsistency);

        // A later softer failure must not clear the hard grade
        qi.mark_bad(&user(1), BadSourceReason::SlowSource);
        assert_eq!(qi.bad_sources[0].1, BadSourceReason::TthInconsistency);
    }

    #[test]
    fn free_gaps_exclude_running_segments() {
        let mut qi = item();
        qi.downloaded.add(Segment::new(0, 100_000));
        qi.running_segments.push(Segment::new(100_000, 100_000));

        let gaps = qi.free_gaps();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0], Segment::new(200_000, 848_576));
    }

    #[test]
    fn progress_reaches_one_when_covered() {
        let mut qi = item();
        assert_eq!(qi.progress(), 0.0);
        qi.downloaded.add(Segment::new(0, qi.size));
        assert!((qi.progress() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn standalone_flags_identify_lists() {
        let flags = ItemFlags {
            partial_list: true,
            ..ItemFlags::default()
        };
        assert!(flags.is_standalone());
        assert!(flags.uses_small_slot());
        assert!(!ItemFlags::default().is_standalone());
    }
}
