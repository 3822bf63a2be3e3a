//! Bundles: coherent groups of queued files sharing a target directory.

use std::path::{Path, PathBuf};

use crate::error::HookRejection;
use crate::types::{BundleStatus, Priority, QueueToken};
use crate::utils::is_parent_or_exact;

/// A persisted group of queued files under one target directory, or a single
/// file with its own lifecycle
#[derive(Clone, Debug)]
pub struct Bundle {
    /// Process-unique token; also names the persistence document
    pub token: QueueToken,
    /// Target directory (trailing file name for file bundles)
    pub target: PathBuf,
    /// Scheduling priority
    pub priority: Priority,
    /// Managed by auto-priority
    pub auto_priority: bool,
    /// Creation time, seconds since the epoch
    pub added: i64,
    /// Remote directory timestamp
    pub remote_time: i64,
    /// Single-file bundle
    pub file_bundle: bool,
    /// Lifecycle status
    pub status: BundleStatus,
    /// Last alternate-search time, milliseconds
    pub last_search_ms: u64,
    /// Needs a persistence flush
    pub dirty: bool,
    /// Download files in listed order instead of size order
    pub seq_order: bool,
    /// Rejection from the last completion-hook run, if any
    pub hook_error: Option<HookRejection>,
    /// Unfinished member items
    pub queue_items: Vec<QueueToken>,
    /// Finished member items
    pub finished_items: Vec<QueueToken>,
    /// When the user asked a paused-for-space bundle to resume, seconds
    pub resume_time: i64,
    /// When the last item finished, seconds
    pub time_finished: i64,
    /// Queued by automatic search
    pub added_by_auto_search: bool,
}

impl Bundle {
    /// Create a new bundle in `New` status
    pub fn new(target: PathBuf, priority: Priority, file_bundle: bool, added: i64) -> Self {
        Self {
            token: QueueToken::next(),
            target,
            priority,
            auto_priority: priority == Priority::Default,
            added,
            remote_time: 0,
            file_bundle,
            status: BundleStatus::New,
            last_search_ms: 0,
            dirty: true,
            seq_order: false,
            hook_error: None,
            queue_items: Vec::new(),
            finished_items: Vec::new(),
            resume_time: 0,
            time_finished: 0,
            added_by_auto_search: false,
        }
    }

    /// True for both pause levels
    pub fn is_paused(&self) -> bool {
        self.priority.is_paused()
    }

    /// All items finished downloading?
    pub fn is_downloaded(&self) -> bool {
        self.status >= BundleStatus::Downloaded
    }

    /// Completed (hooks passed) or later?
    pub fn is_completed(&self) -> bool {
        self.status >= BundleStatus::Completed
    }

    /// May new downloads start from this bundle?
    pub fn can_download(&self) -> bool {
        !self.is_paused()
            && !matches!(
                self.status,
                BundleStatus::Recheck | BundleStatus::ValidationRunning
            )
            && !self.is_downloaded()
    }

    /// Does a path fall inside this bundle's tree (or match its file)?
    pub fn contains_path(&self, path: &Path) -> bool {
        if self.file_bundle {
            crate::utils::paths_equal(&self.target, path)
        } else {
            is_parent_or_exact(&self.target, path)
        }
    }

    /// Total member count
    pub fn total_items(&self) -> usize {
        self.queue_items.len() + self.finished_items.len()
    }

    /// Move a member from the queued list to the finished list
    pub fn finish_item(&mut self, item: QueueToken) {
        self.queue_items.retain(|t| *t != item);
        if !self.finished_items.contains(&item) {
            self.finished_items.push(item);
        }
        self.dirty = true;
    }

    /// Move a finished member back to the queued list (readd after loss)
    pub fn readd_item(&mut self, item: QueueToken) {
        self.finished_items.retain(|t| *t != item);
        if !self.queue_items.contains(&item) {
            self.queue_items.push(item);
        }
        self.dirty = true;
    }

    /// Drop a member entirely
    pub fn remove_item(&mut self, item: QueueToken) {
        self.queue_items.retain(|t| *t != item);
        self.finished_items.retain(|t| *t != item);
        self.dirty = true;
    }

    /// Apply a status transition.
    ///
    /// Transitions are monotonic with two sanctioned exceptions: a completed
    /// bundle whose files vanished is re-queued (`Downloaded`/`Shared` →
    /// `Queued`), and `Recheck`/`DownloadError` bounce back to `Queued`.
    pub fn set_status(&mut self, status: BundleStatus) -> bool {
        use BundleStatus::*;
        let allowed = match (self.status, status) {
            (a, b) if a == b => false,
            (New, Queued) => true,
            (Queued, Recheck | DownloadError | ValidationRunning | Downloaded) => true,
            (Recheck, Queued | Downloaded) => true,
            (DownloadError, Queued) => true,
            (ValidationRunning, Queued | ValidationError | Downloaded) => true,
            (ValidationError, Queued | ValidationRunning) => true,
            (Downloaded, ValidationRunning | Completed | Queued) => true,
            (Completed, Shared) => true,
            // Files disappeared before or after sharing
            (Completed | Shared, Queued) => true,
            _ => false,
        };
        if allowed {
            tracing::debug!(bundle = self.token.get(), from = ?self.status, to = ?status, "bundle status");
            self.status = status;
            self.dirty = true;
        } else {
            tracing::warn!(
                bundle = self.token.get(),
                from = ?self.status,
                to = ?status,
                "refused bundle status transition"
            );
        }
        allowed
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(file: bool) -> Bundle {
        Bundle::new(
            if file {
                PathBuf::from("/dl/file.bin")
            } else {
                PathBuf::from("/dl/Some.Release-GRP")
            },
            Priority::Normal,
            file,
            1_700_000_000,
        )
    }

    #[test]
    fn directory_bundle_contains_its_subtree() {
        let b = bundle(false);
        assert!(b.contains_path(Path::new("/dl/Some.Release-GRP/cd1/x.bin")));
        assert!(b.contains_path(Path::new("/dl/some.release-grp")));
        assert!(!b.contains_path(Path::new("/dl/Other")));
    }

    #[test]
    fn file_bundle_matches_only_its_file() {
        let b = bundle(true);
        assert!(b.contains_path(Path::new("/dl/file.bin")));
        assert!(!b.contains_path(Path::new("/dl/file.bin.more")));
        assert!(!b.contains_path(Path::new("/dl")));
    }

    #[test]
    fn lifecycle_happy_path_is_monotonic() {
        let mut b = bundle(false);
        assert!(b.set_status(BundleStatus::Queued));
        assert!(b.set_status(BundleStatus::Downloaded));
        assert!(b.set_status(BundleStatus::Completed));
        assert!(b.set_status(BundleStatus::Shared));

        assert!(!b.set_status(BundleStatus::Downloaded), "no going back mid-pass");
    }

    #[test]
    fn sanctioned_readd_transitions_are_allowed() {
        let mut b = bundle(false);
        b.set_status(BundleStatus::Queued);
        b.set_status(BundleStatus::Downloaded);
        assert!(b.set_status(BundleStatus::Queued), "files lost before sharing");

        b.set_status(BundleStatus::Downloaded);
        b.set_status(BundleStatus::Completed);
        b.set_status(BundleStatus::Shared);
        assert!(b.set_status(BundleStatus::Queued), "share refresh lost the files");
    }

    #[test]
    fn validation_error_round_trip() {
        let mut b = bundle(false);
        b.set_status(BundleStatus::Queued);
        b.set_status(BundleStatus::Downloaded);
        assert!(b.set_status(BundleStatus::ValidationRunning));
        assert!(b.set_status(BundleStatus::ValidationError));
        assert!(b.set_status(BundleStatus::ValidationRunning), "hooks may be retried");
        assert!(b.set_status(BundleStatus::Downloaded));
    }

    #[test]
    fn download_error_pauses_then_requeues() {
        let mut b = bundle(false);
        b.set_status(BundleStatus::Queued);
        assert!(b.set_status(BundleStatus::DownloadError));
        assert!(!b.can_download());
        assert!(b.set_status(BundleStatus::Queued));
    }

    #[test]
    fn finish_and_readd_move_items_between_lists() {
        let mut b = bundle(false);
        let t = QueueToken::next();
        b.queue_items.push(t);

        b.finish_item(t);
        assert!(b.queue_items.is_empty());
        assert_eq!(b.finished_items, vec![t]);

        b.readd_item(t);
        assert_eq!(b.queue_items, vec![t]);
        assert!(b.finished_items.is_empty());
    }

    #[test]
    fn recheck_blocks_downloads() {
        let mut b = bundle(false);
        b.set_status(BundleStatus::Queued);
        assert!(b.can_download());
        b.set_status(BundleStatus::Recheck);
        assert!(!b.can_download());
    }
}
