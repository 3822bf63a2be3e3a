//! Running downloads: source selection entry point, segment completion and
//! failure handling, disk-space guarding, file and bundle finalisation.

use std::path::Path;

use crate::error::Result;
use crate::segment::Segment;
use crate::tth::block_size_for;
use crate::types::{BundleStatus, Event, HintedUser, Priority, QueueItemStatus, QueueToken};
use crate::utils::{free_space_for_target, now_secs};

use super::item::BadSourceReason;
use super::selection::{
    DownloadSlotKind, DownloadType, SlotPolicy, StartError, StartInfo, admit_download,
    select_segment,
};
use super::{BundleCompletion, QueueManager, RunningDownload};

/// Outcome of a completed segment
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentOutcome {
    /// The item finished with this segment
    pub item_finished: bool,
    /// The bundle finished with this item
    pub bundle_finished: bool,
}

impl QueueManager {
    /// Report the engine-wide download rate (KiB/s) for slot admission
    pub async fn update_download_rate(&self, kib_per_sec: u64) {
        self.inner.state.write().await.current_rate_kib = kib_per_sec;
    }

    /// Pick the next download for a user.
    ///
    /// Serialised across connection tasks so a segment is never handed out
    /// twice. `online_hubs` is the set of hubs the user is currently seen on;
    /// the returned hub hint is always one of them.
    pub async fn get_next_download(
        &self,
        user: &HintedUser,
        online_hubs: &[String],
        dtype: DownloadType,
        chunk_size: Option<u64>,
    ) -> std::result::Result<StartInfo, StartError> {
        let _guard = self.inner.start_lock.lock().await;
        let mut state = self.inner.state.write().await;

        let policy = SlotPolicy {
            download_slots: self.inner.config.queue.download_slots,
            extra_slots: self.inner.config.queue.extra_download_slots,
            speed_cap_kib: self.inner.config.queue.max_download_speed_kib,
        };
        let chunk = chunk_size.unwrap_or(self.inner.config.queue.min_segment_kib * 1024);

        let candidates = state.user_queue.candidates(&user.cid);
        let mut last_error = StartError::NoItems;

        for token in candidates {
            let Some(item) = state.items.get(&token) else {
                continue;
            };
            if item.is_paused() || item.status != QueueItemStatus::Queued {
                continue;
            }
            if dtype == DownloadType::Small && !item.flags.uses_small_slot() {
                continue;
            }
            if state.running_count_for_item(token) >= item.effective_max_segments() {
                continue;
            }

            let bundle_token = item.bundle;
            if let Some(bt) = bundle_token {
                let Some(bundle) = state.bundles.get(&bt) else {
                    continue;
                };
                if !bundle.can_download() {
                    continue;
                }
                // Lowest-priority bundles only run alone.
                if bundle.priority == Priority::Lowest
                    && state
                        .running
                        .values()
                        .any(|d| d.bundle.is_some() && d.bundle != Some(bt))
                {
                    continue;
                }
                // Lowest-priority items wait for their bundle siblings.
                if item.priority == Priority::Lowest && state.running_count_for_bundle(bt) > 0 {
                    continue;
                }
            }

            let Some(source) = item.sources.iter().find(|s| s.user.cid == user.cid).cloned()
            else {
                continue;
            };
            let hub_hint = if online_hubs.iter().any(|h| *h == source.user.hub_url) {
                source.user.hub_url.clone()
            } else {
                match online_hubs.first() {
                    Some(h) => h.clone(),
                    None => continue,
                }
            };

            let small_slot = item.flags.uses_small_slot();

            // Disk space gates whole bundles, not single segments.
            if !small_slot
                && let Some(bt) = bundle_token
                && let Some(bundle) = state.bundles.get(&bt)
            {
                let remaining: u64 = bundle
                    .queue_items
                    .iter()
                    .filter_map(|t| state.items.get(t))
                    .map(|i| i.size.saturating_sub(i.downloaded.downloaded_bytes()))
                    .sum();
                match free_space_for_target(&bundle.target) {
                    Ok(free) if free < remaining => {
                        tracing::warn!(
                            bundle = bt.get(),
                            free,
                            remaining,
                            "target volume out of space, pausing bundle"
                        );
                        self.pause_bundle_for_space(&mut state, bt);
                        last_error = StartError::NoDiskSpace;
                        continue;
                    }
                    _ => {}
                }
            }

            let block = block_size_for(item.size);
            let segment = match select_segment(item, &source, chunk, block) {
                Ok(s) => s,
                Err(StartError::NoNeededParts) => {
                    // Partial source has nothing we want; demote it.
                    if let Some(item) = state.items.get_mut(&token) {
                        item.mark_bad(user, BadSourceReason::NoNeededParts);
                        let (good, bad) = (item.sources.len(), item.bad_sources.len());
                        state.user_queue.remove(&user.cid, token);
                        let _ = self.inner.event_tx.send(Event::ItemSources { token, good, bad });
                    }
                    last_error = StartError::NoNeededParts;
                    continue;
                }
                Err(e) => {
                    last_error = e;
                    continue;
                }
            };

            let priority = state
                .items
                .get(&token)
                .map(|i| i.priority)
                .unwrap_or(Priority::Normal);
            let slot = match admit_download(
                priority,
                small_slot,
                state.occupied_slots(),
                state.extra_running,
                state.current_rate_kib,
                &policy,
            ) {
                Ok(slot) => slot,
                Err(e) => {
                    last_error = e;
                    continue;
                }
            };

            let download = RunningDownload {
                token: QueueToken::next(),
                item: token,
                bundle: bundle_token,
                user: user.clone(),
                segment,
                slot,
            };
            if slot == DownloadSlotKind::Extra {
                state.extra_running += 1;
            }
            if let Some(item) = state.items.get_mut(&token) {
                item.running_segments.push(segment);
            }
            let info = StartInfo {
                item: token,
                bundle: bundle_token,
                segment,
                small_slot,
                hub_hint,
            };
            tracing::debug!(
                item = token.get(),
                start = segment.start,
                size = segment.size,
                slot = ?slot,
                "download segment assigned"
            );
            state.running.insert(download.token, download);
            return Ok(info);
        }

        Err(last_error)
    }

    /// Running transfer tokens for an item
    pub async fn running_downloads(&self, item: QueueToken) -> Vec<RunningDownload> {
        self.inner
            .state
            .read()
            .await
            .running
            .values()
            .filter(|d| d.item == item)
            .cloned()
            .collect()
    }

    fn release_slot(state: &mut super::QueueState, download: &RunningDownload) {
        if download.slot == DownloadSlotKind::Extra {
            state.extra_running = state.extra_running.saturating_sub(1);
        }
    }

    /// A connection finished its segment; merge it and finalise as needed.
    ///
    /// The transfer token is the one handed out by [`Self::get_next_download`]
    /// (via the running-download record).
    pub async fn segment_completed(&self, transfer: QueueToken) -> Result<SegmentOutcome> {
        let mut outcome = SegmentOutcome::default();
        let mut finish: Option<(QueueToken, Option<QueueToken>)> = None;

        {
            let mut state = self.inner.state.write().await;
            let Some(download) = state.running.remove(&transfer) else {
                return Ok(outcome);
            };
            Self::release_slot(&mut state, &download);

            let Some(item) = state.items.get_mut(&download.item) else {
                return Ok(outcome);
            };
            item.running_segments.retain(|s| *s != download.segment);
            item.downloaded.add(download.segment);
            item.last_source = download.user.nick.clone();
            if let Some(bundle) = download.bundle.and_then(|b| state.bundles.get_mut(&b)) {
                bundle.dirty = true;
            }

            let covered = state
                .items
                .get(&download.item)
                .is_some_and(|i| i.downloaded.covers_file(i.size));
            if covered {
                // Sibling transfers for the same item now overlap finished
                // data; drop them so the connection layer tears them down.
                let stale: Vec<QueueToken> = state
                    .running
                    .iter()
                    .filter(|(_, d)| d.item == download.item)
                    .map(|(t, _)| *t)
                    .collect();
                for t in stale {
                    if let Some(dropped) = state.running.remove(&t) {
                        Self::release_slot(&mut state, &dropped);
                        if let Some(item) = state.items.get_mut(&dropped.item) {
                            item.running_segments.retain(|s| *s != dropped.segment);
                        }
                    }
                }
                finish = Some((download.item, download.bundle));
            }
        }

        if let Some((item_token, bundle_token)) = finish {
            outcome.item_finished = true;
            self.finish_item(item_token, bundle_token).await?;
            if let Some(bt) = bundle_token {
                outcome.bundle_finished = self.maybe_finish_bundle(bt).await?;
            }
        }
        Ok(outcome)
    }

    /// A connection failed mid-segment.
    ///
    /// Bytes up to the last completed hash block are committed; the remainder
    /// below the block boundary is discarded. The source may be demoted.
    pub async fn segment_failed(
        &self,
        transfer: QueueToken,
        bytes_received: u64,
        reason: Option<BadSourceReason>,
    ) -> Result<()> {
        let mut state = self.inner.state.write().await;
        let Some(download) = state.running.remove(&transfer) else {
            return Ok(());
        };
        Self::release_slot(&mut state, &download);

        let Some(item) = state.items.get_mut(&download.item) else {
            return Ok(());
        };
        item.running_segments.retain(|s| *s != download.segment);

        let block = block_size_for(item.size);
        let committed = (bytes_received.min(download.segment.size) / block) * block;
        if committed > 0 {
            item.downloaded.add(Segment::new(download.segment.start, committed));
            tracing::debug!(
                item = download.item.get(),
                committed,
                discarded = bytes_received.saturating_sub(committed),
                "partial segment committed to block boundary"
            );
        }

        if let Some(reason) = reason {
            item.mark_bad(&download.user, reason);
            let (good, bad) = (item.sources.len(), item.bad_sources.len());
            state.user_queue.remove(&download.user.cid, download.item);
            let _ = self.inner.event_tx.send(Event::ItemSources {
                token: download.item,
                good,
                bad,
            });
        }
        if let Some(bundle) = download.bundle.and_then(|b| state.bundles.get_mut(&b)) {
            bundle.dirty = true;
        }
        Ok(())
    }

    async fn finish_item(
        &self,
        item_token: QueueToken,
        bundle_token: Option<QueueToken>,
    ) -> Result<()> {
        let (temp, target) = {
            let mut state = self.inner.state.write().await;
            let Some(item) = state.items.get_mut(&item_token) else {
                return Ok(());
            };
            item.status = QueueItemStatus::Downloaded;
            let pair = (item.temp_target.clone(), item.target.clone());
            if let Some(bundle) = bundle_token.and_then(|b| state.bundles.get_mut(&b)) {
                bundle.finish_item(item_token);
            }
            pair
        };
        self.emit_item_status(item_token, QueueItemStatus::Downloaded);

        // Move the temp file into place without holding the lock.
        if temp != target && tokio::fs::metadata(&temp).await.is_ok() {
            move_file(&temp, &target).await?;
        }

        {
            let mut state = self.inner.state.write().await;
            if let Some(item) = state.items.get_mut(&item_token) {
                item.status = QueueItemStatus::Completed;
            }
        }
        let _ = self.inner.event_tx.send(Event::ItemFinished {
            token: item_token,
            bundle: bundle_token,
            target,
        });
        Ok(())
    }

    async fn maybe_finish_bundle(&self, bundle_token: QueueToken) -> Result<bool> {
        let (completion, file_bundle) = {
            let mut state = self.inner.state.write().await;
            let Some(bundle) = state.bundles.get_mut(&bundle_token) else {
                return Ok(false);
            };
            if !bundle.queue_items.is_empty() || bundle.is_downloaded() {
                return Ok(false);
            }
            bundle.set_status(BundleStatus::Downloaded);
            bundle.time_finished = now_secs();
            (
                BundleCompletion {
                    bundle: bundle_token,
                    target: bundle.target.clone(),
                },
                bundle.file_bundle,
            )
        };
        self.emit_bundle_status(bundle_token, BundleStatus::Downloaded);

        // Completion hooks run outside the lock; a rejection parks the bundle
        // in ValidationError until the next successful run.
        {
            let mut state = self.inner.state.write().await;
            if let Some(bundle) = state.bundles.get_mut(&bundle_token) {
                bundle.set_status(BundleStatus::ValidationRunning);
            }
        }
        self.emit_bundle_status(bundle_token, BundleStatus::ValidationRunning);

        let hook_result = self.inner.completion_hooks.run_hooks(&completion).await;
        let mut state = self.inner.state.write().await;
        let Some(bundle) = state.bundles.get_mut(&bundle_token) else {
            return Ok(false);
        };
        match hook_result {
            Ok(_) => {
                bundle.hook_error = None;
                bundle.set_status(BundleStatus::Downloaded);
                bundle.set_status(BundleStatus::Completed);
                let target = bundle.target.clone();
                drop(state);
                self.emit_bundle_status(bundle_token, BundleStatus::Completed);
                self.save_bundle_now(bundle_token).await;
                if let Some(share) = self.share() {
                    use crate::share::refresh::{RefreshKind, RefreshPriority};
                    let dir = if file_bundle {
                        target.parent().map(Path::to_path_buf).unwrap_or(target)
                    } else {
                        target
                    };
                    if let Err(e) =
                        share.refresh(vec![dir], RefreshPriority::Scheduled, RefreshKind::Bundle)
                    {
                        tracing::debug!(error = %e, "bundle share refresh not queued");
                    }
                }
                Ok(true)
            }
            Err(rejection) => {
                tracing::warn!(
                    bundle = bundle_token.get(),
                    hook = rejection.hook_id,
                    "bundle completion hook rejected"
                );
                bundle.hook_error = Some(rejection);
                bundle.set_status(BundleStatus::ValidationError);
                drop(state);
                self.emit_bundle_status(bundle_token, BundleStatus::ValidationError);
                Ok(false)
            }
        }
    }

    /// After a share refresh, flip completed bundles whose content is now
    /// indexed to `Shared`
    pub async fn promote_shared_bundles(&self) {
        let Some(share) = self.share() else {
            return;
        };
        let candidates: Vec<(QueueToken, std::path::PathBuf)> = {
            let state = self.inner.state.read().await;
            state
                .bundles
                .values()
                .filter(|b| b.status == BundleStatus::Completed)
                .map(|b| {
                    let probe = b
                        .finished_items
                        .first()
                        .and_then(|t| state.items.get(t))
                        .map(|i| i.target.clone())
                        .unwrap_or_else(|| b.target.clone());
                    (b.token, probe)
                })
                .collect()
        };
        for (token, probe) in candidates {
            if share.is_real_path_shared(&probe).await {
                self.mark_bundle_shared(token).await;
            }
        }
    }

    /// Mark a completed bundle as shared (content index picked it up)
    pub async fn mark_bundle_shared(&self, bundle_token: QueueToken) {
        let changed = {
            let mut state = self.inner.state.write().await;
            state
                .bundles
                .get_mut(&bundle_token)
                .is_some_and(|b| b.set_status(BundleStatus::Shared))
        };
        if changed {
            self.emit_bundle_status(bundle_token, BundleStatus::Shared);
        }
    }

    fn pause_bundle_for_space(&self, state: &mut super::QueueState, bundle_token: QueueToken) {
        let Some(bundle) = state.bundles.get_mut(&bundle_token) else {
            return;
        };
        if bundle.status == BundleStatus::DownloadError {
            return;
        }
        bundle.set_status(BundleStatus::DownloadError);
        bundle.priority = Priority::PausedForce;
        bundle.dirty = true;
        let items: Vec<QueueToken> = bundle.queue_items.clone();
        self.emit_bundle_status(bundle_token, BundleStatus::DownloadError);
        let _ = self.inner.event_tx.send(Event::BundlePriority {
            token: bundle_token,
            priority: Priority::PausedForce,
        });
        for t in items {
            if let Some(item) = state.items.get_mut(&t) {
                item.priority = Priority::PausedForce;
            }
            state.user_queue.reprioritize(t, Priority::PausedForce);
        }
    }

    /// Minute tick: resume bundles paused for disk space once room returns
    pub async fn resume_space_errors(&self) {
        let mut resumed = Vec::new();
        {
            let mut state = self.inner.state.write().await;
            let paused: Vec<QueueToken> = state
                .bundles
                .values()
                .filter(|b| b.status == BundleStatus::DownloadError)
                .map(|b| b.token)
                .collect();
            for token in paused {
                let (target, remaining) = {
                    let Some(bundle) = state.bundles.get(&token) else {
                        continue;
                    };
                    let remaining: u64 = bundle
                        .queue_items
                        .iter()
                        .filter_map(|t| state.items.get(t))
                        .map(|i| i.size.saturating_sub(i.downloaded.downloaded_bytes()))
                        .sum();
                    (bundle.target.clone(), remaining)
                };
                if free_space_for_target(&target).map(|f| f >= remaining).unwrap_or(false) {
                    let Some(bundle) = state.bundles.get_mut(&token) else {
                        continue;
                    };
                    bundle.set_status(BundleStatus::Queued);
                    bundle.priority = Priority::Normal;
                    bundle.dirty = true;
                    let items = bundle.queue_items.clone();
                    for t in items {
                        if let Some(item) = state.items.get_mut(&t) {
                            item.priority = Priority::Normal;
                        }
                        state.user_queue.reprioritize(t, Priority::Normal);
                    }
                    resumed.push(token);
                    tracing::info!(bundle = token.get(), "disk space restored, bundle resumed");
                }
            }
        }
        for token in resumed {
            self.emit_bundle_status(token, BundleStatus::Queued);
            let _ = self.inner.event_tx.send(Event::BundlePriority {
                token,
                priority: Priority::Normal,
            });
        }
    }
}

/// Rename with a copy fallback for cross-volume moves
async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => {
            tracing::debug!(from = %from.display(), to = %to.display(), "cross-volume move");
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn is_cross_device(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::EXDEV)
}

#[cfg(windows)]
fn is_cross_device(e: &std::io::Error) -> bool {
    // ERROR_NOT_SAME_DEVICE
    e.raw_os_error() == Some(17)
}
