//! Full-file integrity recheck.
//!
//! Re-hashes a queued file's temp data block by block against the stored hash
//! tree and replaces the downloaded segment set with exactly the set of
//! verified blocks. Bytes that were previously counted done but fail
//! verification are reported as failed.

use crate::error::{QueueError, Result};
use crate::hasher::verify_file_blocks;
use crate::segment::Segment;
use crate::tth::TigerTree;
use crate::types::{BundleStatus, Event, Priority, QueueItemStatus, QueueToken};

use super::QueueManager;

/// Result of one item's recheck
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecheckResult {
    /// Bytes previously marked done that failed verification
    pub failed_bytes: u64,
    /// The item completed during the recheck
    pub completed: bool,
}

impl QueueManager {
    /// Store a hash tree negotiated for an in-progress file
    pub async fn store_tree(&self, tree: TigerTree) {
        self.inner.trees.write().await.insert(tree.root(), tree);
    }

    /// Verify one received block against the stored tree.
    ///
    /// `None` when no tree is known for the hash.
    pub async fn verify_block(&self, tth: &crate::tth::Tth, index: usize, data: &[u8]) -> Option<bool> {
        self.inner
            .trees
            .read()
            .await
            .get(tth)
            .map(|tree| tree.verify_block(index, data))
    }

    /// Recheck every item of a bundle. Returns total failed bytes.
    pub async fn recheck_bundle(&self, bundle: QueueToken) -> Result<u64> {
        let items: Vec<QueueToken> = {
            let mut state = self.inner.state.write().await;
            let b = state
                .bundles
                .get_mut(&bundle)
                .ok_or(QueueError::NotFound { token: bundle })?;
            b.set_status(BundleStatus::Recheck);
            b.queue_items.clone()
        };
        self.emit_bundle_status(bundle, BundleStatus::Recheck);

        let mut total_failed = 0u64;
        for item in items {
            match self.recheck_item(item).await {
                Ok(r) => total_failed += r.failed_bytes,
                Err(e) => tracing::warn!(item = item.get(), error = %e, "recheck failed"),
            }
        }

        {
            let mut state = self.inner.state.write().await;
            if let Some(b) = state.bundles.get_mut(&bundle) {
                b.set_status(BundleStatus::Queued);
            }
        }
        self.emit_bundle_status(bundle, BundleStatus::Queued);
        Ok(total_failed)
    }

    /// Recheck one item against its stored tree.
    ///
    /// The item is force-paused for the duration; it stays paused afterwards
    /// unless the recheck completed it.
    pub async fn recheck_item(&self, token: QueueToken) -> Result<RecheckResult> {
        // Pause and snapshot under the lock; hashing runs outside it.
        let (temp_target, size, tth, previously_done, bundle_token) = {
            let mut state = self.inner.state.write().await;
            let item = state
                .items
                .get_mut(&token)
                .ok_or(QueueError::NotFound { token })?;
            if item.status != QueueItemStatus::Queued {
                return Err(QueueError::InvalidState {
                    token,
                    operation: "recheck".into(),
                }
                .into());
            }
            if !item.running_segments.is_empty() {
                return Err(QueueError::InvalidState {
                    token,
                    operation: "recheck with running downloads".into(),
                }
                .into());
            }
            item.priority = Priority::PausedForce;
            state.user_queue.reprioritize(token, Priority::PausedForce);
            let item = &state.items[&token];
            (
                item.temp_target.clone(),
                item.size,
                item.tth,
                item.downloaded.clone(),
                item.bundle,
            )
        };
        let _ = self.inner.event_tx.send(Event::ItemPriority {
            token,
            priority: Priority::PausedForce,
        });

        let tree = {
            let trees = self.inner.trees.read().await;
            trees.get(&tth).cloned()
        };
        let Some(tree) = tree else {
            tracing::warn!(item = token.get(), "recheck aborted, no full tree stored");
            return Err(QueueError::NoFullTree { path: temp_target }.into());
        };

        // The size must match before hashing; grow or truncate the temp file.
        if let Ok(meta) = tokio::fs::metadata(&temp_target).await
            && meta.len() != size
        {
            tracing::debug!(
                item = token.get(),
                on_disk = meta.len(),
                expected = size,
                "adjusting temp file size before recheck"
            );
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&temp_target)
                .await?;
            file.set_len(size).await?;
        }

        let verification = verify_file_blocks(&temp_target, &tree).await?;
        let block = tree.block_size();

        let verified_segments = verification.verified.iter().map(|&i| {
            let start = i as u64 * block;
            Segment::new(start, block.min(size - start))
        });

        // Failed bytes: blocks that fail now but were counted done before.
        let mut failed_bytes = 0u64;
        for &i in &verification.failed {
            let start = i as u64 * block;
            if start >= size {
                continue;
            }
            let range = Segment::new(start, block.min(size - start));
            if previously_done.covers_range(&range) {
                failed_bytes += range.size;
            }
        }

        let completed = {
            let mut state = self.inner.state.write().await;
            let Some(item) = state.items.get_mut(&token) else {
                return Ok(RecheckResult::default());
            };
            item.downloaded.replace(verified_segments);
            item.downloaded.covers_file(size)
        };

        tracing::info!(
            item = token.get(),
            verified = verification.verified.len(),
            failed = verification.failed.len(),
            failed_bytes,
            "recheck finished"
        );
        let _ = self.inner.event_tx.send(Event::RecheckCompleted {
            token,
            failed_bytes,
        });

        if completed {
            // Everything verified: finish the file like a normal download.
            let outcome = {
                let state = self.inner.state.read().await;
                state.items.contains_key(&token)
            };
            if outcome {
                self.finish_after_recheck(token, bundle_token).await?;
            }
        }

        Ok(RecheckResult {
            failed_bytes,
            completed,
        })
    }

    async fn finish_after_recheck(
        &self,
        token: QueueToken,
        bundle_token: Option<QueueToken>,
    ) -> Result<()> {
        // Reuse the normal completion path by simulating an empty transfer.
        let transfer = {
            let mut state = self.inner.state.write().await;
            let download = super::RunningDownload {
                token: QueueToken::next(),
                item: token,
                bundle: bundle_token,
                user: crate::types::HintedUser::new(
                    crate::types::Cid([0; 24]),
                    "recheck",
                    "",
                ),
                segment: Segment::new(0, 0),
                slot: super::selection::DownloadSlotKind::Small,
            };
            let t = download.token;
            state.running.insert(t, download);
            t
        };
        self.segment_completed(transfer).await?;
        Ok(())
    }
}
