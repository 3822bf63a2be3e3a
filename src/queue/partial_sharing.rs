//! Partial-bundle discovery (PBD).
//!
//! When a peer's search misses our share but hits a queued item, we answer
//! with a PBD notification carrying our bundle token. Peers then exchange
//! finished-file hashes and subscribe to completion updates: every finished
//! piece triggers a `UP1` notification to subscribers, and a peer whose
//! bundle completes sends `RM1` to drop its subscription.

use crate::tth::Tth;
use crate::types::{HintedUser, QueueToken};

use super::QueueManager;

/// Outbound PBD notification for a queued hash
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PbdNotify {
    /// The matched hash
    pub tth: Tth,
    /// Our bundle token the peer should reference
    pub bundle: QueueToken,
    /// We already have finished files to offer
    pub has_finished_files: bool,
    /// We want completion updates from the peer
    pub wants_updates: bool,
}

/// Outbound `UP1` update for one subscriber
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PbdUpdate {
    /// Subscriber to notify
    pub user: HintedUser,
    /// The subscriber's bundle token on their side
    pub remote_bundle: u32,
    /// Hashes of our finished files
    pub finished: Vec<Tth>,
}

impl QueueManager {
    /// A peer searched for a hash we have queued (not shared). Build the PBD
    /// answer, or `None` when nothing is queued under the hash.
    pub async fn pbd_for_search(&self, tth: &Tth) -> Option<PbdNotify> {
        let state = self.inner.state.read().await;
        let item_token = state.tth_to_items.get(tth)?.first()?;
        let item = state.items.get(item_token)?;
        let bundle_token = item.bundle?;
        let bundle = state.bundles.get(&bundle_token)?;
        if bundle.is_completed() {
            return None;
        }
        Some(PbdNotify {
            tth: *tth,
            bundle: bundle_token,
            has_finished_files: !bundle.finished_items.is_empty(),
            wants_updates: true,
        })
    }

    /// A peer asked to follow one of our bundles (`PBD` with update flag)
    pub async fn pbd_subscribe(
        &self,
        bundle: QueueToken,
        user: HintedUser,
        remote_bundle: u32,
    ) -> bool {
        let mut state = self.inner.state.write().await;
        if !state.bundles.contains_key(&bundle) {
            return false;
        }
        let subs = state.pbd_subscribers.entry(bundle).or_default();
        if subs.iter().any(|(u, _)| u.cid == user.cid) {
            return false;
        }
        tracing::debug!(bundle = bundle.get(), peer = %user.nick, "PBD subscriber added");
        subs.push((user, remote_bundle));
        true
    }

    /// A peer's bundle completed (`RM1`); drop its subscription
    pub async fn pbd_unsubscribe(&self, bundle: QueueToken, user: &HintedUser) -> bool {
        let mut state = self.inner.state.write().await;
        let Some(subs) = state.pbd_subscribers.get_mut(&bundle) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|(u, _)| u.cid != user.cid);
        let removed = subs.len() != before;
        if subs.is_empty() {
            state.pbd_subscribers.remove(&bundle);
        }
        removed
    }

    /// Finished-file hashes of a bundle, for the PBD list exchange
    pub async fn pbd_finished_tths(&self, bundle: QueueToken) -> Vec<Tth> {
        let state = self.inner.state.read().await;
        let Some(b) = state.bundles.get(&bundle) else {
            return Vec::new();
        };
        b.finished_items
            .iter()
            .filter_map(|t| state.items.get(t))
            .map(|i| i.tth)
            .collect()
    }

    /// A piece of ours completed; produce the `UP1` notifications to send
    pub async fn pbd_updates_for(&self, bundle: QueueToken) -> Vec<PbdUpdate> {
        let state = self.inner.state.read().await;
        let Some(subs) = state.pbd_subscribers.get(&bundle) else {
            return Vec::new();
        };
        let finished: Vec<Tth> = state
            .bundles
            .get(&bundle)
            .map(|b| {
                b.finished_items
                    .iter()
                    .filter_map(|t| state.items.get(t))
                    .map(|i| i.tth)
                    .collect()
            })
            .unwrap_or_default();
        subs.iter()
            .map(|(user, remote)| PbdUpdate {
                user: user.clone(),
                remote_bundle: *remote,
                finished: finished.clone(),
            })
            .collect()
    }

    /// Our bundle completed; subscribers to tell goodbye (`RM1`), then forget
    pub async fn pbd_finalize(&self, bundle: QueueToken) -> Vec<HintedUser> {
        let mut state = self.inner.state.write().await;
        state
            .pbd_subscribers
            .remove(&bundle)
            .map(|subs| subs.into_iter().map(|(u, _)| u).collect())
            .unwrap_or_default()
    }
}
