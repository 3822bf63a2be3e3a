//! Paced alternate-search rotation for bundles.
//!
//! Each live bundle takes turns searching for new sources. One bundle is
//! popped per tick, the least-recently-searched first, gated by the
//! configured interval (halved for bundles younger than five minutes). Within
//! the chosen bundle up to five representative files are picked: items are
//! grouped by their release-style directory and one item per group is chosen
//! by the longest meaningful name, which is the least likely to collide with
//! unrelated files.

use std::collections::HashMap;

use crate::tth::Tth;
use crate::types::{QueueItemStatus, QueueToken};
use crate::utils::{meaningful_directory, meaningful_name_len, now_secs};

use super::QueueManager;

/// How many representative files one search round covers
const MAX_SEARCH_ITEMS: usize = 5;

/// Bundles younger than this are "recent" and search twice as often
const RECENT_BUNDLE_SECS: i64 = 5 * 60;

/// One file picked for an alternate-search round
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchItem {
    /// Item token
    pub item: QueueToken,
    /// Content hash to search for
    pub tth: Tth,
    /// File name, for logging
    pub name: String,
}

impl QueueManager {
    /// Pop the next bundle due for an alternate search, if any.
    ///
    /// Returns the bundle token and its representative files. At most one
    /// bundle is returned per call; the caller invokes this once per tick.
    pub async fn next_search(&self, now_ms: u64) -> Option<(QueueToken, Vec<SearchItem>)> {
        let interval_ms = self.inner.config.queue.bundle_search_secs * 1000;
        let mut state = self.inner.state.write().await;

        let now_secs = now_secs();
        let due = state
            .bundles
            .values()
            .filter(|b| b.can_download() && !b.queue_items.is_empty())
            .filter(|b| {
                let recent = now_secs - b.added < RECENT_BUNDLE_SECS;
                let wait = if recent { interval_ms / 2 } else { interval_ms };
                now_ms >= b.last_search_ms + wait
            })
            .min_by_key(|b| b.last_search_ms)
            .map(|b| b.token)?;

        let items = {
            let bundle = state.bundles.get(&due)?;
            let candidates: Vec<SearchItem> = bundle
                .queue_items
                .iter()
                .filter_map(|t| state.items.get(t))
                .filter(|i| i.status == QueueItemStatus::Queued && !i.is_paused())
                .map(|i| SearchItem {
                    item: i.token,
                    tth: i.tth,
                    name: i
                        .target
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                })
                .collect();
            pick_search_items(
                candidates
                    .into_iter()
                    .map(|si| {
                        let parent = state
                            .items
                            .get(&si.item)
                            .and_then(|i| i.target.parent().map(std::path::Path::to_path_buf))
                            .unwrap_or_default();
                        (parent, si)
                    })
                    .collect(),
            )
        };

        if let Some(bundle) = state.bundles.get_mut(&due) {
            bundle.last_search_ms = now_ms;
        }
        if items.is_empty() {
            return None;
        }
        tracing::debug!(bundle = due.get(), files = items.len(), "alternate search round");
        Some((due, items))
    }
}

/// Group candidates by release directory and keep the best representative of
/// each group, up to [`MAX_SEARCH_ITEMS`]
fn pick_search_items(candidates: Vec<(std::path::PathBuf, SearchItem)>) -> Vec<SearchItem> {
    let mut groups: HashMap<String, SearchItem> = HashMap::new();
    for (parent, item) in candidates {
        let (group, _) = meaningful_directory(&parent);
        let entry = groups.entry(group.to_lowercase());
        match entry {
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                if meaningful_name_len(&item.name) > meaningful_name_len(&slot.get().name) {
                    slot.insert(item);
                }
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(item);
            }
        }
    }
    let mut out: Vec<SearchItem> = groups.into_values().collect();
    out.sort_by(|a, b| {
        meaningful_name_len(&b.name)
            .cmp(&meaningful_name_len(&a.name))
            .then_with(|| a.item.cmp(&b.item))
    });
    out.truncate(MAX_SEARCH_ITEMS);
    out
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::tth::hash_buffer;
    use std::path::PathBuf;

    fn si(name: &str) -> SearchItem {
        SearchItem {
            item: QueueToken::next(),
            tth: hash_buffer(name.as_bytes()).root(),
            name: name.into(),
        }
    }

    #[test]
    fn one_item_per_release_directory() {
        let picked = pick_search_items(vec![
            (PathBuf::from("/d/Rel.A-GRP"), si("Some.Long.Episode.Name.mkv")),
            (PathBuf::from("/d/Rel.A-GRP"), si("part01.rar")),
            (PathBuf::from("/d/Rel.B-GRP"), si("other.file.mkv")),
        ]);
        assert_eq!(picked.len(), 2);
        assert!(picked.iter().any(|s| s.name == "Some.Long.Episode.Name.mkv"));
        assert!(picked.iter().any(|s| s.name == "other.file.mkv"));
    }

    #[test]
    fn generic_subdirs_collapse_into_their_release() {
        let picked = pick_search_items(vec![
            (PathBuf::from("/d/Rel.A-GRP/CD1"), si("a.descriptive.name.bin")),
            (PathBuf::from("/d/Rel.A-GRP/CD2"), si("b.bin")),
        ]);
        assert_eq!(picked.len(), 1, "CD1/CD2 belong to the same release");
    }

    #[test]
    fn longest_meaningful_name_wins_the_group() {
        let picked = pick_search_items(vec![
            (PathBuf::from("/d/R-GRP"), si("part07.rar")),
            (PathBuf::from("/d/R-GRP"), si("The.Actual.Release.Name.Episode.mkv")),
        ]);
        assert_eq!(picked[0].name, "The.Actual.Release.Name.Episode.mkv");
    }

    #[test]
    fn at_most_five_groups_are_searched() {
        let candidates: Vec<_> = (0..9)
            .map(|i| {
                (
                    PathBuf::from(format!("/d/Rel.{i}-GRP")),
                    si(&format!("file{i}.with.a.name.mkv")),
                )
            })
            .collect();
        assert_eq!(pick_search_items(candidates).len(), MAX_SEARCH_ITEMS);
    }
}
