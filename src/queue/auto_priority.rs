//! Auto-priority.
//!
//! Two strategies, selected in [`crate::config::QueueConfig::auto_priority`]:
//! progress mode steps each item's priority by its downloaded fraction;
//! balanced mode scores whole bundles from their current speed and source
//! count and partitions them into three tiers.

use std::collections::HashMap;

use crate::config::AutoPriorityMode;
use crate::types::{Priority, QueueToken};

use super::QueueManager;

/// Priority for a downloaded fraction (progress mode)
pub fn progress_priority(fraction: f64) -> Priority {
    if fraction < 0.30 {
        Priority::Low
    } else if fraction < 0.80 {
        Priority::Normal
    } else {
        Priority::High
    }
}

/// Tier assignment for balanced mode: scores sorted descending split into
/// three equal tiers (High, Normal, Low); equal scores always share a tier.
pub fn balanced_tiers(scores: &[(QueueToken, u32)]) -> Vec<(QueueToken, Priority)> {
    if scores.is_empty() {
        return Vec::new();
    }
    let mut sorted: Vec<(QueueToken, u32)> = scores.to_vec();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let n = sorted.len();
    let tier_size = n.div_ceil(3);
    let mut out = Vec::with_capacity(n);
    let mut idx = 0usize;
    for (tier, priority) in [Priority::High, Priority::Normal, Priority::Low]
        .into_iter()
        .enumerate()
    {
        let mut end = ((tier + 1) * tier_size).min(n);
        // Never split a run of identical scores across tiers.
        while end > idx && end < n && sorted[end].1 == sorted[end - 1].1 {
            end += 1;
        }
        while idx < end {
            out.push((sorted[idx].0, priority));
            idx += 1;
        }
        if idx >= n {
            break;
        }
    }
    out
}

impl QueueManager {
    /// Report a bundle's observed download rate (for balanced mode)
    pub async fn report_bundle_rate(&self, bundle: QueueToken, kib_per_sec: u64) {
        self.inner
            .state
            .write()
            .await
            .bundle_rates
            .insert(bundle, kib_per_sec);
    }

    /// Run one auto-priority pass; called on the configured interval
    pub async fn run_auto_priority(&self) {
        match self.inner.config.queue.auto_priority {
            AutoPriorityMode::Disabled => {}
            AutoPriorityMode::Progress => self.run_progress_priorities().await,
            AutoPriorityMode::Balanced => self.run_balanced_priorities().await,
        }
    }

    async fn run_progress_priorities(&self) {
        let updates: Vec<(QueueToken, Priority)> = {
            let state = self.inner.state.read().await;
            state
                .items
                .values()
                .filter(|i| i.auto_priority && !i.is_paused() && !i.is_downloaded())
                .map(|i| (i.token, progress_priority(i.progress())))
                .filter(|(t, p)| {
                    state
                        .items
                        .get(t)
                        .is_some_and(|i| i.priority != *p)
                })
                .collect()
        };
        if updates.is_empty() {
            return;
        }
        let mut state = self.inner.state.write().await;
        for (token, priority) in updates {
            let _ = self.set_item_priority_locked(&mut state, token, priority, true);
        }
    }

    async fn run_balanced_priorities(&self) {
        let scores: Vec<(QueueToken, u32)> = {
            let state = self.inner.state.read().await;
            let eligible: Vec<&super::bundle::Bundle> = state
                .bundles
                .values()
                .filter(|b| b.auto_priority && !b.is_paused() && !b.is_downloaded())
                .collect();
            if eligible.len() < 2 {
                return;
            }

            let rates: HashMap<QueueToken, u64> = eligible
                .iter()
                .map(|b| (b.token, state.bundle_rates.get(&b.token).copied().unwrap_or(0)))
                .collect();
            let sources: HashMap<QueueToken, usize> = eligible
                .iter()
                .map(|b| {
                    let n = b
                        .queue_items
                        .iter()
                        .filter_map(|t| state.items.get(t))
                        .map(|i| i.sources.len())
                        .sum();
                    (b.token, n)
                })
                .collect();

            let max_rate = rates.values().copied().max().unwrap_or(0).max(1);
            let max_sources = sources.values().copied().max().unwrap_or(0).max(1);

            eligible
                .iter()
                .map(|b| {
                    let speed_score = (rates[&b.token] * 100 / max_rate) as u32;
                    let source_score = (sources[&b.token] * 100 / max_sources) as u32;
                    (b.token, (speed_score + source_score) / 2)
                })
                .collect()
        };

        let tiers = balanced_tiers(&scores);
        let mut state = self.inner.state.write().await;
        for (token, priority) in tiers {
            let _ = self.set_bundle_priority_locked(&mut state, token, priority, true);
        }
    }
}
