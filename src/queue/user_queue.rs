//! Per-user queue index.
//!
//! Maps each source user to their queued items bucketed by priority, so
//! source selection can walk a user's queue from `Highest` down without
//! touching unrelated items. Items enter the index when the user becomes a
//! good source and leave when the source is demoted or removed.

use std::collections::HashMap;

use crate::types::{Cid, Priority, QueueToken};

/// Priority-bucketed per-user item index
#[derive(Debug, Default)]
pub struct UserQueue {
    /// user → priority bucket → item tokens in insertion order
    queues: HashMap<Cid, HashMap<Priority, Vec<QueueToken>>>,
}

impl UserQueue {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an item under a user
    pub fn add(&mut self, user: Cid, priority: Priority, item: QueueToken) {
        let bucket = self.queues.entry(user).or_default().entry(priority).or_default();
        if !bucket.contains(&item) {
            bucket.push(item);
        }
    }

    /// Remove an item from one user's buckets
    pub fn remove(&mut self, user: &Cid, item: QueueToken) {
        if let Some(buckets) = self.queues.get_mut(user) {
            for bucket in buckets.values_mut() {
                bucket.retain(|t| *t != item);
            }
            buckets.retain(|_, b| !b.is_empty());
            if buckets.is_empty() {
                self.queues.remove(user);
            }
        }
    }

    /// Remove an item from every user's buckets
    pub fn remove_item(&mut self, item: QueueToken) {
        let users: Vec<Cid> = self.queues.keys().copied().collect();
        for user in users {
            self.remove(&user, item);
        }
    }

    /// Move an item to a different priority bucket for every user holding it
    pub fn reprioritize(&mut self, item: QueueToken, new_priority: Priority) {
        for buckets in self.queues.values_mut() {
            let mut present = false;
            for bucket in buckets.values_mut() {
                let before = bucket.len();
                bucket.retain(|t| *t != item);
                present |= bucket.len() != before;
            }
            if present {
                buckets.entry(new_priority).or_default().push(item);
            }
            buckets.retain(|_, b| !b.is_empty());
        }
    }

    /// The user's queued items from `Highest` down, skipping paused buckets
    pub fn candidates(&self, user: &Cid) -> Vec<QueueToken> {
        const ORDER: [Priority; 5] = [
            Priority::Highest,
            Priority::High,
            Priority::Normal,
            Priority::Low,
            Priority::Lowest,
        ];
        let Some(buckets) = self.queues.get(user) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for prio in ORDER {
            if let Some(bucket) = buckets.get(&prio) {
                out.extend(bucket.iter().copied());
            }
        }
        out
    }

    /// Does the user have anything queued?
    pub fn has_user(&self, user: &Cid) -> bool {
        self.queues.contains_key(user)
    }

    /// Users currently holding queued items
    pub fn user_count(&self) -> usize {
        self.queues.len()
    }
}
