//! Outgoing search pacing.
//!
//! Searches queue up and leave at most once per configured interval, highest
//! priority first, FIFO within a priority. The queue drains when the session
//! leaves the logged-in state.

use std::collections::VecDeque;

use crate::share::SearchQuery;

/// A queued outbound search
#[derive(Clone, Debug)]
pub struct PendingSearch {
    /// Scheduling priority; higher pops first
    pub priority: u8,
    /// Opaque token echoed in responses
    pub token: String,
    /// The query itself
    pub query: SearchQuery,
}

/// Min-interval outbound search queue
#[derive(Debug)]
pub struct SearchQueue {
    min_interval_ms: u64,
    last_sent_ms: u64,
    pending: VecDeque<PendingSearch>,
}

impl SearchQueue {
    /// Create a queue with the given minimum send interval
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            min_interval_ms,
            last_sent_ms: 0,
            pending: VecDeque::new(),
        }
    }

    /// Append a search
    pub fn queue(&mut self, search: PendingSearch) {
        self.pending.push_back(search);
    }

    /// Pop the highest-priority due search, if the interval has elapsed
    pub fn maybe_pop(&mut self, now_ms: u64) -> Option<PendingSearch> {
        if self.pending.is_empty() {
            return None;
        }
        if now_ms < self.last_sent_ms + self.min_interval_ms {
            return None;
        }
        let best = self
            .pending
            .iter()
            .enumerate()
            .max_by_key(|(i, s)| (s.priority, usize::MAX - i))?
            .0;
        let search = self.pending.remove(best)?;
        self.last_sent_ms = now_ms;
        Some(search)
    }

    /// Number of queued searches
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop everything (session left the logged-in state)
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn search(priority: u8, token: &str) -> PendingSearch {
        PendingSearch {
            priority,
            token: token.into(),
            query: SearchQuery::default(),
        }
    }

    #[test]
    fn pops_respect_the_minimum_interval() {
        let mut q = SearchQueue::new(5000);
        q.queue(search(0, "a"));
        q.queue(search(0, "b"));

        assert_eq!(q.maybe_pop(10_000).unwrap().token, "a");
        assert!(q.maybe_pop(14_999).is_none(), "interval not yet elapsed");
        assert_eq!(q.maybe_pop(15_000).unwrap().token, "b");
    }

    #[test]
    fn higher_priority_jumps_the_queue() {
        let mut q = SearchQueue::new(1000);
        q.queue(search(0, "low"));
        q.queue(search(5, "high"));
        assert_eq!(q.maybe_pop(10_000).unwrap().token, "high");
        assert_eq!(q.maybe_pop(20_000).unwrap().token, "low");
    }

    #[test]
    fn equal_priorities_pop_fifo() {
        let mut q = SearchQueue::new(0);
        q.queue(search(1, "first"));
        q.queue(search(1, "second"));
        assert_eq!(q.maybe_pop(1).unwrap().token, "first");
        assert_eq!(q.maybe_pop(2).unwrap().token, "second");
    }

    #[test]
    fn clear_discards_pending_searches() {
        let mut q = SearchQueue::new(0);
        q.queue(search(0, "gone"));
        q.clear();
        assert!(q.maybe_pop(10_000).is_none());
    }
}
