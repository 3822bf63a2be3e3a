//! Per-hub message cache.
//!
//! A bounded ring of the most recent chat and status messages, re-delivered
//! to newly-attaching UI readers and used for unread counts.

use std::collections::VecDeque;

use crate::types::{ChatMessage, StatusMessage};

/// One cached entry
#[derive(Clone, Debug)]
pub enum CachedMessage {
    /// Chat or private message
    Chat(ChatMessage),
    /// Status line
    Status(StatusMessage),
}

/// Bounded message ring
#[derive(Debug)]
pub struct MessageCache {
    capacity: usize,
    messages: VecDeque<CachedMessage>,
}

impl MessageCache {
    /// Create a cache holding at most `capacity` messages
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            messages: VecDeque::new(),
        }
    }

    /// Append a chat message, evicting the oldest entry when full
    pub fn push_chat(&mut self, message: ChatMessage) {
        self.push(CachedMessage::Chat(message));
    }

    /// Append a status message
    pub fn push_status(&mut self, message: StatusMessage) {
        self.push(CachedMessage::Status(message));
    }

    fn push(&mut self, entry: CachedMessage) {
        if self.messages.len() == self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(entry);
    }

    /// All cached messages, oldest first
    pub fn messages(&self) -> impl Iterator<Item = &CachedMessage> {
        self.messages.iter()
    }

    /// Chat messages not yet marked read
    pub fn unread_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| matches!(m, CachedMessage::Chat(c) if !c.read))
            .count()
    }

    /// Mark every cached chat message read; returns how many changed
    pub fn mark_read(&mut self) -> usize {
        let mut changed = 0;
        for entry in &mut self.messages {
            if let CachedMessage::Chat(chat) = entry
                && !chat.read
            {
                chat.read = true;
                changed += 1;
            }
        }
        changed
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
