//! Append-only conversation history.
//!
//! [`ConversationHistory`] is the single source of truth for what has been said. The only
//! mutator is [`append`](ConversationHistory::append); readers always receive an owned
//! copy, so nothing outside this type can reorder or edit past messages.

use crate::roundtable::message::Message;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
pub struct ConversationHistory {
    messages: RwLock<Vec<Message>>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Message>> {
        self.messages.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Message>> {
        self.messages.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a message and return the new length.
    pub fn append(&self, message: Message) -> usize {
        let mut messages = self.write();
        messages.push(message);
        messages.len()
    }

    /// Copy of every message, oldest first.
    pub fn snapshot(&self) -> Vec<Message> {
        self.read().clone()
    }

    /// Copy of the most recent message.
    pub fn last(&self) -> Option<Message> {
        self.read().last().cloned()
    }

    /// Author id of the most recent message.
    pub fn last_author(&self) -> Option<String> {
        self.read().last().map(|m| m.agent_id.clone())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
