//! In-process conversation store.
//!
//! Conversations are created on first use, kept in memory, and reaped
//! least-recently-used once the store grows past its capacity.

use std::sync::Arc;

use dashmap::DashMap;

use crate::conversation::Conversation;

/// Keyed conversation store with LRU reaping.
pub struct ConversationStore {
    conversations: DashMap<String, Arc<Conversation>>,
    capacity: usize,
}

impl ConversationStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            conversations: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn get_or_create(&self, id: &str) -> Arc<Conversation> {
        let conversation = self
            .conversations
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Conversation::new(id)))
            .clone();
        conversation.touch();
        self.reap();
        conversation
    }

    pub fn get(&self, id: &str) -> Option<Arc<Conversation>> {
        self.conversations.get(id).map(|c| c.clone())
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Evict least-recently-active conversations beyond capacity.
    fn reap(&self) {
        while self.conversations.len() > self.capacity {
            let oldest = self
                .conversations
                .iter()
                .min_by_key(|entry| entry.value().last_activity())
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    tracing::debug!(conversation = %key, "reaping idle conversation");
                    self.conversations.remove(&key);
                }
                None => break,
            }
        }
    }
}
