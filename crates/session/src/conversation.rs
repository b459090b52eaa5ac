//! Conversation state.
//!
//! Two locks with different scopes: the turn gate serializes whole turns
//! (at most one turn is ever in flight per conversation), while the message
//! lock guards reads and appends and is never held across provider I/O.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, OwnedMutexGuard};

use voice_broker_core::ChatMessage;

/// One live conversation: the ordered message log plus its locks.
pub struct Conversation {
    id: String,
    turn_gate: Arc<Mutex<()>>,
    log: Mutex<Vec<ChatMessage>>,
    last_activity: parking_lot::Mutex<Instant>,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            turn_gate: Arc::new(Mutex::new(())),
            log: Mutex::new(Vec::new()),
            last_activity: parking_lot::Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Acquire exclusive right to run a turn. Held for the whole turn so a
    /// second utterance cannot interleave a still-committing one.
    pub async fn begin_turn(&self) -> OwnedMutexGuard<()> {
        self.turn_gate.clone().lock_owned().await
    }

    pub async fn append(&self, message: ChatMessage) {
        self.touch();
        self.log.lock().await.push(message);
    }

    /// Append a batch atomically; a turn's products land in one critical
    /// section so no reader observes a half-committed turn.
    pub async fn extend(&self, messages: Vec<ChatMessage>) {
        self.touch();
        self.log.lock().await.extend(messages);
    }

    /// Clone of the full log.
    pub async fn snapshot(&self) -> Vec<ChatMessage> {
        self.log.lock().await.clone()
    }

    /// Clone of the last `n` messages.
    pub async fn snapshot_recent(&self, n: usize) -> Vec<ChatMessage> {
        let log = self.log.lock().await;
        let start = log.len().saturating_sub(n);
        log[start..].to_vec()
    }

    pub async fn len(&self) -> usize {
        self.log.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.log.lock().await.is_empty()
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }
}
