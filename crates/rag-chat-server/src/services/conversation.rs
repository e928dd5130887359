use crate::models::{ChatMessage, Role};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Thread-safe per-client conversation log.
///
/// Backed by a DashMap so mutations for one client id serialize against each
/// other while different clients never contend. Every operation holds its
/// shard lock for O(1) work only (append or window copy); nothing here awaits.
/// Reads hand out copies, so callers can never observe a half-applied write.
#[derive(Clone, Default)]
pub struct ConversationStore {
    history: Arc<DashMap<String, Vec<ChatMessage>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self {
            history: Arc::new(DashMap::new()),
        }
    }

    /// Append one message to the client's log. A log is created lazily on the
    /// first message for an unseen client id.
    pub fn add_message(&self, client_id: &str, role: Role, content: impl Into<String>) {
        self.history
            .entry(client_id.to_string())
            .or_default()
            .push(ChatMessage::new(role, content));
    }

    /// Accumulate a streamed delta into the client's in-progress assistant
    /// turn. If the last message is an assistant one its content grows in
    /// place; otherwise a fresh assistant message is started.
    pub fn add_partial_response(&self, client_id: &str, delta: &str) {
        let mut entry = self.history.entry(client_id.to_string()).or_default();
        let log = entry.value_mut();
        match log.last_mut() {
            Some(last) if last.role == Role::Assistant => last.content.push_str(delta),
            _ => log.push(ChatMessage::new(Role::Assistant, delta)),
        }
    }

    /// Copy of the client's log, optionally keeping system messages.
    /// Unknown client ids read as empty.
    pub fn get_history(&self, client_id: &str, include_system: bool) -> Vec<ChatMessage> {
        match self.history.get(client_id) {
            Some(entry) if include_system => entry.value().clone(),
            Some(entry) => entry
                .iter()
                .filter(|msg| msg.role != Role::System)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// The last `max_turns` non-system messages, oldest first. This is the
    /// sliding window spliced into model prompts.
    pub fn get_formatted_history(&self, client_id: &str, max_turns: usize) -> Vec<ChatMessage> {
        let filtered = self.get_history(client_id, false);
        if filtered.len() > max_turns {
            filtered[filtered.len() - max_turns..].to_vec()
        } else {
            filtered
        }
    }

    /// Reset the client's log. Returns whether any history existed before.
    pub fn clear_history(&self, client_id: &str) -> bool {
        match self.history.get_mut(client_id) {
            Some(mut entry) if !entry.is_empty() => {
                entry.clear();
                debug!("Cleared history for client {}", client_id);
                true
            }
            _ => false,
        }
    }

    /// True iff the most recent message for the client is a user turn with
    /// exactly this content. Used to suppress double-recording of a query
    /// that reaches the store through two code paths.
    pub fn is_last_user_message(&self, client_id: &str, content: &str) -> bool {
        self.history
            .get(client_id)
            .and_then(|entry| {
                entry
                    .last()
                    .map(|last| last.role == Role::User && last.content == content)
            })
            .unwrap_or(false)
    }
}
