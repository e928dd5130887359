use crate::models::{ChatMessage, Role};

/// Deterministic prompt assembly. Output order is always:
/// system instructions, trimmed history (oldest first, system turns already
/// excluded by the store), then the final query or context turn.
pub struct PromptBuilder {
    system_prompt: String,
}

impl PromptBuilder {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
        }
    }

    /// Build the message sequence sent to the model.
    ///
    /// With a non-empty formatted context the final user turn wraps context
    /// and query together and stands in place of a bare query turn. Without
    /// context, the bare query is appended unless the caller already recorded
    /// it as the most recent history entry (duplicate suppression for queries
    /// reaching the prompt through two paths).
    pub fn build(
        &self,
        query: &str,
        formatted_context: Option<&str>,
        history: &[ChatMessage],
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::new(Role::System, self.system_prompt.clone()));
        messages.extend_from_slice(history);

        match formatted_context.filter(|ctx| !ctx.is_empty()) {
            Some(context) => {
                messages.push(ChatMessage::new(
                    Role::User,
                    format!(
                        "{}\n\nMy query is:\n{}\n\nAnswer the question using the provided context.",
                        context, query
                    ),
                ));
            }
            None => {
                let already_recorded = history
                    .last()
                    .map(|last| last.role == Role::User && last.content == query)
                    .unwrap_or(false);
                if !already_recorded {
                    messages.push(ChatMessage::new(Role::User, query));
                }
            }
        }

        messages
    }
}
