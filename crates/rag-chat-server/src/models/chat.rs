use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ===== MESSAGE MODEL =====

/// Closed set of conversation roles. Role strings cross the process boundary
/// only through serde, which rejects anything outside this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One retrieved span of source text plus its metadata and relevance score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextChunk {
    pub text: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub score: f32,
}

impl ContextChunk {
    pub fn source(&self) -> &str {
        self.metadata
            .get("source")
            .map(String::as_str)
            .unwrap_or("unknown source")
    }
}

// ===== REQUEST MODELS =====

/// Body of `POST /` — the raw streaming chat endpoint.
#[derive(Debug, Deserialize)]
pub struct ChatStreamRequest {
    pub prompt: String,
    pub id: String,
}

/// Body of `POST /v1/completions`.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionRequest {
    pub query: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    /// Single-shot only: the raw text stream of the `stream=true` variant has
    /// no slot for structured context, so the flag is ignored there.
    #[serde(default)]
    pub return_context: bool,
    #[serde(default = "default_include_history")]
    pub include_history: bool,
    #[serde(default)]
    pub stream: bool,
}

fn default_similarity_threshold() -> f32 {
    2.0
}

fn default_top_k() -> usize {
    5
}

fn default_temperature() -> f32 {
    0.7
}

fn default_include_history() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct HistoryRequest {
    pub id: String,
}

// ===== RESPONSE MODELS =====

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub completion: String,
    pub model: String,
    pub usage: TokenUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contexts: Option<Vec<ContextChunk>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ClearHistoryResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub history: Vec<ChatMessage>,
    pub success: bool,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_wire_strings() {
        for (s, role) in [
            (r#""system""#, Role::System),
            (r#""user""#, Role::User),
            (r#""assistant""#, Role::Assistant),
        ] {
            assert_eq!(serde_json::from_str::<Role>(s).unwrap(), role);
            assert_eq!(serde_json::to_string(&role).unwrap(), s);
        }
        assert!(serde_json::from_str::<Role>(r#""moderator""#).is_err());
    }

    #[test]
    fn test_completion_request_defaults() {
        let req: CompletionRequest =
            serde_json::from_str(r#"{"query": "hello"}"#).unwrap();
        assert_eq!(req.similarity_threshold, 2.0);
        assert_eq!(req.top_k, 5);
        assert_eq!(req.temperature, 0.7);
        assert!(req.include_history);
        assert!(!req.return_context);
        assert!(!req.stream);
        assert!(req.id.is_none());
    }

    #[test]
    fn test_chunk_source_fallback() {
        let chunk = ContextChunk {
            text: "body".to_string(),
            metadata: HashMap::new(),
            score: 0.5,
        };
        assert_eq!(chunk.source(), "unknown source");
    }
}
