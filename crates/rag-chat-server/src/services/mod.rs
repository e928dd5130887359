pub mod conversation;
pub mod llm_service;
pub mod prompt;
pub mod rag_service;
pub mod retriever;

pub use conversation::ConversationStore;
pub use llm_service::{ChatModel, LlmClient};
pub use prompt::PromptBuilder;
pub use rag_service::{RagService, StreamOptions};
pub use retriever::{Retriever, VectorIndex};
