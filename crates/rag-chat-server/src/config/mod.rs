pub mod settings;

pub use settings::{IndexConfig, LlmConfig, PromptsConfig, RagConfig, ServerConfig, Settings};
