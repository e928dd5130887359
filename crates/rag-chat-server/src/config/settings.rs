use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub index: IndexConfig,
    pub llm: LlmConfig,
    pub rag: RagConfig,
    pub prompts: PromptsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IndexConfig {
    /// Filesystem path of the persisted vector index. Retrieval is disabled
    /// when this path does not exist.
    pub path: String,
    /// Base URL of the index query service.
    pub query_url: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub timeout_seconds: u64,
    pub max_tokens: usize,
    pub temperature: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RagConfig {
    pub similarity_threshold: f32,
    pub top_k: usize,
    pub max_history_turns: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PromptsConfig {
    pub system_prompt: String,
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant. Answer questions based on \
the provided context. If the context does not contain the relevant information, say that you do \
not know.";

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8000)?
            .set_default("index.path", "./vector_db")?
            .set_default("index.query_url", "http://127.0.0.1:60003")?
            .set_default("index.timeout_seconds", 30)?
            .set_default("llm.base_url", "http://127.0.0.1:60002")?
            .set_default("llm.model", "default")?
            .set_default("llm.timeout_seconds", 120)?
            .set_default("llm.max_tokens", 512)?
            .set_default("llm.temperature", 0.7)?
            .set_default("rag.similarity_threshold", 0.7)?
            .set_default("rag.top_k", 5)?
            .set_default("rag.max_history_turns", 10)?
            .set_default("prompts.system_prompt", DEFAULT_SYSTEM_PROMPT)?
            .add_source(File::with_name("config/settings").required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }
}
