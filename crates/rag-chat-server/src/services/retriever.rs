use crate::config::IndexConfig;
use crate::models::chat::ContextChunk;
use crate::utils::error::ApiError;
use anyhow::{Context, Result};
use reqwest::Client;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Narrow interface to the external vector index. Implementations convert
/// whatever node type the backing index produces into `ContextChunk` at this
/// boundary; nothing index-specific leaks past it. Results arrive sorted by
/// descending score, at most `top_k` of them.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait VectorIndex: Send + Sync {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<ContextChunk>>;
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    top_k: usize,
}

/// Index client talking to the sidecar query service over HTTP.
pub struct HttpVectorIndex {
    client: Client,
    base_url: String,
}

impl HttpVectorIndex {
    pub fn new(config: &IndexConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(config.timeout_seconds))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: config.query_url.clone(),
        }
    }
}

#[async_trait::async_trait]
impl VectorIndex for HttpVectorIndex {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<ContextChunk>> {
        debug!("Querying vector index (top_k={})", top_k);

        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .json(&SearchRequest { query, top_k })
            .send()
            .await
            .context("Failed to reach index query service")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Index query error ({}): {}", status, body);
        }

        let chunks: Vec<ContextChunk> = response
            .json()
            .await
            .context("Failed to parse index query response")?;
        Ok(chunks)
    }
}

/// Result of one retrieval pass. `formatted` is `None` (not an empty string)
/// when nothing survived filtering, the query was blank, or no index is
/// loaded — the prompt builder keys off that distinction.
#[derive(Debug, Default)]
pub struct Retrieval {
    pub chunks: Vec<ContextChunk>,
    pub formatted: Option<String>,
}

/// Local retrieval policy: threshold cutoff plus context formatting on top of
/// whatever `VectorIndex` is (or is not) loaded.
pub struct Retriever {
    index: Option<Arc<dyn VectorIndex>>,
}

impl Retriever {
    pub fn new(index: Option<Arc<dyn VectorIndex>>) -> Self {
        Self { index }
    }

    /// Construct from config, probing the index path. A missing path leaves
    /// the retriever index-less; completions then degrade to no-context mode.
    pub fn from_config(config: &IndexConfig) -> Self {
        if Path::new(&config.path).exists() {
            debug!("Vector index found at {}", config.path);
            Self::new(Some(Arc::new(HttpVectorIndex::new(config))))
        } else {
            warn!(
                "Vector index path {} does not exist, retrieval disabled",
                config.path
            );
            Self::new(None)
        }
    }

    pub fn is_available(&self) -> bool {
        self.index.is_some()
    }

    /// Retrieve and filter context for a query. Chunks scoring below the
    /// threshold are dropped (non-strict keep: `score >= threshold`, so a
    /// zero threshold admits every candidate).
    pub async fn retrieve(
        &self,
        query: &str,
        threshold: f32,
        top_k: usize,
    ) -> Result<Retrieval, ApiError> {
        if query.trim().is_empty() {
            return Ok(Retrieval::default());
        }

        let index = self.index.as_ref().ok_or_else(|| {
            ApiError::RetrievalUnavailable("vector index is not loaded".to_string())
        })?;

        let candidates = index
            .retrieve(query, top_k)
            .await
            .map_err(|e| ApiError::RetrievalError(e.to_string()))?;

        let total = candidates.len();
        let chunks: Vec<ContextChunk> = candidates
            .into_iter()
            .filter(|chunk| chunk.score >= threshold)
            .collect();

        debug!(
            "Retrieved {} candidates, {} passed threshold {}",
            total,
            chunks.len(),
            threshold
        );

        let formatted = format_context(&chunks);
        Ok(Retrieval { chunks, formatted })
    }
}

/// Human-readable context block: 1-based ordinal and source per chunk.
fn format_context(chunks: &[ContextChunk]) -> Option<String> {
    if chunks.is_empty() {
        return None;
    }

    let mut formatted =
        String::from("The following is contextual information related to the query:\n\n");
    for (i, chunk) in chunks.iter().enumerate() {
        formatted.push_str(&format!(
            "Context {} (Source: {}):\n{}\n\n",
            i + 1,
            chunk.source(),
            chunk.text
        ));
    }
    Some(formatted)
}
