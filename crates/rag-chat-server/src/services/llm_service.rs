use crate::config::LlmConfig;
use crate::models::chat::{ChatMessage, TokenUsage};
use crate::utils::error::ApiError;
use bytes::Bytes;
use futures::stream::Stream;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tracing::debug;

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, ApiError>> + Send>>;

/// Sampling knobs resolved per request.
#[derive(Debug, Clone, Copy)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: usize,
}

/// A finished single-shot completion, usage figures verbatim from the backend.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
}

/// Seam between the orchestrator and the model backend. The streaming variant
/// yields text deltas in emission order; each can be observed exactly once and
/// the stream ends when the backend signals completion.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: GenerationParams,
    ) -> Result<ChatCompletion, ApiError>;

    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        params: GenerationParams,
    ) -> Result<DeltaStream, ApiError>;
}

// ===== WIRE FORMAT =====

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: usize,
    stream: bool,
    top_p: f32,
    repetition_penalty: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    model: String,
    #[serde(default)]
    usage: TokenUsage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChoiceChunk>,
}

#[derive(Debug, Deserialize)]
struct ChoiceChunk {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

// ===== CLIENT =====

/// OpenAI-compatible chat-completion client.
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(config.timeout_seconds))
                .build()
                .unwrap_or_else(|_| Client::new()),
            config,
        }
    }

    async fn post_completion(
        &self,
        messages: &[ChatMessage],
        params: GenerationParams,
        stream: bool,
    ) -> Result<reqwest::Response, ApiError> {
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            stream,
            // Sampling extras the local backend expects.
            top_p: 0.8,
            repetition_penalty: 1.05,
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.config.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| ApiError::LlmError(format!("Failed to call LLM API: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::LlmError(format!(
                "LLM API error: {} - {}",
                status, body
            )));
        }

        Ok(response)
    }
}

#[async_trait::async_trait]
impl ChatModel for LlmClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: GenerationParams,
    ) -> Result<ChatCompletion, ApiError> {
        debug!("Chat completion with {} messages", messages.len());

        let response = self.post_completion(messages, params, false).await?;

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ApiError::LlmError(format!("Failed to parse LLM response: {}", e)))?;

        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(ChatCompletion {
            content,
            model: parsed.model,
            usage: parsed.usage,
        })
    }

    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        params: GenerationParams,
    ) -> Result<DeltaStream, ApiError> {
        debug!("Chat stream with {} messages", messages.len());

        let response = self.post_completion(messages, params, true).await?;
        Ok(parse_sse_deltas(response.bytes_stream()))
    }
}

/// Decode an SSE byte stream ("data: {...}" frames, "[DONE]" terminator) into
/// text deltas. A read can end mid-line or mid-UTF-8 sequence, so bytes are
/// carried raw and only complete lines are decoded.
fn parse_sse_deltas<S, E>(byte_stream: S) -> DeltaStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send,
{
    let mut byte_stream = Box::pin(byte_stream);
    Box::pin(async_stream::stream! {
        let mut carry: Vec<u8> = Vec::new();
        while let Some(next) = byte_stream.next().await {
            match next {
                Ok(bytes) => {
                    carry.extend_from_slice(&bytes);
                    while let Some(pos) = carry.iter().position(|&b| b == b'\n') {
                        let line_bytes: Vec<u8> = carry.drain(..=pos).collect();
                        let line = String::from_utf8_lossy(&line_bytes);
                        let line = line.trim_end();
                        let Some(json_str) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        if json_str == "[DONE]" {
                            return;
                        }
                        if let Ok(chunk) =
                            serde_json::from_str::<ChatCompletionChunk>(json_str)
                        {
                            if let Some(content) = chunk
                                .choices
                                .first()
                                .and_then(|c| c.delta.content.clone())
                            {
                                yield Ok(content);
                            }
                        }
                    }
                }
                Err(e) => {
                    yield Err(ApiError::LlmError(format!("Stream error: {}", e)));
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn frame(content: &str) -> Vec<u8> {
        format!(
            "data: {}\n",
            serde_json::json!({"choices": [{"delta": {"content": content}}]})
        )
        .into_bytes()
    }

    async fn collect_deltas(chunks: Vec<Vec<u8>>) -> Vec<String> {
        let items: Vec<Result<Bytes, Infallible>> =
            chunks.into_iter().map(|c| Ok(Bytes::from(c))).collect();
        parse_sse_deltas(futures::stream::iter(items))
            .map(|d| d.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_line_split_across_reads() {
        let bytes = frame("hello");
        let mid = bytes.len() / 2;
        let deltas = collect_deltas(vec![bytes[..mid].to_vec(), bytes[mid..].to_vec()]).await;
        assert_eq!(deltas, vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_multibyte_character_split_across_reads() {
        // "你" is E4 BD A0 on the wire; cut after the first byte of the
        // sequence so the character straddles two reads.
        let bytes = frame("你好");
        let cut = bytes.iter().position(|&b| b == 0xE4).unwrap() + 1;
        let deltas = collect_deltas(vec![bytes[..cut].to_vec(), bytes[cut..].to_vec()]).await;
        assert_eq!(deltas, vec!["你好".to_string()]);
        assert!(!deltas[0].contains('\u{FFFD}'));
    }

    #[tokio::test]
    async fn test_done_terminates_stream() {
        let mut payload = frame("a");
        payload.extend_from_slice(b"data: [DONE]\n");
        payload.extend_from_slice(&frame("after"));
        let deltas = collect_deltas(vec![payload]).await;
        assert_eq!(deltas, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_non_data_lines_skipped() {
        let mut payload = b": keep-alive\n\n".to_vec();
        payload.extend_from_slice(&frame("x"));
        let deltas = collect_deltas(vec![payload]).await;
        assert_eq!(deltas, vec!["x".to_string()]);
    }
}
