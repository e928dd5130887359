use crate::config::{LlmConfig, RagConfig};
use crate::models::chat::{CompletionRequest, CompletionResponse, Role, TokenUsage};
use crate::services::llm_service::{ChatModel, GenerationParams};
use crate::services::prompt::PromptBuilder;
use crate::services::retriever::{Retrieval, Retriever};
use crate::services::ConversationStore;
use crate::utils::error::ApiError;
use futures::stream::Stream;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{info, warn};

/// Synthesized assistant text when the backend produces no content at all.
pub const EMPTY_GENERATION_FALLBACK: &str = "No response could be generated.";

/// Warning chunk prefixed to a stream when retrieval is unavailable.
const RETRIEVAL_UNAVAILABLE_NOTICE: &str =
    "Warning: vector index is not loaded; answering without retrieved context.\n";

/// Per-request overrides for the streaming path. Unset fields fall back to
/// the configured defaults.
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    pub similarity_threshold: Option<f32>,
    pub top_k: Option<usize>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    pub include_history: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            similarity_threshold: None,
            top_k: None,
            temperature: None,
            max_tokens: None,
            include_history: true,
        }
    }
}

/// Retrieval-augmented completion orchestrator.
///
/// Drives retrieval, prompt assembly, the model call, and the history commit
/// for both single-shot and streaming requests. Failures past this boundary
/// are data: the caller gets readable error text and the same text lands in
/// the client's history, never a silently dropped request.
pub struct RagService {
    store: ConversationStore,
    retriever: Retriever,
    llm: Arc<dyn ChatModel>,
    prompt_builder: PromptBuilder,
    llm_config: LlmConfig,
    rag_config: RagConfig,
}

impl RagService {
    pub fn new(
        store: ConversationStore,
        retriever: Retriever,
        llm: Arc<dyn ChatModel>,
        system_prompt: String,
        llm_config: LlmConfig,
        rag_config: RagConfig,
    ) -> Self {
        Self {
            store,
            retriever,
            llm,
            prompt_builder: PromptBuilder::new(system_prompt),
            llm_config,
            rag_config,
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// Record the user turn unless it is already the most recent message for
    /// this client. Both completion modes call this before generation, so a
    /// query reaching the store through two code paths lands exactly once.
    fn record_user_turn(&self, client_id: &str, query: &str) {
        if !self.store.is_last_user_message(client_id, query) {
            self.store.add_message(client_id, Role::User, query);
        }
    }

    /// Retrieval for single-shot mode: an unloaded index degrades silently to
    /// an empty context, a hard retrieval failure propagates.
    async fn retrieve_or_degrade(
        &self,
        query: &str,
        threshold: f32,
        top_k: usize,
    ) -> Result<Retrieval, ApiError> {
        match self.retriever.retrieve(query, threshold, top_k).await {
            Ok(retrieval) => Ok(retrieval),
            Err(ApiError::RetrievalUnavailable(msg)) => {
                warn!("Retrieval unavailable, continuing without context: {}", msg);
                Ok(Retrieval::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Single-shot completion. Never returns an error: failures from the
    /// retriever or the backend are folded into the result text and committed
    /// to history so the client-visible output and the log agree.
    pub async fn create_completion(&self, req: CompletionRequest) -> CompletionResponse {
        let params = GenerationParams {
            temperature: req.temperature,
            max_tokens: req.max_tokens.unwrap_or(self.llm_config.max_tokens),
        };

        if let Some(client_id) = &req.id {
            self.record_user_turn(client_id, &req.query);
        }

        let retrieval = match self
            .retrieve_or_degrade(&req.query, req.similarity_threshold, req.top_k)
            .await
        {
            Ok(retrieval) => retrieval,
            Err(e) => {
                return self.failed_completion(
                    &req,
                    format!("Error retrieving context: {}", e),
                    Retrieval::default(),
                );
            }
        };

        let history = match &req.id {
            Some(client_id) if req.include_history => self
                .store
                .get_formatted_history(client_id, self.rag_config.max_history_turns),
            _ => Vec::new(),
        };

        let messages = self
            .prompt_builder
            .build(&req.query, retrieval.formatted.as_deref(), &history);

        match self.llm.complete(&messages, params).await {
            Ok(completion) => {
                let text = if completion.content.is_empty() {
                    EMPTY_GENERATION_FALLBACK.to_string()
                } else {
                    completion.content
                };

                if let Some(client_id) = &req.id {
                    self.store.add_message(client_id, Role::Assistant, &text);
                }

                let (contexts, formatted_context) = if req.return_context {
                    (Some(retrieval.chunks), retrieval.formatted)
                } else {
                    (None, None)
                };

                CompletionResponse {
                    completion: text,
                    model: completion.model,
                    usage: completion.usage,
                    contexts,
                    formatted_context,
                    error: None,
                }
            }
            Err(e) => self.failed_completion(
                &req,
                format!("Error generating response: {}", e),
                retrieval,
            ),
        }
    }

    fn failed_completion(
        &self,
        req: &CompletionRequest,
        message: String,
        retrieval: Retrieval,
    ) -> CompletionResponse {
        warn!("Completion failed: {}", message);

        if let Some(client_id) = &req.id {
            self.store.add_message(client_id, Role::Assistant, &message);
        }

        CompletionResponse {
            error: Some(message.clone()),
            completion: message,
            model: self.llm_config.model.clone(),
            usage: TokenUsage::default(),
            contexts: req.return_context.then_some(retrieval.chunks),
            formatted_context: None,
        }
    }

    /// Streaming completion. The user turn is recorded before the stream is
    /// handed out; everything else runs lazily as the caller polls. Each
    /// non-empty delta is accumulated into the client's assistant turn and
    /// then yielded, so dropping the stream mid-way (client disconnect) stops
    /// the backend pull at that point and history keeps exactly the forwarded
    /// prefix.
    pub fn create_completion_stream(
        self: Arc<Self>,
        query: String,
        client_id: String,
        options: StreamOptions,
    ) -> impl Stream<Item = String> + Send + 'static {
        self.record_user_turn(&client_id, &query);

        let threshold = options
            .similarity_threshold
            .unwrap_or(self.rag_config.similarity_threshold);
        let top_k = options.top_k.unwrap_or(self.rag_config.top_k);
        let include_history = options.include_history;
        let params = GenerationParams {
            temperature: options.temperature.unwrap_or(self.llm_config.temperature),
            max_tokens: options.max_tokens.unwrap_or(self.llm_config.max_tokens),
        };

        async_stream::stream! {
            let retrieval = match self.retriever.retrieve(&query, threshold, top_k).await {
                Ok(retrieval) => retrieval,
                Err(ApiError::RetrievalUnavailable(msg)) => {
                    warn!("Retrieval unavailable for stream: {}", msg);
                    yield RETRIEVAL_UNAVAILABLE_NOTICE.to_string();
                    Retrieval::default()
                }
                Err(e) => {
                    let text = format!("Error retrieving context: {}", e);
                    self.store.add_partial_response(&client_id, &text);
                    yield text;
                    return;
                }
            };

            let history = if include_history {
                self.store
                    .get_formatted_history(&client_id, self.rag_config.max_history_turns)
            } else {
                Vec::new()
            };

            let messages = self
                .prompt_builder
                .build(&query, retrieval.formatted.as_deref(), &history);

            info!("Streaming completion for client {}", client_id);

            let mut deltas = match self.llm.complete_stream(&messages, params).await {
                Ok(deltas) => deltas,
                Err(e) => {
                    let text = format!("Error generating response: {}", e);
                    self.store.add_partial_response(&client_id, &text);
                    yield text;
                    return;
                }
            };

            let mut content_yielded = false;
            while let Some(next) = deltas.next().await {
                match next {
                    Ok(delta) if !delta.is_empty() => {
                        content_yielded = true;
                        self.store.add_partial_response(&client_id, &delta);
                        yield delta;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // History must mirror what the client saw: the error
                        // text joins the partially accumulated assistant turn.
                        let text = format!("Streaming error: {}", e);
                        self.store.add_partial_response(&client_id, &text);
                        yield text;
                        return;
                    }
                }
            }

            if !content_yielded {
                self.store
                    .add_message(&client_id, Role::Assistant, EMPTY_GENERATION_FALLBACK);
                yield EMPTY_GENERATION_FALLBACK.to_string();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::{ChatMessage, ContextChunk};
    use crate::services::llm_service::{ChatCompletion, DeltaStream};
    use crate::services::retriever::MockVectorIndex;
    use std::collections::HashMap;
    use std::sync::Mutex;

    // Deterministic ChatModel stub. Records every prompt and parameter set it
    // is given and replays a canned single-shot response or delta sequence.
    struct StubModel {
        response: Result<ChatCompletion, String>,
        deltas: Vec<Result<String, String>>,
        seen_prompts: Mutex<Vec<Vec<ChatMessage>>>,
        seen_params: Mutex<Vec<GenerationParams>>,
    }

    impl StubModel {
        fn with_response(content: &str) -> Self {
            Self {
                response: Ok(ChatCompletion {
                    content: content.to_string(),
                    model: "stub-model".to_string(),
                    usage: TokenUsage {
                        prompt_tokens: 11,
                        completion_tokens: 7,
                        total_tokens: 18,
                    },
                }),
                deltas: Vec::new(),
                seen_prompts: Mutex::new(Vec::new()),
                seen_params: Mutex::new(Vec::new()),
            }
        }

        fn with_deltas(deltas: &[&str]) -> Self {
            Self {
                deltas: deltas.iter().map(|d| Ok(d.to_string())).collect(),
                ..Self::with_response("")
            }
        }

        fn failing(error: &str) -> Self {
            Self {
                response: Err(error.to_string()),
                deltas: vec![Err(error.to_string())],
                ..Self::with_response("")
            }
        }

        fn last_prompt(&self) -> Vec<ChatMessage> {
            self.seen_prompts.lock().unwrap().last().cloned().unwrap()
        }

        fn last_params(&self) -> GenerationParams {
            *self.seen_params.lock().unwrap().last().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl ChatModel for StubModel {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            params: GenerationParams,
        ) -> Result<ChatCompletion, ApiError> {
            self.seen_prompts.lock().unwrap().push(messages.to_vec());
            self.seen_params.lock().unwrap().push(params);
            self.response.clone().map_err(ApiError::LlmError)
        }

        async fn complete_stream(
            &self,
            messages: &[ChatMessage],
            params: GenerationParams,
        ) -> Result<DeltaStream, ApiError> {
            self.seen_prompts.lock().unwrap().push(messages.to_vec());
            self.seen_params.lock().unwrap().push(params);
            let items: Vec<Result<String, ApiError>> = self
                .deltas
                .clone()
                .into_iter()
                .map(|d| d.map_err(ApiError::LlmError))
                .collect();
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    fn scored_chunk(text: &str, score: f32) -> ContextChunk {
        let mut metadata = HashMap::new();
        metadata.insert("source".to_string(), "doc.md".to_string());
        ContextChunk {
            text: text.to_string(),
            metadata,
            score,
        }
    }

    fn index_with(chunks: Vec<ContextChunk>) -> Retriever {
        let mut index = MockVectorIndex::new();
        index
            .expect_retrieve()
            .returning(move |_, _| Ok(chunks.clone()));
        Retriever::new(Some(Arc::new(index)))
    }

    fn service(retriever: Retriever, llm: Arc<dyn ChatModel>) -> Arc<RagService> {
        Arc::new(RagService::new(
            ConversationStore::new(),
            retriever,
            llm,
            "You are a test assistant.".to_string(),
            LlmConfig {
                base_url: "http://localhost:0".to_string(),
                model: "stub-model".to_string(),
                timeout_seconds: 5,
                max_tokens: 128,
                temperature: 0.7,
            },
            RagConfig {
                similarity_threshold: 0.7,
                top_k: 5,
                max_history_turns: 10,
            },
        ))
    }

    fn request(query: &str, id: Option<&str>) -> CompletionRequest {
        serde_json::from_value(serde_json::json!({
            "query": query,
            "id": id,
            "similarity_threshold": 0.7,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_single_shot_commits_both_turns() {
        let llm = Arc::new(StubModel::with_response("the answer"));
        let svc = service(index_with(vec![scored_chunk("x is y", 0.9)]), llm);

        let result = svc.create_completion(request("What is X?", Some("u1"))).await;
        assert_eq!(result.completion, "the answer");
        assert_eq!(result.model, "stub-model");
        assert_eq!(result.usage.total_tokens, 18);
        assert!(result.error.is_none());
        assert!(result.contexts.is_none());

        let history = svc.store().get_history("u1", false);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], ChatMessage::new(Role::User, "What is X?"));
        assert_eq!(history[1], ChatMessage::new(Role::Assistant, "the answer"));
    }

    #[tokio::test]
    async fn test_return_context_round_trip() {
        let llm = Arc::new(StubModel::with_response("answer"));
        let svc = service(index_with(vec![scored_chunk("x is y", 0.9)]), llm);

        let mut req = request("What is X?", None);
        req.return_context = true;
        let result = svc.create_completion(req).await;

        let contexts = result.contexts.unwrap();
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].text, "x is y");
        assert!(result.formatted_context.unwrap().contains("doc.md"));
    }

    #[tokio::test]
    async fn test_end_to_end_two_request_scenario() {
        // First request: one chunk at 0.9 against threshold 0.7.
        let llm = Arc::new(StubModel::with_response("X is a thing."));
        let svc = service(index_with(vec![scored_chunk("about X", 0.9)]), llm.clone());

        svc.create_completion(request("What is X?", Some("u1"))).await;

        let history = svc.store().get_history("u1", false);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "What is X?");
        assert_eq!(history[1].content, "X is a thing.");

        let prompt = llm.last_prompt();
        assert!(prompt.last().unwrap().content.contains("about X"));

        // Second request: chunk below threshold, so no context block, but the
        // prior turns ride along in the prompt. Same store, fresh retriever.
        let llm2 = Arc::new(StubModel::with_response("Still a thing."));
        let svc2 = Arc::new(RagService::new(
            svc.store().clone(),
            index_with(vec![scored_chunk("noise", 0.5)]),
            llm2.clone(),
            "You are a test assistant.".to_string(),
            LlmConfig {
                base_url: "http://localhost:0".to_string(),
                model: "stub-model".to_string(),
                timeout_seconds: 5,
                max_tokens: 128,
                temperature: 0.7,
            },
            RagConfig {
                similarity_threshold: 0.7,
                top_k: 5,
                max_history_turns: 10,
            },
        ));

        svc2.create_completion(request("Tell me more", Some("u1"))).await;

        let prompt = llm2.last_prompt();
        assert!(prompt.iter().all(|m| !m.content.contains("noise")));
        assert!(prompt.iter().any(|m| m.content == "What is X?"));
        assert!(prompt.iter().any(|m| m.content == "X is a thing."));
        assert_eq!(prompt.last().unwrap().content, "Tell me more");
    }

    #[tokio::test]
    async fn test_single_shot_empty_generation_fallback() {
        let llm = Arc::new(StubModel::with_response(""));
        let svc = service(Retriever::new(None), llm);

        let result = svc.create_completion(request("hi", Some("u1"))).await;
        assert_eq!(result.completion, EMPTY_GENERATION_FALLBACK);
        assert!(result.error.is_none());

        let history = svc.store().get_history("u1", false);
        assert_eq!(history[1].content, EMPTY_GENERATION_FALLBACK);
    }

    #[tokio::test]
    async fn test_single_shot_backend_failure_is_data() {
        let llm = Arc::new(StubModel::failing("connection refused"));
        let svc = service(Retriever::new(None), llm);

        let result = svc.create_completion(request("hi", Some("u1"))).await;
        assert!(result.completion.contains("connection refused"));
        assert!(result.error.is_some());
        assert_eq!(result.usage.total_tokens, 0);
        assert_eq!(result.model, "stub-model");

        // The error is auditable in history, no rollback.
        let history = svc.store().get_history("u1", false);
        assert_eq!(history.len(), 2);
        assert!(history[1].content.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_unavailable_index_degrades_silently_single_shot() {
        let llm = Arc::new(StubModel::with_response("no-context answer"));
        let svc = service(Retriever::new(None), llm.clone());

        let mut req = request("question", None);
        req.return_context = true;
        let result = svc.create_completion(req).await;

        assert_eq!(result.completion, "no-context answer");
        assert_eq!(result.contexts.unwrap().len(), 0);
        // Prompt fell back to the bare query form.
        assert_eq!(llm.last_prompt().last().unwrap().content, "question");
    }

    #[tokio::test]
    async fn test_streaming_matches_single_shot_output() {
        let deltas = ["Hel", "lo ", "wor", "ld"];
        let llm = Arc::new(StubModel::with_deltas(&deltas));
        let svc = service(Retriever::new(None), llm);

        let stream = svc
            .clone()
            .create_completion_stream("hi".to_string(), "u1".to_string(), StreamOptions::default());
        // First chunk is the retrieval-unavailable notice, then the deltas.
        let chunks: Vec<String> = stream.collect().await;
        assert_eq!(chunks[0], RETRIEVAL_UNAVAILABLE_NOTICE);

        let forwarded: String = chunks[1..].concat();
        assert_eq!(forwarded, "Hello world");

        let history = svc.store().get_history("u1", false);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1], ChatMessage::new(Role::Assistant, "Hello world"));
    }

    #[tokio::test]
    async fn test_streaming_duplicate_suppression() {
        let llm = Arc::new(StubModel::with_deltas(&["a"]));
        let svc = service(index_with(vec![]), llm);

        // Double-submit of the same turn through the completion path records
        // the user message exactly once.
        let s1 = svc.clone().create_completion_stream(
            "same Q".to_string(),
            "u1".to_string(),
            StreamOptions::default(),
        );
        let s2 = svc.clone().create_completion_stream(
            "same Q".to_string(),
            "u1".to_string(),
            StreamOptions::default(),
        );

        let user_turns = svc
            .store()
            .get_history("u1", false)
            .iter()
            .filter(|m| m.role == Role::User && m.content == "same Q")
            .count();
        assert_eq!(user_turns, 1);

        drop(s1);
        drop(s2);
    }

    #[tokio::test]
    async fn test_streaming_empty_generation_fallback() {
        let llm = Arc::new(StubModel::with_deltas(&["", "", ""]));
        let svc = service(index_with(vec![]), llm);

        let chunks: Vec<String> = svc
            .clone()
            .create_completion_stream("hi".to_string(), "u1".to_string(), StreamOptions::default())
            .collect()
            .await;

        assert_eq!(chunks, vec![EMPTY_GENERATION_FALLBACK.to_string()]);
        let history = svc.store().get_history("u1", false);
        assert_eq!(history[1].content, EMPTY_GENERATION_FALLBACK);
    }

    #[tokio::test]
    async fn test_streaming_error_joins_partial_turn() {
        let llm = Arc::new(StubModel {
            deltas: vec![Ok("partial ".to_string()), Err("backend died".to_string())],
            ..StubModel::with_response("")
        });
        let svc = service(index_with(vec![]), llm);

        let chunks: Vec<String> = svc
            .clone()
            .create_completion_stream("hi".to_string(), "u1".to_string(), StreamOptions::default())
            .collect()
            .await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "partial ");
        assert!(chunks[1].contains("backend died"));

        // One assistant entry holding exactly what the client saw.
        let history = svc.store().get_history("u1", false);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, chunks.concat());
    }

    #[tokio::test]
    async fn test_disconnect_keeps_forwarded_prefix_only() {
        let deltas = ["d1", "d2", "d3", "d4", "d5"];
        let llm = Arc::new(StubModel::with_deltas(&deltas));
        let svc = service(index_with(vec![]), llm);

        let mut stream = Box::pin(svc.clone().create_completion_stream(
            "hi".to_string(),
            "u1".to_string(),
            StreamOptions::default(),
        ));

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!((first.as_str(), second.as_str()), ("d1", "d2"));

        // Client disconnect: drop the stream mid-way.
        drop(stream);

        let history = svc.store().get_history("u1", false);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "d1d2");
    }

    #[tokio::test]
    async fn test_stream_prompt_includes_context_block() {
        let llm = Arc::new(StubModel::with_deltas(&["ok"]));
        let svc = service(index_with(vec![scored_chunk("relevant fact", 0.95)]), llm.clone());

        let _: Vec<String> = svc
            .clone()
            .create_completion_stream("query".to_string(), "u1".to_string(), StreamOptions::default())
            .collect()
            .await;

        let prompt = llm.last_prompt();
        assert_eq!(prompt[0].role, Role::System);
        assert!(prompt.last().unwrap().content.contains("relevant fact"));
    }

    #[tokio::test]
    async fn test_stream_honors_request_generation_params() {
        let llm = Arc::new(StubModel::with_deltas(&["ok"]));
        let svc = service(index_with(vec![]), llm.clone());

        let _: Vec<String> = svc
            .clone()
            .create_completion_stream(
                "hi".to_string(),
                "u1".to_string(),
                StreamOptions {
                    temperature: Some(0.2),
                    max_tokens: Some(64),
                    ..StreamOptions::default()
                },
            )
            .collect()
            .await;

        let params = llm.last_params();
        assert_eq!(params.temperature, 0.2);
        assert_eq!(params.max_tokens, 64);

        // Unset fields fall back to the configured values.
        let _: Vec<String> = svc
            .clone()
            .create_completion_stream("hi2".to_string(), "u1".to_string(), StreamOptions::default())
            .collect()
            .await;

        let params = llm.last_params();
        assert_eq!(params.temperature, 0.7);
        assert_eq!(params.max_tokens, 128);
    }
}
