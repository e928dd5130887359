use crate::models::chat::CompletionRequest;
use crate::services::{RagService, StreamOptions};
use crate::utils::error::ApiError;
use axum::{
    extract::Extension,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::info;

use super::chat::text_chunk_response;

/// `POST /v1/completions` — OpenAI-style completion endpoint. Returns a single
/// JSON result, or the newline-delimited chunk stream when `stream` is set.
pub async fn completions_handler(
    Extension(rag_service): Extension<Arc<RagService>>,
    Json(request): Json<CompletionRequest>,
) -> Result<Response, ApiError> {
    info!(
        "Completion request: client={:?}, stream={}, threshold={}, top_k={}",
        request.id, request.stream, request.similarity_threshold, request.top_k
    );

    if request.stream {
        let client_id = request.id.clone().ok_or_else(|| {
            ApiError::BadRequest("id is required for streaming completions".to_string())
        })?;

        let stream = rag_service.create_completion_stream(
            request.query,
            client_id,
            StreamOptions {
                similarity_threshold: Some(request.similarity_threshold),
                top_k: Some(request.top_k),
                temperature: Some(request.temperature),
                max_tokens: request.max_tokens,
                include_history: request.include_history,
            },
        );

        return Ok(text_chunk_response(stream));
    }

    let result = rag_service.create_completion(request).await;
    Ok(Json(result).into_response())
}
