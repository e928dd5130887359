use crate::models::chat::ChatStreamRequest;
use crate::services::{RagService, StreamOptions};
use crate::utils::error::ApiError;
use axum::{
    body::Body,
    extract::Extension,
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures::stream::Stream;
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::info;

/// `POST /` — primary chat endpoint. Streams the model response back as
/// newline-delimited raw text chunks.
pub async fn chat_stream_handler(
    Extension(rag_service): Extension<Arc<RagService>>,
    Json(request): Json<ChatStreamRequest>,
) -> Result<Response, ApiError> {
    if request.id.trim().is_empty() {
        return Err(ApiError::BadRequest("id must not be empty".to_string()));
    }

    info!(
        "Chat stream request: client={}, prompt_len={}",
        request.id,
        request.prompt.len()
    );

    let stream = rag_service.create_completion_stream(
        request.prompt,
        request.id,
        StreamOptions::default(),
    );

    Ok(text_chunk_response(stream))
}

/// Wrap an orchestrator stream as a `text/plain` body of newline-delimited
/// chunks. The body is polled by the connection; a client disconnect drops it
/// and thereby cancels the generator.
pub fn text_chunk_response(stream: impl Stream<Item = String> + Send + 'static) -> Response {
    let body = Body::from_stream(
        stream.map(|chunk| Ok::<_, Infallible>(Bytes::from(format!("{}\n", chunk)))),
    );

    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}
