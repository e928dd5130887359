use crate::models::chat::{ClearHistoryResponse, HistoryRequest, HistoryResponse};
use crate::services::RagService;
use axum::{extract::Extension, Json};
use std::sync::Arc;
use tracing::info;

/// `POST /clear_history` — reset a client's conversation log.
pub async fn clear_history_handler(
    Extension(rag_service): Extension<Arc<RagService>>,
    Json(request): Json<HistoryRequest>,
) -> Json<ClearHistoryResponse> {
    let existed = rag_service.store().clear_history(&request.id);
    info!("Clear history for client {}: existed={}", request.id, existed);

    let message = if existed {
        format!("History cleared for client {}", request.id)
    } else {
        format!("No history found for client {}", request.id)
    };

    Json(ClearHistoryResponse {
        success: existed,
        message,
    })
}

/// `POST /get_history` — fetch a client's conversation log (system turns
/// excluded).
pub async fn get_history_handler(
    Extension(rag_service): Extension<Arc<RagService>>,
    Json(request): Json<HistoryRequest>,
) -> Json<HistoryResponse> {
    let history = rag_service.store().get_history(&request.id, false);
    let message = format!("{} messages", history.len());

    Json(HistoryResponse {
        history,
        success: true,
        message,
    })
}
