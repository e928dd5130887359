use anyhow::Result;
use axum::{
    routing::{get, post},
    Extension, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::info;

mod config;
mod handlers;
mod models;
mod services;
mod utils;

use config::Settings;
use services::{ConversationStore, LlmClient, RagService, Retriever};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,rag_chat_server=debug".to_string()),
        )
        .with_target(true)
        .json()
        .init();

    info!("Starting RAG chat server...");

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Configuration loaded (model: {}, backend: {})",
        settings.llm.model, settings.llm.base_url
    );

    // Initialize services
    let store = ConversationStore::new();
    let retriever = Retriever::from_config(&settings.index);
    if !retriever.is_available() {
        info!("Running without retrieval: completions degrade to plain chat");
    }
    let llm = Arc::new(LlmClient::new(settings.llm.clone()));

    let rag_service = Arc::new(RagService::new(
        store,
        retriever,
        llm,
        settings.prompts.system_prompt.clone(),
        settings.llm.clone(),
        settings.rag.clone(),
    ));

    // Build router
    let app = build_router(rag_service);

    // Server address
    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));

    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(rag_service: Arc<RagService>) -> Router {
    Router::new()
        .route("/", post(handlers::chat::chat_stream_handler))
        .route("/v1/completions", post(handlers::completions::completions_handler))
        .route("/clear_history", post(handlers::history::clear_history_handler))
        .route("/get_history", post(handlers::history::get_history_handler))
        .route("/health", get(handlers::health::health_check))
        .layer(Extension(rag_service))
        // CORS
        .layer(
            CorsLayer::permissive()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        // Tracing
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
}
