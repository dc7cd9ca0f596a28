use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::info;

use graphrag_query_server::config::Settings;
use graphrag_query_server::database::{DbPool, Repository};
use graphrag_query_server::handlers;
use graphrag_query_server::services::{ChatOrchestrator, EmbeddingClient, HybridRetriever, LlmClient};
use graphrag_query_server::state::AppState;
use graphrag_query_server::utils::limiters::Limiters;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,graphrag_query_server=debug".to_string()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .init();

    info!("starting graphrag query server");

    let settings = Settings::load()?;
    info!("configuration loaded");

    let db_pool = DbPool::new(&settings.database).await?;
    info!("database connection established");

    let repository = Arc::new(Repository::new(db_pool.clone()));

    let limiters = Arc::new(Limiters::new(
        settings.database.pool_max_size as usize,
        Duration::from_secs(settings.embedding.timeout_seconds),
    ));

    let embedding_client = Arc::new(EmbeddingClient::new(&settings.embedding, limiters.clone()));
    let llm_client = Arc::new(LlmClient::new(&settings.chat));

    let retriever = Arc::new(HybridRetriever::new(repository.clone(), embedding_client.clone()));
    let orchestrator = Arc::new(ChatOrchestrator::new(repository.clone(), retriever.clone(), llm_client.clone()));

    let state = Arc::new(AppState {
        db_pool,
        repository,
        retriever,
        orchestrator,
        settings: settings.clone(),
        limiters,
        active_scopes: Arc::new(dashmap::DashMap::new()),
    });

    let app = build_router(state);

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));

    info!(%addr, "server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health::readiness_check))
        .route("/api/collections", get(handlers::collections::list_collections))
        .route(
            "/api/conversations",
            get(handlers::conversations::list_conversations).post(handlers::conversations::create_conversation),
        )
        .route(
            "/api/conversations/{id}",
            get(handlers::conversations::get_conversation)
                .patch(handlers::conversations::update_conversation)
                .delete(handlers::conversations::delete_conversation),
        )
        .route("/api/chat", post(handlers::chat::chat_handler))
        .route("/api/chat/abort", delete(handlers::chat::abort_handler))
        .route("/api/documents/{id}/pdf", get(handlers::documents::stream_pdf))
        .with_state(state)
        .layer(
            CorsLayer::permissive()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default().include_headers(true)))
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024))
}
