//! HTTP server startup and routing.

use crate::api::{self, AppState};
use crate::config::Config;
use crate::context_engine::ContextManager;
use crate::embedding::HttpEmbeddingProvider;
use crate::memory_db::MemoryDatabase;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    cfg.validate()?;
    cfg.print_config();

    let db = Arc::new(MemoryDatabase::new(
        std::path::Path::new(&cfg.db_path),
        cfg.embedding_dimension,
        cfg.ann_build_threshold,
    )?);

    let provider = Arc::new(HttpEmbeddingProvider::new(
        cfg.embedding_backend_url.clone(),
        cfg.embedding_model.clone(),
        cfg.embedding_dimension,
        cfg.embedding_timeout_seconds,
    ));

    let manager = Arc::new(ContextManager::new(&cfg, db, provider));
    let state = AppState { manager };

    crate::metrics::init_metrics();

    let addr = cfg.api_addr()?;
    info!("Starting HTTP server on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = build_router(state, cfg.request_timeout_seconds);
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState, request_timeout_seconds: u64) -> axum::Router {
    use axum::routing::{delete, get, post, put};
    use axum::Router;
    use tower_http::cors::{Any, CorsLayer};
    use tower_http::timeout::TimeoutLayer;
    use tower_http::trace::TraceLayer;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/context/message", post(api::add_message))
        .route("/api/context/messages", post(api::add_messages))
        .route("/api/context/compress", post(api::compress_session))
        .route("/api/context/search", get(api::semantic_search))
        .route("/api/context/hybrid-search", get(api::hybrid_search))
        .route("/api/context/stats", get(api::memory_stats))
        .route(
            "/api/context/session/:id",
            post(api::save_session).get(api::get_session),
        )
        .route("/api/context/memory/:id", delete(api::delete_memory))
        .route("/api/context/memory/:id/importance", put(api::update_importance))
        .route("/healthz", get(|| async { "OK" }))
        .route("/metrics", get(crate::metrics::get_metrics))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(request_timeout_seconds)))
}
