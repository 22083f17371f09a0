//! HTTP surface — axum routes over the query orchestrator.
//!
//! - `GET    /api/health`
//! - `POST   /api/ai/query`          - non-streaming envelope
//! - `POST   /api/ai/query/stream`   - NDJSON event stream
//! - `GET    /api/ai/tools`          - tool catalog declarations
//! - `DELETE /api/sessions/:id`      - explicit session deletion

pub mod routes;

use std::sync::Arc;

use anyhow::Context;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::agent_core::QueryOrchestrator;
use crate::stream::StreamSettings;

/// Shared handler state. Everything behind it is immutable or internally locked.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<QueryOrchestrator>,
    pub stream: StreamSettings,
}

impl AppState {
    pub fn new(orchestrator: Arc<QueryOrchestrator>) -> Self {
        let stream = StreamSettings::from(&orchestrator.config().stream);
        Self {
            orchestrator,
            stream,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/ai/query", post(routes::query))
        .route("/api/ai/query/stream", post(routes::query_stream))
        .route("/api/ai/tools", get(routes::tools))
        .route("/api/sessions/:id", delete(routes::delete_session))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until ctrl-c.
pub async fn serve(state: AppState, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(addr = %listener.local_addr()?, "query orchestrator listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
