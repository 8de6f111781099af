use axum::{Json, Router, routing::get};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::AppConfig;
use crate::kg::{KgService, api};

/// Router with the pipeline API under `/api/kg` and a health probe.
pub fn build_app(service: KgService) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/kg", api::build_router())
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Serve the pipeline API until the shutdown signal fires.
pub async fn start_server(
    config: Arc<AppConfig>,
    service: KgService,
    shutdown: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    let app = build_app(service);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
