//! `/health` and `/metrics` probes for the worker process, mirroring the
//! daemon's own `http_api` observability endpoints (the worker has no
//! request-driven business surface — those two routes are all it serves).

use std::sync::Arc;
use std::time::Instant;

use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

#[derive(Clone)]
struct HealthState {
    started_at: Instant,
}

pub fn create_router(started_at: Instant) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(Arc::new(HealthState { started_at }))
}

async fn health(axum::extract::State(state): axum::extract::State<Arc<HealthState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn metrics() -> impl IntoResponse {
    match tcg_telemetry::metrics::encode() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("failed to encode metrics: {e}")).into_response(),
    }
}

pub async fn serve(port: u16, router: Router) -> std::io::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "worker health/metrics endpoint listening");
    axum::serve(listener, router).await
}
