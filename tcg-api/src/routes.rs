//! Route handlers for the `/api` prefix plus `/health`/`/ready` process
//! probes and the shared Prometheus `/metrics` endpoint, following the
//! daemon's `http_api` layout.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tcg_common::{ImprovementJob, TrackedRepository};
use tcg_core::CommandSurface;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::dto::{AddRepoRequest, CreateJobRequest, ScanQueuedResponse};
use crate::error::ApiError;

#[derive(Clone)]
pub struct ApiState {
    pub surface: Arc<CommandSurface>,
    pub started_at: Instant,
}

pub fn create_router(state: ApiState) -> Router {
    let api = Router::new()
        .route("/repos", get(list_repos).post(add_repo))
        .route("/repos/{id}/scan", post(trigger_scan))
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/{id}", get(get_job));

    Router::new()
        .nest("/api", api)
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn ready() -> impl IntoResponse {
    StatusCode::OK
}

async fn metrics() -> impl IntoResponse {
    match tcg_telemetry::metrics::encode() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("failed to encode metrics: {e}")).into_response(),
    }
}

async fn list_repos(State(state): State<Arc<ApiState>>) -> Result<Json<Vec<TrackedRepository>>, ApiError> {
    Ok(Json(state.surface.list_repos().await?))
}

async fn add_repo(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<AddRepoRequest>,
) -> Result<(StatusCode, Json<TrackedRepository>), ApiError> {
    let repo = state.surface.add_repo(&body.repository_url).await?;
    Ok((StatusCode::CREATED, Json(repo)))
}

async fn trigger_scan(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<ScanQueuedResponse>), ApiError> {
    state.surface.trigger_scan(id).await?;
    Ok((
        StatusCode::CREATED,
        Json(ScanQueuedResponse {
            queued: true,
            repo_id: id,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct ListJobsQuery {
    #[serde(rename = "repoId")]
    repo_id: Option<Uuid>,
}

async fn list_jobs(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<ImprovementJob>>, ApiError> {
    Ok(Json(state.surface.list_jobs(query.repo_id).await?))
}

async fn create_job(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<ImprovementJob>), ApiError> {
    let job = state
        .surface
        .create_job(&body.repository_url, &body.file_path, body.target_coverage)
        .await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn get_job(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ImprovementJob>, ApiError> {
    Ok(Json(state.surface.get_job(id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc as StdArc;
    use tcg_core::testing::{FakeImproveQueue, FakeJobStore, FakeRepoStore, FakeRepositoryHost, FakeScanQueue};
    use tower::ServiceExt;

    fn test_state() -> ApiState {
        let repos = StdArc::new(FakeRepoStore::new());
        let jobs = StdArc::new(FakeJobStore::new());
        let host = StdArc::new(FakeRepositoryHost::new());
        let scan_queue = StdArc::new(FakeScanQueue::new());
        let improve_queue = StdArc::new(FakeImproveQueue::new());
        ApiState {
            surface: StdArc::new(CommandSurface::new(repos, jobs, host, scan_queue, improve_queue)),
            started_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn health_returns_200() {
        let router = create_router(test_state());
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn add_repo_rejects_malformed_url_with_400() {
        let router = create_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/repos")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"repositoryUrl":"not-a-url"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn add_repo_then_list_round_trips() {
        let router = create_router(test_state());
        let add_response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/repos")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"repositoryUrl":"https://github.com/o/r"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(add_response.status(), StatusCode::CREATED);

        let list_response = router
            .oneshot(Request::builder().uri("/api/repos").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(list_response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(list_response.into_body(), usize::MAX)
            .await
            .unwrap();
        let repos: Vec<TrackedRepository> = serde_json::from_slice(&body).unwrap();
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].url, "https://github.com/o/r");
    }

    #[tokio::test]
    async fn create_job_rejects_empty_file_path_with_400() {
        let router = create_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"repositoryUrl":"https://github.com/o/r","filePath":""}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_job_returns_400_for_unknown_id() {
        let router = create_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .uri(format!("/api/jobs/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
