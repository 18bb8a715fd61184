//! Test Coverage Orchestrator - HTTP API process.
//!
//! Exposes the six `CommandSurface` operations over HTTP. Holds no
//! long-running tasks on the request thread; the worker process owns the
//! queue consumers.

#![forbid(unsafe_code)]

mod dto;
mod error;
mod routes;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use tcg_common::config::AppConfig;
use tcg_core::CommandSurface;
use tcg_core::queue::{RedisImproveQueue, RedisScanQueue};
use tcg_core::repo_host::GitHubRepositoryHost;
use tcg_core::store::open_shared_store;
use tracing::info;

use routes::ApiState;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env().map_err(|errors| {
        anyhow::anyhow!(
            "configuration error: {}",
            errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(", ")
        )
    })?;

    let log_config = tcg_telemetry::LogConfig::from_app_config(&config, "info").with_stderr();
    let _logging_guard = tcg_telemetry::init_logging(&log_config).context("failed to initialize logging")?;
    tcg_telemetry::metrics::register();

    info!(port = config.port, "starting test coverage orchestrator API");

    let store = open_shared_store(&config.db_path).context("failed to open sqlite store")?;

    let redis_client =
        redis::Client::open(config.redis_url()).context("failed to construct redis client")?;
    let redis_conn = ConnectionManager::new(redis_client)
        .await
        .context("failed to connect to redis")?;

    let host = Arc::new(GitHubRepositoryHost::new(
        Some(config.github_token.clone()),
        config.host_clone_base_path.clone(),
    ));
    let scan_queue = Arc::new(RedisScanQueue::new(redis_conn.clone()));
    let improve_queue = Arc::new(RedisImproveQueue::new(redis_conn));

    let surface = Arc::new(CommandSurface::new(
        store.clone(),
        store,
        host,
        scan_queue,
        improve_queue,
    ));

    let state = ApiState {
        surface,
        started_at: Instant::now(),
    };
    let router = routes::create_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");
    axum::serve(listener, router).await.context("server error")?;

    Ok(())
}
