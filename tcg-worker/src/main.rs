//! Test Coverage Orchestrator - queue consumer process.
//!
//! Hosts the two queue consumers: `scan_queue` at concurrency 2 and
//! `improve_queue` at concurrency 1. No direct IPC with the API process —
//! both share the broker and the store.

#![forbid(unsafe_code)]

mod health;
mod improve_consumer;
mod scan_consumer;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use tcg_common::config::AppConfig;
use tcg_core::ImproveCoverageUseCase;
use tcg_core::ai_generator::SandboxAIGenerator;
use tcg_core::coverage_scanner::NodeCoverageScanner;
use tcg_core::dependency_analyzer::TsDependencyAnalyzer;
use tcg_core::queue::{RedisImproveQueue, RedisScanQueue};
use tcg_core::repo_host::GitHubRepositoryHost;
use tcg_core::sandbox::DockerSandboxRunner;
use tcg_core::store::open_shared_store;
use tcg_core::test_validator::JestTestValidator;
use tokio::sync::watch;
use tracing::info;

use improve_consumer::ImproveConsumer;
use scan_consumer::ScanConsumer;

/// Local probe port; unlike the API's `PORT`, this has no external contract
/// to satisfy and is not part of the documented environment surface.
const HEALTH_PORT: u16 = 3001;

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

    info!("starting test coverage orchestrator worker");

    let store = open_shared_store(&config.db_path).context("failed to open sqlite store")?;

    let redis_client = redis::Client::open(config.redis_url()).context("failed to construct redis client")?;
    let scan_redis_conn = ConnectionManager::new(redis_client.clone())
        .await
        .context("failed to connect to redis (scan queue)")?;
    let improve_redis_conn = ConnectionManager::new(redis_client)
        .await
        .context("failed to connect to redis (improve queue)")?;

    let sandbox = Arc::new(
        DockerSandboxRunner::connect(config.docker_host.as_deref(), config.sandbox_image.clone())
            .context("failed to connect to docker")?,
    );
    sandbox.ensure_toolchain().await;

    let host = Arc::new(GitHubRepositoryHost::new(
        Some(config.github_token.clone()),
        config.host_clone_base_path.clone(),
    ));
    let scanner = Arc::new(NodeCoverageScanner::new(sandbox.clone()));
    let validator = Arc::new(JestTestValidator::new(sandbox.clone()));
    let analyzer = Arc::new(TsDependencyAnalyzer::new());
    let generator = Arc::new(SandboxAIGenerator::new(
        sandbox.clone(),
        validator,
        analyzer,
        Some(config.gemini_api_key.clone()),
    ));

    let scan_queue = Arc::new(RedisScanQueue::new(scan_redis_conn));
    let improve_queue = Arc::new(RedisImproveQueue::new(improve_redis_conn));

    let use_case = Arc::new(ImproveCoverageUseCase::new(store.clone(), host.clone(), generator));

    let scan_consumer = ScanConsumer::new(scan_queue, store.clone(), host, scanner);
    let improve_consumer = ImproveConsumer::new(improve_queue, use_case);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scan_rx = shutdown_rx.clone();
    let scan_task = tokio::spawn(async move { scan_consumer.run(scan_rx).await });

    let improve_rx = shutdown_rx.clone();
    let improve_task = tokio::spawn(async move { improve_consumer.run(improve_rx).await });

    let health_router = health::create_router(Instant::now());
    let health_task = tokio::spawn(health::serve(HEALTH_PORT, health_router));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining in-flight jobs");
    let _ = shutdown_tx.send(true);

    let _ = scan_task.await;
    let _ = improve_task.await;
    health_task.abort();

    info!("worker shut down cleanly");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        signal.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
