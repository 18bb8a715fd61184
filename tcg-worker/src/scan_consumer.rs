//! `scan_queue` consumer: clone a tracked repository read-only, scan it for
//! coverage, persist the report. Concurrency 2.

use std::sync::Arc;
use std::time::Duration;

use tcg_common::CoreError;
use tcg_core::coverage_scanner::CoverageScanner;
use tcg_core::queue::{QueuedItem, RetryDecision, ScanQueue};
use tcg_core::repo_host::RepositoryHost;
use tcg_core::store::RepoStore;
use tcg_telemetry::metrics::SCAN_DURATION_SECONDS;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

const POLL_BLOCK: Duration = Duration::from_secs(5);
const CONCURRENCY: usize = 2;

pub struct ScanConsumer {
    queue: Arc<dyn ScanQueue>,
    repos: Arc<dyn RepoStore>,
    host: Arc<dyn RepositoryHost>,
    scanner: Arc<dyn CoverageScanner>,
}

impl ScanConsumer {
    pub fn new(
        queue: Arc<dyn ScanQueue>,
        repos: Arc<dyn RepoStore>,
        host: Arc<dyn RepositoryHost>,
        scanner: Arc<dyn CoverageScanner>,
    ) -> Self {
        Self {
            queue,
            repos,
            host,
            scanner,
        }
    }

    /// Drain the queue until `shutdown` fires, bounding in-flight scans to
    /// [`CONCURRENCY`] and waiting for those already started before returning.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(CONCURRENCY));
        let mut in_flight = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let item = tokio::select! {
                result = self.queue.dequeue(POLL_BLOCK) => result,
                _ = shutdown.changed() => continue,
            };

            let item = match item {
                Ok(Some(item)) => item,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "scan queue dequeue failed");
                    continue;
                }
            };

            let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
            let repos = self.repos.clone();
            let host = self.host.clone();
            let scanner = self.scanner.clone();
            let queue = self.queue.clone();

            in_flight.spawn(async move {
                let _permit = permit;
                process_one(&queue, &repos, &host, &scanner, item).await;
            });
        }

        while in_flight.join_next().await.is_some() {}
    }
}

async fn process_one(
    queue: &Arc<dyn ScanQueue>,
    repos: &Arc<dyn RepoStore>,
    host: &Arc<dyn RepositoryHost>,
    scanner: &Arc<dyn CoverageScanner>,
    item: QueuedItem<tcg_common::ScanJobPayload>,
) {
    let repo_id = item.payload.repo_id;
    let outcome = scan_repo(repos, host, scanner, repo_id).await;

    match outcome {
        Ok(()) => {
            if let Err(e) = queue.complete(&item).await {
                warn!(error = %e, %repo_id, "failed to mark scan job complete");
            }
        }
        Err(e) => {
            warn!(error = %e, %repo_id, "coverage scan failed");
            match queue.fail(item).await {
                Ok(RetryDecision::Retry { delay }) => {
                    info!(%repo_id, delay_secs = delay.as_secs(), "scan scheduled for retry");
                }
                Ok(RetryDecision::Exhausted) => {
                    warn!(%repo_id, "scan retries exhausted");
                }
                Err(e) => warn!(error = %e, %repo_id, "failed to record scan failure"),
            }
        }
    }
}

async fn scan_repo(
    repos: &Arc<dyn RepoStore>,
    host: &Arc<dyn RepositoryHost>,
    scanner: &Arc<dyn CoverageScanner>,
    repo_id: uuid::Uuid,
) -> Result<(), CoreError> {
    let Some(mut repo) = repos.find_by_id(repo_id).await? else {
        info!(%repo_id, "scan job skipped: repository no longer tracked");
        return Ok(());
    };

    let local_path = host.clone(&repo.url, None).await?;
    let timer = SCAN_DURATION_SECONDS.with_label_values(&[]).start_timer();
    let scan_result = scanner.scan(&local_path).await;
    timer.observe_duration();
    host.cleanup(&local_path).await;

    let report = scan_result?;
    repo.set_coverage_report(report);
    repos.upsert(&repo).await?;
    Ok(())
}
