//! `improve_queue` consumer: drive one [`ImproveCoverageUseCase`] run per
//! dequeued job. Concurrency 1 — enforced by a single-permit semaphore,
//! which is also what guarantees clone directories never overlap across
//! improvement jobs on this worker.

use std::sync::Arc;
use std::time::Duration;

use tcg_common::JobStatus;
use tcg_core::ImproveCoverageUseCase;
use tcg_core::queue::{ImproveQueue, QueuedItem, RetryDecision};
use tcg_telemetry::metrics::JOBS_TERMINAL_TOTAL;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

const POLL_BLOCK: Duration = Duration::from_secs(5);
const CONCURRENCY: usize = 1;

pub struct ImproveConsumer {
    queue: Arc<dyn ImproveQueue>,
    use_case: Arc<ImproveCoverageUseCase>,
}

impl ImproveConsumer {
    pub fn new(queue: Arc<dyn ImproveQueue>, use_case: Arc<ImproveCoverageUseCase>) -> Self {
        Self { queue, use_case }
    }

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
                    warn!(error = %e, "improve queue dequeue failed");
                    continue;
                }
            };

            let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
            let queue = self.queue.clone();
            let use_case = self.use_case.clone();

            in_flight.spawn(async move {
                let _permit = permit;
                process_one(&queue, &use_case, item).await;
            });
        }

        while in_flight.join_next().await.is_some() {}
    }
}

async fn process_one(
    queue: &Arc<dyn ImproveQueue>,
    use_case: &Arc<ImproveCoverageUseCase>,
    item: QueuedItem<tcg_common::ImproveJobPayload>,
) {
    let job_id = item.payload.job_id;

    // `run` persists the job's own terminal status internally (PR_CREATED or
    // FAILED); only a store-level I/O failure propagates here, in which case
    // the queue's own retry policy applies.
    match use_case.run(job_id).await {
        Ok(status) => {
            let label = match status {
                JobStatus::PrCreated => "completed",
                JobStatus::Failed => "failed",
                other => {
                    warn!(%job_id, ?other, "improve job run returned a non-terminal status");
                    "failed"
                }
            };
            JOBS_TERMINAL_TOTAL.with_label_values(&[label]).inc();
            if let Err(e) = queue.complete(&item).await {
                warn!(error = %e, %job_id, "failed to mark improve job complete");
            }
        }
        Err(e) => {
            warn!(error = %e, %job_id, "improve job run failed before reaching a terminal status");
            match queue.fail(item).await {
                Ok(RetryDecision::Retry { delay }) => {
                    info!(%job_id, delay_secs = delay.as_secs(), "improve job scheduled for retry");
                }
                Ok(RetryDecision::Exhausted) => {
                    warn!(%job_id, "improve job retries exhausted");
                }
                Err(e) => warn!(error = %e, %job_id, "failed to record improve job failure"),
            }
        }
    }
}
