//! C10 — `CommandSurface`: the six operations the API process exposes,
//! mapped 1:1 onto the HTTP endpoints.

use std::sync::Arc;

use tcg_common::{CoreError, ImprovementJob, ScanJobPayload, TrackedRepository};
use tcg_common::{ImproveJobPayload, improve_job_key, scan_job_key};
use uuid::Uuid;

use crate::queue::{ImproveQueue, ScanQueue};
use crate::repo_host::{RepositoryHost, parse_github_url};
use crate::store::{JobStore, RepoStore};

/// Dependencies a repository must declare before it is accepted for
/// tracking: the test runner and its TypeScript integration.
const REQUIRED_DEPENDENCIES: &[&str] = &["jest", "ts-jest"];

/// C10: the orchestrator's command surface. Holds no business logic of its
/// own beyond validation and enqueue/persist wiring — all actual work
/// happens in the worker via [`crate::use_case::ImproveCoverageUseCase`] and
/// the scan consumer.
pub struct CommandSurface {
    repos: Arc<dyn RepoStore>,
    jobs: Arc<dyn JobStore>,
    host: Arc<dyn RepositoryHost>,
    scan_queue: Arc<dyn ScanQueue>,
    improve_queue: Arc<dyn ImproveQueue>,
}

impl CommandSurface {
    pub fn new(
        repos: Arc<dyn RepoStore>,
        jobs: Arc<dyn JobStore>,
        host: Arc<dyn RepositoryHost>,
        scan_queue: Arc<dyn ScanQueue>,
        improve_queue: Arc<dyn ImproveQueue>,
    ) -> Self {
        Self {
            repos,
            jobs,
            host,
            scan_queue,
            improve_queue,
        }
    }

    pub async fn list_repos(&self) -> Result<Vec<TrackedRepository>, CoreError> {
        self.repos.find_all().await
    }

    /// Register a repository and enqueue its first scan. An already-tracked
    /// URL is returned as-is, without re-checking dependencies or
    /// re-enqueuing a scan.
    pub async fn add_repo(&self, url: &str) -> Result<TrackedRepository, CoreError> {
        parse_github_url(url)?;

        if let Some(existing) = self.repos.find_by_url(url).await? {
            return Ok(existing);
        }

        if !self
            .host
            .has_required_dependencies(url, REQUIRED_DEPENDENCIES)
            .await?
        {
            return Err(CoreError::MissingDependencies(
                REQUIRED_DEPENDENCIES.iter().map(|d| d.to_string()).collect(),
            ));
        }

        let repo = TrackedRepository::new(url);
        self.repos.upsert(&repo).await?;
        self.enqueue_scan(repo.id).await?;
        Ok(repo)
    }

    /// Re-scan an already-tracked repository on demand.
    pub async fn trigger_scan(&self, repo_id: Uuid) -> Result<(), CoreError> {
        self.repos
            .find_by_id(repo_id)
            .await?
            .ok_or(CoreError::RepoNotFound)?;
        self.enqueue_scan(repo_id).await
    }

    async fn enqueue_scan(&self, repo_id: Uuid) -> Result<(), CoreError> {
        let key = scan_job_key(repo_id, chrono::Utc::now().timestamp_millis());
        self.scan_queue.enqueue(ScanJobPayload { repo_id }, &key).await?;
        Ok(())
    }

    /// List jobs, optionally scoped to one repository.
    pub async fn list_jobs(&self, repo_id: Option<Uuid>) -> Result<Vec<ImprovementJob>, CoreError> {
        match repo_id {
            None => self.jobs.find_all().await,
            Some(repo_id) => {
                let repo = self
                    .repos
                    .find_by_id(repo_id)
                    .await?
                    .ok_or(CoreError::RepoNotFound)?;
                self.jobs.find_by_repo(&repo.url).await
            }
        }
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<ImprovementJob, CoreError> {
        self.jobs.find_by_id(job_id).await?.ok_or(CoreError::JobNotFound)
    }

    /// Create a new improvement job and enqueue it. A repository already
    /// running an active (non-terminal) job for the same URL does not block
    /// creation — the guard only produces a diagnostic — since serialization
    /// happens per clone directory at the worker level, not per repository.
    pub async fn create_job(
        &self,
        repository_url: &str,
        file_path: &str,
        target_coverage: Option<f64>,
    ) -> Result<ImprovementJob, CoreError> {
        parse_github_url(repository_url)?;
        if file_path.trim().is_empty() {
            return Err(CoreError::MissingField("file_path"));
        }

        let mut job = ImprovementJob::new(repository_url, file_path);
        if let Some(target_coverage) = target_coverage {
            job = job.with_target_coverage(target_coverage);
        }

        if let Some(active) = self.jobs.find_active_by_repo(repository_url, job.id).await? {
            tracing::warn!(
                repository_url,
                active_job_id = %active.id,
                "creating improvement job while another is already active for this repository"
            );
        }

        self.jobs.upsert(&job).await?;

        let key = improve_job_key(job.id);
        self.improve_queue
            .enqueue(ImproveJobPayload { job_id: job.id }, &key)
            .await?;

        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeJobStore, FakeRepoStore, FakeRepositoryHost};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tcg_common::JobStatus;

    #[derive(Default)]
    struct RecordingScanQueue {
        enqueued: Mutex<Vec<(Uuid, String)>>,
    }

    #[async_trait::async_trait]
    impl ScanQueue for RecordingScanQueue {
        async fn enqueue(&self, payload: ScanJobPayload, dedupe_key: &str) -> Result<bool, CoreError> {
            self.enqueued
                .lock()
                .unwrap()
                .push((payload.repo_id, dedupe_key.to_string()));
            Ok(true)
        }
        async fn dequeue(
            &self,
            _block_for: Duration,
        ) -> Result<Option<crate::queue::QueuedItem<ScanJobPayload>>, CoreError> {
            Ok(None)
        }
        async fn complete(&self, _item: &crate::queue::QueuedItem<ScanJobPayload>) -> Result<(), CoreError> {
            Ok(())
        }
        async fn fail(
            &self,
            _item: crate::queue::QueuedItem<ScanJobPayload>,
        ) -> Result<crate::queue::RetryDecision, CoreError> {
            Ok(crate::queue::RetryDecision::Exhausted)
        }
    }

    #[derive(Default)]
    struct RecordingImproveQueue {
        enqueued: Mutex<HashMap<String, Uuid>>,
    }

    #[async_trait::async_trait]
    impl ImproveQueue for RecordingImproveQueue {
        async fn enqueue(&self, payload: ImproveJobPayload, dedupe_key: &str) -> Result<bool, CoreError> {
            self.enqueued
                .lock()
                .unwrap()
                .insert(dedupe_key.to_string(), payload.job_id);
            Ok(true)
        }
        async fn dequeue(
            &self,
            _block_for: Duration,
        ) -> Result<Option<crate::queue::QueuedItem<ImproveJobPayload>>, CoreError> {
            Ok(None)
        }
        async fn complete(&self, _item: &crate::queue::QueuedItem<ImproveJobPayload>) -> Result<(), CoreError> {
            Ok(())
        }
        async fn fail(
            &self,
            _item: crate::queue::QueuedItem<ImproveJobPayload>,
        ) -> Result<crate::queue::RetryDecision, CoreError> {
            Ok(crate::queue::RetryDecision::Exhausted)
        }
    }

    fn surface() -> CommandSurface {
        surface_with_host(Arc::new(FakeRepositoryHost::new()))
    }

    fn surface_with_host(host: Arc<dyn RepositoryHost>) -> CommandSurface {
        CommandSurface::new(
            Arc::new(FakeRepoStore::new()),
            Arc::new(FakeJobStore::new()),
            host,
            Arc::new(RecordingScanQueue::default()),
            Arc::new(RecordingImproveQueue::default()),
        )
    }

    #[tokio::test]
    async fn add_repo_rejects_malformed_url() {
        let surface = surface();
        let result = surface.add_repo("not-a-url").await;
        assert!(matches!(result, Err(CoreError::InvalidRepoUrl(_))));
    }

    #[tokio::test]
    async fn add_repo_persists_and_lists() {
        let surface = surface();
        surface.add_repo("https://github.com/o/r").await.unwrap();
        let repos = surface.list_repos().await.unwrap();
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].url, "https://github.com/o/r");
    }

    #[tokio::test]
    async fn add_repo_rejects_missing_dependencies() {
        let surface = surface_with_host(Arc::new(FakeRepositoryHost::missing_dependencies()));
        let result = surface.add_repo("https://github.com/o/r").await;
        assert!(matches!(result, Err(CoreError::MissingDependencies(_))));
    }

    #[tokio::test]
    async fn add_repo_returns_existing_without_duplicating() {
        let surface = surface();
        let first = surface.add_repo("https://github.com/o/r").await.unwrap();
        let second = surface.add_repo("https://github.com/o/r").await.unwrap();
        assert_eq!(first.id, second.id);

        let repos = surface.list_repos().await.unwrap();
        assert_eq!(repos.len(), 1);
    }

    #[tokio::test]
    async fn trigger_scan_rejects_unknown_repo() {
        let surface = surface();
        let result = surface.trigger_scan(Uuid::new_v4()).await;
        assert!(matches!(result, Err(CoreError::RepoNotFound)));
    }

    #[tokio::test]
    async fn create_job_rejects_empty_file_path() {
        let surface = surface();
        let result = surface.create_job("https://github.com/o/r", "   ", None).await;
        assert!(matches!(result, Err(CoreError::MissingField("file_path"))));
    }

    #[tokio::test]
    async fn create_job_defaults_to_queued_status() {
        let surface = surface();
        let job = surface
            .create_job("https://github.com/o/r", "src/a.ts", None)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.target_coverage, 80.0);
    }

    #[tokio::test]
    async fn create_job_honors_explicit_target_coverage() {
        let surface = surface();
        let job = surface
            .create_job("https://github.com/o/r", "src/a.ts", Some(95.0))
            .await
            .unwrap();
        assert_eq!(job.target_coverage, 95.0);
    }

    #[tokio::test]
    async fn get_job_returns_not_found_for_unknown_id() {
        let surface = surface();
        let result = surface.get_job(Uuid::new_v4()).await;
        assert!(matches!(result, Err(CoreError::JobNotFound)));
    }

    #[tokio::test]
    async fn list_jobs_scoped_to_repo_filters_by_url() {
        let surface = surface();
        let repo = surface.add_repo("https://github.com/o/r").await.unwrap();
        surface
            .create_job("https://github.com/o/r", "src/a.ts", None)
            .await
            .unwrap();
        surface
            .create_job("https://github.com/o/other", "src/b.ts", None)
            .await
            .unwrap();

        let scoped = surface.list_jobs(Some(repo.id)).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].file_path, "src/a.ts");
    }
}
