//! In-memory fakes for every injected capability, exposed to this crate's
//! own tests and, via the `testing` feature, to `tcg-api`/`tcg-worker`
//! integration tests — mirrors the purpose of `rch_common::mock_worker`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tcg_common::{CoreError, ImprovementJob, TrackedRepository};
use uuid::Uuid;

use crate::ai_generator::AIGenerator;
use crate::queue::{ImproveQueue, QueuedItem, RetryDecision, ScanQueue};
use crate::repo_host::{FileMap, RepositoryHost};
use crate::sandbox::{ContainerRunRequest, RunOutcome, SandboxRunner};
use crate::store::{JobStore, RepoStore};
use tcg_common::{ImproveJobPayload, ScanJobPayload};

/// In-memory [`JobStore`].
#[derive(Default)]
pub struct FakeJobStore {
    jobs: Mutex<HashMap<Uuid, ImprovementJob>>,
}

impl FakeJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for FakeJobStore {
    async fn upsert(&self, job: &ImprovementJob) -> Result<(), CoreError> {
        self.jobs.lock().unwrap().insert(job.id, job.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ImprovementJob>, CoreError> {
        Ok(self.jobs.lock().unwrap().get(&id).cloned())
    }

    async fn find_by_repo(&self, repository_url: &str) -> Result<Vec<ImprovementJob>, CoreError> {
        let mut jobs: Vec<ImprovementJob> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|job| job.repository_url == repository_url)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn find_all(&self) -> Result<Vec<ImprovementJob>, CoreError> {
        let mut jobs: Vec<ImprovementJob> = self.jobs.lock().unwrap().values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn find_active_by_repo(
        &self,
        repository_url: &str,
        exclude_id: Uuid,
    ) -> Result<Option<ImprovementJob>, CoreError> {
        Ok(self
            .find_by_repo(repository_url)
            .await?
            .into_iter()
            .filter(|job| job.id != exclude_id && job.status.is_active())
            .min_by_key(|job| job.created_at))
    }
}

/// In-memory [`RepoStore`].
#[derive(Default)]
pub struct FakeRepoStore {
    repos: Mutex<HashMap<Uuid, TrackedRepository>>,
}

impl FakeRepoStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RepoStore for FakeRepoStore {
    async fn upsert(&self, repo: &TrackedRepository) -> Result<(), CoreError> {
        self.repos.lock().unwrap().insert(repo.id, repo.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<TrackedRepository>, CoreError> {
        Ok(self.repos.lock().unwrap().get(&id).cloned())
    }

    async fn find_by_url(&self, url: &str) -> Result<Option<TrackedRepository>, CoreError> {
        Ok(self.repos.lock().unwrap().values().find(|r| r.url == url).cloned())
    }

    async fn find_all(&self) -> Result<Vec<TrackedRepository>, CoreError> {
        let mut repos: Vec<TrackedRepository> = self.repos.lock().unwrap().values().cloned().collect();
        repos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(repos)
    }
}

/// In-memory [`RepositoryHost`] with a fixed set of known files materialized
/// on `clone`, and configurable permission/dependency answers.
pub struct FakeRepositoryHost {
    permissions_granted: bool,
    required_dependencies_present: bool,
    known_files: HashMap<String, String>,
    pr_url: String,
}

impl FakeRepositoryHost {
    pub fn new() -> Self {
        let mut known_files = HashMap::new();
        known_files.insert("src/svc.ts".to_string(), "export const x = 1;".to_string());
        Self {
            permissions_granted: true,
            required_dependencies_present: true,
            known_files,
            pr_url: "https://github.com/o/r/pull/1".to_string(),
        }
    }

    pub fn denying_permissions() -> Self {
        Self {
            permissions_granted: false,
            ..Self::new()
        }
    }

    pub fn missing_dependencies() -> Self {
        Self {
            required_dependencies_present: false,
            ..Self::new()
        }
    }
}

impl Default for FakeRepositoryHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RepositoryHost for FakeRepositoryHost {
    async fn has_required_dependencies(&self, _url: &str, _deps: &[&str]) -> Result<bool, CoreError> {
        Ok(self.required_dependencies_present)
    }

    async fn check_permissions(&self, _url: &str) -> Result<bool, CoreError> {
        Ok(self.permissions_granted)
    }

    async fn clone(&self, _url: &str, _branch: Option<&str>) -> Result<PathBuf, CoreError> {
        let dir = tempfile::tempdir()
            .map_err(|e| CoreError::Host(format!("failed to create fake clone dir: {e}")))?
            .keep();
        for (rel_path, contents) in &self.known_files {
            let full_path = dir.join(rel_path);
            if let Some(parent) = full_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| CoreError::Host(e.to_string()))?;
            }
            tokio::fs::write(&full_path, contents)
                .await
                .map_err(|e| CoreError::Host(e.to_string()))?;
        }
        Ok(dir)
    }

    fn default_branch(&self, _local_path: &Path) -> Result<String, CoreError> {
        Ok("main".to_string())
    }

    async fn commit_and_push(
        &self,
        _local_path: &Path,
        _branch_name: &str,
        _file_map: &FileMap,
        _commit_message: &str,
        _paths_to_stage: Option<&[PathBuf]>,
    ) -> Result<(), CoreError> {
        Ok(())
    }

    async fn create_pull_request(
        &self,
        _url: &str,
        _head_branch: &str,
        _title: &str,
        _body: &str,
        _base_branch: &str,
    ) -> Result<String, CoreError> {
        Ok(self.pr_url.clone())
    }

    async fn cleanup(&self, local_path: &Path) {
        let _ = tokio::fs::remove_dir_all(local_path).await;
    }
}

/// [`AIGenerator`] that always "succeeds" by writing a trivial test file at
/// the derived path without actually invoking a sandbox or validator.
pub struct FakeAIGenerator {
    test_rel: String,
    should_fail: bool,
}

impl FakeAIGenerator {
    pub fn accepting(test_rel: impl Into<String>) -> Self {
        Self {
            test_rel: test_rel.into(),
            should_fail: false,
        }
    }

    pub fn always_failing() -> Self {
        Self {
            test_rel: String::new(),
            should_fail: true,
        }
    }
}

#[async_trait]
impl AIGenerator for FakeAIGenerator {
    async fn generate_test(
        &self,
        repo_path: &Path,
        _target_source_rel: &str,
        _target_coverage: f64,
    ) -> Result<String, CoreError> {
        if self.should_fail {
            return Err(CoreError::Generation("fake generator always fails".to_string()));
        }
        let full_path = repo_path.join(&self.test_rel);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        tokio::fs::write(&full_path, "it('generated', () => {});")
            .await
            .map_err(|e| CoreError::Generation(e.to_string()))?;
        Ok(self.test_rel.clone())
    }
}

/// [`SandboxRunner`] that returns a fixed, configurable outcome for every
/// invocation without touching Docker.
pub struct FakeSandboxRunner {
    outcome: RunOutcome,
}

impl FakeSandboxRunner {
    pub fn succeeding(output: impl Into<String>) -> Self {
        Self {
            outcome: RunOutcome {
                success: true,
                combined_output: output.into(),
            },
        }
    }

    pub fn failing(output: impl Into<String>) -> Self {
        Self {
            outcome: RunOutcome {
                success: false,
                combined_output: output.into(),
            },
        }
    }
}

#[async_trait]
impl SandboxRunner for FakeSandboxRunner {
    async fn run_in_container(&self, _request: ContainerRunRequest<'_>) -> RunOutcome {
        self.outcome.clone()
    }

    async fn run_on_host(
        &self,
        _command: &str,
        _args: &[String],
        _cwd: &Path,
        _timeout: Duration,
    ) -> Result<RunOutcome, CoreError> {
        Ok(self.outcome.clone())
    }

    async fn ensure_toolchain(&self) {}
}

/// In-memory [`ScanQueue`] that records every enqueue and never yields
/// anything from `dequeue` — enough for HTTP-layer tests that only exercise
/// the enqueue side.
#[derive(Default)]
pub struct FakeScanQueue {
    pub enqueued: Mutex<Vec<(ScanJobPayload, String)>>,
}

impl FakeScanQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScanQueue for FakeScanQueue {
    async fn enqueue(&self, payload: ScanJobPayload, dedupe_key: &str) -> Result<bool, CoreError> {
        self.enqueued.lock().unwrap().push((payload, dedupe_key.to_string()));
        Ok(true)
    }

    async fn dequeue(&self, _block_for: Duration) -> Result<Option<QueuedItem<ScanJobPayload>>, CoreError> {
        Ok(None)
    }

    async fn complete(&self, _item: &QueuedItem<ScanJobPayload>) -> Result<(), CoreError> {
        Ok(())
    }

    async fn fail(&self, _item: QueuedItem<ScanJobPayload>) -> Result<RetryDecision, CoreError> {
        Ok(RetryDecision::Exhausted)
    }
}

/// In-memory [`ImproveQueue`], the `improve_queue` counterpart to
/// [`FakeScanQueue`].
#[derive(Default)]
pub struct FakeImproveQueue {
    pub enqueued: Mutex<Vec<(ImproveJobPayload, String)>>,
}

impl FakeImproveQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ImproveQueue for FakeImproveQueue {
    async fn enqueue(&self, payload: ImproveJobPayload, dedupe_key: &str) -> Result<bool, CoreError> {
        self.enqueued.lock().unwrap().push((payload, dedupe_key.to_string()));
        Ok(true)
    }

    async fn dequeue(&self, _block_for: Duration) -> Result<Option<QueuedItem<ImproveJobPayload>>, CoreError> {
        Ok(None)
    }

    async fn complete(&self, _item: &QueuedItem<ImproveJobPayload>) -> Result<(), CoreError> {
        Ok(())
    }

    async fn fail(&self, _item: QueuedItem<ImproveJobPayload>) -> Result<RetryDecision, CoreError> {
        Ok(RetryDecision::Exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_job_store_round_trips() {
        let store = FakeJobStore::new();
        let job = ImprovementJob::new("https://github.com/o/r", "src/a.ts");
        JobStore::upsert(&store, &job).await.unwrap();
        let found = JobStore::find_by_id(&store, job.id).await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn fake_repository_host_clones_known_files() {
        let host = FakeRepositoryHost::new();
        let path = host.clone("https://github.com/o/r", None).await.unwrap();
        assert!(path.join("src/svc.ts").exists());
    }
}
