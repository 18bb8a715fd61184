//! C9 — `ImproveCoverageUseCase`: the single orchestration path a worker
//! drives an `IMPROVE` job through, end to end.

use std::path::PathBuf;
use std::sync::Arc;

use tcg_common::{CoreError, ImprovementJob, JobStatus};
use uuid::Uuid;

use crate::ai_generator::AIGenerator;
use crate::repo_host::{FileMap, RepositoryHost};
use crate::store::JobStore;

/// C9: drives one [`ImprovementJob`] from `QUEUED` to a terminal status,
/// persisting each transition before the next step begins so a crash mid-job
/// never leaves the store looking more advanced than it is.
pub struct ImproveCoverageUseCase {
    jobs: Arc<dyn JobStore>,
    host: Arc<dyn RepositoryHost>,
    generator: Arc<dyn AIGenerator>,
}

impl ImproveCoverageUseCase {
    pub fn new(jobs: Arc<dyn JobStore>, host: Arc<dyn RepositoryHost>, generator: Arc<dyn AIGenerator>) -> Self {
        Self { jobs, host, generator }
    }

    /// Run the job identified by `job_id` to completion, returning the
    /// terminal status it reached. Every failure mode — clone refusal,
    /// missing source, generation exhaustion, push/PR failure — is caught
    /// and persisted as `mark_failed` rather than propagated, since the
    /// job's terminal state in the store IS the result; only store I/O
    /// failures themselves propagate.
    pub async fn run(&self, job_id: Uuid) -> Result<JobStatus, CoreError> {
        let mut job = self.jobs.find_by_id(job_id).await?.ok_or(CoreError::JobNotFound)?;

        let mut local_path: Option<PathBuf> = None;
        let outcome = self.drive(&mut job, &mut local_path).await;

        match outcome {
            Ok(pr_link) => job.mark_pr_created(pr_link),
            Err(e) => job.mark_failed(e.job_message()),
        }
        self.jobs.upsert(&job).await?;

        if let Some(local_path) = local_path {
            self.host.cleanup(&local_path).await;
        }

        Ok(job.status)
    }

    async fn drive(&self, job: &mut ImprovementJob, local_path: &mut Option<PathBuf>) -> Result<String, CoreError> {
        job.transition(JobStatus::Cloning);
        self.jobs.upsert(job).await?;

        if !self.host.check_permissions(&job.repository_url).await? {
            return Err(CoreError::InsufficientPermissions);
        }

        let cloned_path = self.host.clone(&job.repository_url, None).await?;
        *local_path = Some(cloned_path.clone());

        let source_full_path = cloned_path.join(&job.file_path);
        if !tokio::fs::metadata(&source_full_path).await.is_ok() {
            return Err(CoreError::SourceMissing(job.file_path.clone()));
        }

        job.transition(JobStatus::Analyzing);
        self.jobs.upsert(job).await?;
        let default_branch = self.host.default_branch(&cloned_path)?;

        job.transition(JobStatus::Generating);
        self.jobs.upsert(job).await?;
        let test_rel = self
            .generator
            .generate_test(&cloned_path, &job.file_path, job.target_coverage)
            .await?;

        job.transition(JobStatus::Pushing);
        self.jobs.upsert(job).await?;

        let test_full_path = cloned_path.join(&test_rel);
        let test_contents = tokio::fs::read_to_string(&test_full_path)
            .await
            .map_err(|e| CoreError::Push(format!("failed to read generated test for push: {e}")))?;
        let mut file_map: FileMap = FileMap::new();
        file_map.insert(PathBuf::from(&test_rel), test_contents);

        let branch_name = format!("improve-coverage-{}", job.id);
        let commit_message = format!("test: improve coverage for {}", job.file_path);
        self.host
            .commit_and_push(&cloned_path, &branch_name, &file_map, &commit_message, None)
            .await?;

        let title = format!("Improve test coverage for {}", job.file_path);
        let body = format!(
            "Automatically generated test to raise line coverage of `{}` to at least {:.1}%.",
            job.file_path, job.target_coverage
        );
        let pr_link = self
            .host
            .create_pull_request(&job.repository_url, &branch_name, &title, &body, &default_branch)
            .await?;

        Ok(pr_link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeAIGenerator, FakeJobStore, FakeRepositoryHost};

    #[tokio::test]
    async fn happy_path_reaches_pr_created() {
        let jobs: Arc<dyn JobStore> = Arc::new(FakeJobStore::new());
        let host: Arc<dyn RepositoryHost> = Arc::new(FakeRepositoryHost::new());
        let generator: Arc<dyn AIGenerator> = Arc::new(FakeAIGenerator::accepting("src/svc.test.ts"));

        let job = ImprovementJob::new("https://github.com/o/r", "src/svc.ts");
        let job_id = job.id;
        jobs.upsert(&job).await.unwrap();

        let use_case = ImproveCoverageUseCase::new(jobs.clone(), host, generator);
        use_case.run(job_id).await.unwrap();

        let stored = jobs.find_by_id(job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::PrCreated);
        assert!(stored.pr_link.is_some());
    }

    #[tokio::test]
    async fn insufficient_permissions_marks_job_failed() {
        let jobs: Arc<dyn JobStore> = Arc::new(FakeJobStore::new());
        let host: Arc<dyn RepositoryHost> = Arc::new(FakeRepositoryHost::denying_permissions());
        let generator: Arc<dyn AIGenerator> = Arc::new(FakeAIGenerator::accepting("src/svc.test.ts"));

        let job = ImprovementJob::new("https://github.com/o/r", "src/svc.ts");
        let job_id = job.id;
        jobs.upsert(&job).await.unwrap();

        let use_case = ImproveCoverageUseCase::new(jobs.clone(), host, generator);
        use_case.run(job_id).await.unwrap();

        let stored = jobs.find_by_id(job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("Insufficient permissions"));
    }

    #[tokio::test]
    async fn missing_source_file_marks_job_failed() {
        let jobs: Arc<dyn JobStore> = Arc::new(FakeJobStore::new());
        let host: Arc<dyn RepositoryHost> = Arc::new(FakeRepositoryHost::new());
        let generator: Arc<dyn AIGenerator> = Arc::new(FakeAIGenerator::accepting("src/svc.test.ts"));

        let job = ImprovementJob::new("https://github.com/o/r", "src/missing.ts");
        let job_id = job.id;
        jobs.upsert(&job).await.unwrap();

        let use_case = ImproveCoverageUseCase::new(jobs.clone(), host, generator);
        use_case.run(job_id).await.unwrap();

        let stored = jobs.find_by_id(job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
    }
}
