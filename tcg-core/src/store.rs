//! C2 — `JobStore` / `RepoStore`: durable, strongly-typed persistence for
//! [`ImprovementJob`] and [`TrackedRepository`], backed by pooled SQLite the
//! way `rch-telemetry` persists build history.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use tcg_common::{CoreError, FileCoverage, ImprovementJob, JobStatus, TrackedRepository};
use uuid::Uuid;

/// C2: durable storage for improvement jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn upsert(&self, job: &ImprovementJob) -> Result<(), CoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<ImprovementJob>, CoreError>;
    async fn find_by_repo(&self, repository_url: &str) -> Result<Vec<ImprovementJob>, CoreError>;
    async fn find_all(&self) -> Result<Vec<ImprovementJob>, CoreError>;
    /// The oldest active (non-terminal) job for `repository_url`, excluding
    /// `exclude_id`, or `None` if there isn't one — used to guard against
    /// two concurrent improvement jobs racing the same repository.
    async fn find_active_by_repo(
        &self,
        repository_url: &str,
        exclude_id: Uuid,
    ) -> Result<Option<ImprovementJob>, CoreError>;
}

/// C2: durable storage for tracked repositories.
#[async_trait]
pub trait RepoStore: Send + Sync {
    async fn upsert(&self, repo: &TrackedRepository) -> Result<(), CoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<TrackedRepository>, CoreError>;
    async fn find_by_url(&self, url: &str) -> Result<Option<TrackedRepository>, CoreError>;
    async fn find_all(&self) -> Result<Vec<TrackedRepository>, CoreError>;
}

/// Shared SQLite-backed store for both entities; the schema lives in one
/// database file, mirroring `rch`'s single-file build-history store.
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self, CoreError> {
        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::new(manager).map_err(|e| CoreError::Store(format!("pool init failed: {e}")))?;
        let store = Self { pool };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), CoreError> {
        let conn = self.connection()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS improvement_jobs (
                id TEXT PRIMARY KEY,
                repository_url TEXT NOT NULL,
                file_path TEXT NOT NULL,
                target_coverage REAL NOT NULL,
                status TEXT NOT NULL,
                pr_link TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_repository_url ON improvement_jobs(repository_url);

            CREATE TABLE IF NOT EXISTS tracked_repositories (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL UNIQUE,
                last_coverage_report TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )
        .map_err(|e| CoreError::Store(format!("migration failed: {e}")))?;
        Ok(())
    }

    fn connection(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, CoreError> {
        self.pool
            .get()
            .map_err(|e| CoreError::Store(format!("pool checkout failed: {e}")))
    }
}

fn status_to_text(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Queued => "QUEUED",
        JobStatus::Cloning => "CLONING",
        JobStatus::Analyzing => "ANALYZING",
        JobStatus::Generating => "GENERATING",
        JobStatus::Pushing => "PUSHING",
        JobStatus::PrCreated => "PR_CREATED",
        JobStatus::Failed => "FAILED",
    }
}

fn status_from_text(text: &str) -> Result<JobStatus, CoreError> {
    match text {
        "QUEUED" => Ok(JobStatus::Queued),
        "CLONING" => Ok(JobStatus::Cloning),
        "ANALYZING" => Ok(JobStatus::Analyzing),
        "GENERATING" => Ok(JobStatus::Generating),
        "PUSHING" => Ok(JobStatus::Pushing),
        "PR_CREATED" => Ok(JobStatus::PrCreated),
        "FAILED" => Ok(JobStatus::Failed),
        other => Err(CoreError::Store(format!("unknown job status in database: {other}"))),
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Uuid, String, String, f64, String, Option<String>, Option<String>, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn job_from_row(
    (id, repository_url, file_path, target_coverage, status, pr_link, error_message, created_at, updated_at): (
        Uuid,
        String,
        String,
        f64,
        String,
        Option<String>,
        Option<String>,
        String,
        String,
    ),
) -> Result<ImprovementJob, CoreError> {
    Ok(ImprovementJob {
        id,
        repository_url,
        file_path,
        target_coverage,
        status: status_from_text(&status)?,
        pr_link,
        error_message,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, CoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::Store(format!("malformed timestamp {text}: {e}")))
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn upsert(&self, job: &ImprovementJob) -> Result<(), CoreError> {
        let conn = self.connection()?;
        let job = job.clone();
        tokio::task::spawn_blocking(move || {
            conn.execute(
                "INSERT INTO improvement_jobs
                    (id, repository_url, file_path, target_coverage, status, pr_link, error_message, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    repository_url = excluded.repository_url,
                    file_path = excluded.file_path,
                    target_coverage = excluded.target_coverage,
                    status = excluded.status,
                    pr_link = excluded.pr_link,
                    error_message = excluded.error_message,
                    updated_at = excluded.updated_at",
                params![
                    job.id.to_string(),
                    job.repository_url,
                    job.file_path,
                    job.target_coverage,
                    status_to_text(job.status),
                    job.pr_link,
                    job.error_message,
                    job.created_at.to_rfc3339(),
                    job.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| CoreError::Store(format!("job upsert failed: {e}")))
        })
        .await
        .map_err(|e| CoreError::Store(format!("upsert task panicked: {e}")))??;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ImprovementJob>, CoreError> {
        let conn = self.connection()?;
        tokio::task::spawn_blocking(move || {
            let result = conn.query_row(
                "SELECT id, repository_url, file_path, target_coverage, status, pr_link, error_message, created_at, updated_at
                 FROM improvement_jobs WHERE id = ?1",
                params![id.to_string()],
                row_to_job,
            );
            match result {
                Ok(row) => job_from_row(row).map(Some),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(CoreError::Store(format!("job lookup failed: {e}"))),
            }
        })
        .await
        .map_err(|e| CoreError::Store(format!("lookup task panicked: {e}")))?
    }

    async fn find_by_repo(&self, repository_url: &str) -> Result<Vec<ImprovementJob>, CoreError> {
        let conn = self.connection()?;
        let repository_url = repository_url.to_string();
        tokio::task::spawn_blocking(move || {
            let mut stmt = conn
                .prepare(
                    "SELECT id, repository_url, file_path, target_coverage, status, pr_link, error_message, created_at, updated_at
                     FROM improvement_jobs WHERE repository_url = ?1 ORDER BY created_at DESC",
                )
                .map_err(|e| CoreError::Store(format!("query prepare failed: {e}")))?;
            let rows = stmt
                .query_map(params![repository_url], row_to_job)
                .map_err(|e| CoreError::Store(format!("query failed: {e}")))?;
            rows.map(|r| r.map_err(|e| CoreError::Store(format!("row decode failed: {e}"))).and_then(job_from_row))
                .collect()
        })
        .await
        .map_err(|e| CoreError::Store(format!("query task panicked: {e}")))?
    }

    async fn find_all(&self) -> Result<Vec<ImprovementJob>, CoreError> {
        let conn = self.connection()?;
        tokio::task::spawn_blocking(move || {
            let mut stmt = conn
                .prepare(
                    "SELECT id, repository_url, file_path, target_coverage, status, pr_link, error_message, created_at, updated_at
                     FROM improvement_jobs ORDER BY created_at DESC",
                )
                .map_err(|e| CoreError::Store(format!("query prepare failed: {e}")))?;
            let rows = stmt
                .query_map([], row_to_job)
                .map_err(|e| CoreError::Store(format!("query failed: {e}")))?;
            rows.map(|r| r.map_err(|e| CoreError::Store(format!("row decode failed: {e}"))).and_then(job_from_row))
                .collect()
        })
        .await
        .map_err(|e| CoreError::Store(format!("query task panicked: {e}")))?
    }

    async fn find_active_by_repo(
        &self,
        repository_url: &str,
        exclude_id: Uuid,
    ) -> Result<Option<ImprovementJob>, CoreError> {
        let all = self.find_by_repo(repository_url).await?;
        Ok(all
            .into_iter()
            .filter(|job| job.id != exclude_id && job.status.is_active())
            .min_by_key(|job| job.created_at))
    }
}

fn row_to_repo(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Uuid, String, Option<String>, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn repo_from_row(
    (id, url, last_coverage_report, created_at, updated_at): (Uuid, String, Option<String>, String, String),
) -> Result<TrackedRepository, CoreError> {
    let last_coverage_report = last_coverage_report
        .map(|text| {
            serde_json::from_str::<Vec<FileCoverage>>(&text)
                .map_err(|e| CoreError::Store(format!("malformed coverage report: {e}")))
        })
        .transpose()?;
    Ok(TrackedRepository {
        id,
        url,
        last_coverage_report,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[async_trait]
impl RepoStore for SqliteStore {
    async fn upsert(&self, repo: &TrackedRepository) -> Result<(), CoreError> {
        let conn = self.connection()?;
        let repo = repo.clone();
        let report_json = repo
            .last_coverage_report
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| CoreError::Store(format!("coverage report serialize failed: {e}")))?;

        tokio::task::spawn_blocking(move || {
            conn.execute(
                "INSERT INTO tracked_repositories (id, url, last_coverage_report, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    url = excluded.url,
                    last_coverage_report = excluded.last_coverage_report,
                    updated_at = excluded.updated_at",
                params![
                    repo.id.to_string(),
                    repo.url,
                    report_json,
                    repo.created_at.to_rfc3339(),
                    repo.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| CoreError::Store(format!("repo upsert failed: {e}")))
        })
        .await
        .map_err(|e| CoreError::Store(format!("upsert task panicked: {e}")))??;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<TrackedRepository>, CoreError> {
        let conn = self.connection()?;
        tokio::task::spawn_blocking(move || {
            let result = conn.query_row(
                "SELECT id, url, last_coverage_report, created_at, updated_at
                 FROM tracked_repositories WHERE id = ?1",
                params![id.to_string()],
                row_to_repo,
            );
            match result {
                Ok(row) => repo_from_row(row).map(Some),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(CoreError::Store(format!("repo lookup failed: {e}"))),
            }
        })
        .await
        .map_err(|e| CoreError::Store(format!("lookup task panicked: {e}")))?
    }

    async fn find_by_url(&self, url: &str) -> Result<Option<TrackedRepository>, CoreError> {
        let conn = self.connection()?;
        let url = url.to_string();
        tokio::task::spawn_blocking(move || {
            let result = conn.query_row(
                "SELECT id, url, last_coverage_report, created_at, updated_at
                 FROM tracked_repositories WHERE url = ?1",
                params![url],
                row_to_repo,
            );
            match result {
                Ok(row) => repo_from_row(row).map(Some),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(CoreError::Store(format!("repo lookup failed: {e}"))),
            }
        })
        .await
        .map_err(|e| CoreError::Store(format!("lookup task panicked: {e}")))?
    }

    async fn find_all(&self) -> Result<Vec<TrackedRepository>, CoreError> {
        let conn = self.connection()?;
        tokio::task::spawn_blocking(move || {
            let mut stmt = conn
                .prepare(
                    "SELECT id, url, last_coverage_report, created_at, updated_at
                     FROM tracked_repositories ORDER BY created_at DESC",
                )
                .map_err(|e| CoreError::Store(format!("query prepare failed: {e}")))?;
            let rows = stmt
                .query_map([], row_to_repo)
                .map_err(|e| CoreError::Store(format!("query failed: {e}")))?;
            rows.map(|r| r.map_err(|e| CoreError::Store(format!("row decode failed: {e}"))).and_then(repo_from_row))
                .collect()
        })
        .await
        .map_err(|e| CoreError::Store(format!("query task panicked: {e}")))?
    }
}

/// Convenience alias for the common case of sharing one store across
/// both trait objects.
pub fn open_shared_store(db_path: &Path) -> Result<Arc<SqliteStore>, CoreError> {
    Ok(Arc::new(SqliteStore::open(db_path)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn job_round_trips_through_upsert_and_find() {
        let (_dir, store) = temp_store();
        let job = ImprovementJob::new("https://github.com/o/r", "src/svc.ts");
        JobStore::upsert(&store, &job).await.unwrap();

        let found = JobStore::find_by_id(&store, job.id).await.unwrap().unwrap();
        assert_eq!(found.id, job.id);
        assert_eq!(found.status, JobStatus::Queued);
        assert_eq!(found.target_coverage, 80.0);
    }

    #[tokio::test]
    async fn job_upsert_overwrites_existing_row() {
        let (_dir, store) = temp_store();
        let mut job = ImprovementJob::new("https://github.com/o/r", "src/svc.ts");
        JobStore::upsert(&store, &job).await.unwrap();

        job.mark_failed("Insufficient permissions");
        JobStore::upsert(&store, &job).await.unwrap();

        let found = JobStore::find_by_id(&store, job.id).await.unwrap().unwrap();
        assert_eq!(found.status, JobStatus::Failed);
        assert_eq!(found.error_message.as_deref(), Some("Insufficient permissions"));
    }

    #[tokio::test]
    async fn find_active_by_repo_excludes_terminal_and_self() {
        let (_dir, store) = temp_store();
        let repo_url = "https://github.com/o/r";

        let active_job = ImprovementJob::new(repo_url, "src/a.ts");
        JobStore::upsert(&store, &active_job).await.unwrap();

        let mut other_active = ImprovementJob::new(repo_url, "src/b.ts");
        other_active.transition(JobStatus::Cloning);
        JobStore::upsert(&store, &other_active).await.unwrap();

        let mut terminal_job = ImprovementJob::new(repo_url, "src/c.ts");
        terminal_job.mark_failed("boom");
        JobStore::upsert(&store, &terminal_job).await.unwrap();

        let active = JobStore::find_active_by_repo(&store, repo_url, active_job.id)
            .await
            .unwrap();
        assert_eq!(active.unwrap().id, other_active.id);
    }

    #[tokio::test]
    async fn find_active_by_repo_returns_the_oldest_active_job() {
        let (_dir, store) = temp_store();
        let repo_url = "https://github.com/o/r";

        let mut newer = ImprovementJob::new(repo_url, "src/newer.ts");
        newer.created_at -= chrono::Duration::seconds(10);
        JobStore::upsert(&store, &newer).await.unwrap();

        let mut older = ImprovementJob::new(repo_url, "src/older.ts");
        older.created_at -= chrono::Duration::seconds(60);
        JobStore::upsert(&store, &older).await.unwrap();

        let excluded = ImprovementJob::new(repo_url, "src/self.ts");
        JobStore::upsert(&store, &excluded).await.unwrap();

        let active = JobStore::find_active_by_repo(&store, repo_url, excluded.id)
            .await
            .unwrap();
        assert_eq!(active.unwrap().id, older.id);
    }

    #[tokio::test]
    async fn find_active_by_repo_returns_none_when_no_active_jobs() {
        let (_dir, store) = temp_store();
        let repo_url = "https://github.com/o/r";

        let mut terminal_job = ImprovementJob::new(repo_url, "src/a.ts");
        terminal_job.mark_failed("boom");
        JobStore::upsert(&store, &terminal_job).await.unwrap();

        let active = JobStore::find_active_by_repo(&store, repo_url, Uuid::new_v4())
            .await
            .unwrap();
        assert!(active.is_none());
    }

    #[tokio::test]
    async fn repo_round_trips_with_coverage_report() {
        let (_dir, store) = temp_store();
        let mut repo = TrackedRepository::new("https://github.com/o/r");
        repo.set_coverage_report(vec![FileCoverage::new("src/a.ts", 90.0).unwrap()]);
        RepoStore::upsert(&store, &repo).await.unwrap();

        let found = RepoStore::find_by_url(&store, "https://github.com/o/r")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, repo.id);
        let report = found.last_coverage_report.unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].lines_coverage, 90.0);
    }

    #[tokio::test]
    async fn find_by_id_returns_none_for_unknown_id() {
        let (_dir, store) = temp_store();
        assert!(JobStore::find_by_id(&store, Uuid::new_v4()).await.unwrap().is_none());
        assert!(RepoStore::find_by_id(&store, Uuid::new_v4()).await.unwrap().is_none());
    }
}
