//! Domain entities: `TrackedRepository`, `ImprovementJob`, `FileCoverage`.
//!
//! Mirrors the shape of `rch_common::types` (plain serde structs, invariants
//! enforced by constructors and transition methods rather than by the type
//! system alone, since the API and worker processes round-trip these
//! entities through JSON and SQLite).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Per-file line coverage measured by a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCoverage {
    /// Repo-relative, forward-slash separated path.
    pub file_path: String,
    /// Percentage in `[0, 100]`.
    pub lines_coverage: f64,
}

impl FileCoverage {
    /// Construct a `FileCoverage`, rejecting out-of-range percentages.
    pub fn new(file_path: impl Into<String>, lines_coverage: f64) -> Result<Self, CoreError> {
        if !(0.0..=100.0).contains(&lines_coverage) {
            return Err(CoreError::Scan(format!(
                "coverage percentage {lines_coverage} out of range [0, 100]"
            )));
        }
        Ok(Self {
            file_path: file_path.into().replace('\\', "/"),
            lines_coverage,
        })
    }
}

/// Status of an [`ImprovementJob`]. Transitions are monotonic; see
/// [`ImprovementJob::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Cloning,
    Analyzing,
    Generating,
    Pushing,
    PrCreated,
    Failed,
}

impl JobStatus {
    /// The active set holds a clone directory for its duration.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobStatus::Cloning | JobStatus::Analyzing | JobStatus::Generating | JobStatus::Pushing
        )
    }

    /// Terminal states are `PR_CREATED` and `FAILED`.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::PrCreated | JobStatus::Failed)
    }

    /// The ordinal position in the happy-path state machine, used to assert
    /// that transitions never resurrect a job from a terminal state.
    fn ordinal(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Cloning => 1,
            JobStatus::Analyzing => 2,
            JobStatus::Generating => 3,
            JobStatus::Pushing => 4,
            JobStatus::PrCreated => 5,
            JobStatus::Failed => 5,
        }
    }
}

fn default_target_coverage() -> f64 {
    80.0
}

/// One unit of work: generate a test for one source file in one repo,
/// validate it, push, open a pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImprovementJob {
    pub id: Uuid,
    pub repository_url: String,
    pub file_path: String,
    #[serde(default = "default_target_coverage")]
    pub target_coverage: f64,
    pub status: JobStatus,
    pub pr_link: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImprovementJob {
    /// Create a new job in `QUEUED` status.
    pub fn new(repository_url: impl Into<String>, file_path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            repository_url: repository_url.into(),
            file_path: file_path.into(),
            target_coverage: default_target_coverage(),
            status: JobStatus::Queued,
            pr_link: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_target_coverage(mut self, target_coverage: f64) -> Self {
        self.target_coverage = target_coverage;
        self
    }

    /// Advance to a non-terminal status. Panics in debug builds if called on
    /// a terminal job or with a status that would move the ordinal backwards
    /// — both indicate a caller bug, not a recoverable runtime condition.
    pub fn transition(&mut self, next: JobStatus) {
        debug_assert!(
            !self.status.is_terminal(),
            "attempted to transition job {} out of terminal state {:?}",
            self.id,
            self.status
        );
        debug_assert!(
            next.ordinal() >= self.status.ordinal(),
            "attempted to move job {} backwards from {:?} to {:?}",
            self.id,
            self.status,
            next
        );
        self.status = next;
        self.touch();
    }

    /// Move to the terminal `PR_CREATED` status; `pr_link` must already be
    /// populated when the caller observes this status externally.
    pub fn mark_pr_created(&mut self, pr_link: impl Into<String>) {
        self.pr_link = Some(pr_link.into());
        self.status = JobStatus::PrCreated;
        self.touch();
    }

    /// Move to the terminal `FAILED` status with the given message.
    pub fn mark_failed(&mut self, error_message: impl Into<String>) {
        self.error_message = Some(error_message.into());
        self.status = JobStatus::Failed;
        self.touch();
    }

    fn touch(&mut self) {
        let mut now = Utc::now();
        // updated_at must strictly increase even when the system clock has
        // insufficient resolution between two transitions in the same
        // instant (notably in tests that transition a job several times in
        // a tight loop).
        if now <= self.updated_at {
            now = self.updated_at + chrono::Duration::microseconds(1);
        }
        self.updated_at = now;
    }
}

/// A remote repository the system tracks coverage for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedRepository {
    pub id: Uuid,
    pub url: String,
    pub last_coverage_report: Option<Vec<FileCoverage>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackedRepository {
    pub fn new(url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            last_coverage_report: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Atomically replace the coverage report. Never partially written:
    /// callers always pass a complete snapshot.
    pub fn set_coverage_report(&mut self, report: Vec<FileCoverage>) {
        self.last_coverage_report = Some(report);
        let mut now = Utc::now();
        if now <= self.updated_at {
            now = self.updated_at + chrono::Duration::microseconds(1);
        }
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_coverage_rejects_out_of_range() {
        assert!(FileCoverage::new("a.ts", 101.0).is_err());
        assert!(FileCoverage::new("a.ts", -1.0).is_err());
        assert!(FileCoverage::new("a.ts", 0.0).is_ok());
        assert!(FileCoverage::new("a.ts", 100.0).is_ok());
    }

    #[test]
    fn file_coverage_normalizes_separators() {
        let fc = FileCoverage::new("src\\svc.ts", 50.0).unwrap();
        assert_eq!(fc.file_path, "src/svc.ts");
    }

    #[test]
    fn job_transition_updates_timestamp_monotonically() {
        let mut job = ImprovementJob::new("https://github.com/o/r", "src/svc.ts");
        let created = job.updated_at;
        job.transition(JobStatus::Cloning);
        assert!(job.updated_at > created);
        job.transition(JobStatus::Analyzing);
        job.transition(JobStatus::Generating);
        job.transition(JobStatus::Pushing);
        job.mark_pr_created("https://github.com/o/r/pull/1");
        assert_eq!(job.status, JobStatus::PrCreated);
        assert!(job.status.is_terminal());
        assert_eq!(job.pr_link.as_deref(), Some("https://github.com/o/r/pull/1"));
    }

    #[test]
    fn failed_job_carries_error_message() {
        let mut job = ImprovementJob::new("https://github.com/o/r", "src/svc.ts");
        job.mark_failed("Insufficient permissions");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("Insufficient permissions"));
    }

    #[test]
    fn default_target_coverage_is_eighty() {
        let job = ImprovementJob::new("https://github.com/o/r", "src/svc.ts");
        assert_eq!(job.target_coverage, 80.0);
    }
}
