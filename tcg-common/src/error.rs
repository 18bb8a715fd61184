//! Error taxonomy for the test coverage orchestrator.
//!
//! A single tagged enum crosses every component boundary, in the same spirit
//! as `rch_common::errors::catalog::ErrorCode` — each variant is a
//! surface-visible category, not an internal implementation detail. `anyhow`
//! is reserved for the binaries' `main()`.

use thiserror::Error;

/// Surface-visible error categories returned across component boundaries.
#[derive(Debug, Error)]
pub enum CoreError {
    // -- Input / validation (surfaced as 400, never alter entity state) --
    #[error("invalid repository URL: {0}")]
    InvalidRepoUrl(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("repository is missing required dependencies: {0:?}")]
    MissingDependencies(Vec<String>),
    #[error("repository not found")]
    RepoNotFound,
    #[error("job not found")]
    JobNotFound,

    // -- Job-local failures (move the job to FAILED) --
    #[error("Insufficient permissions")]
    InsufficientPermissions,
    #[error("source file missing from clone: {0}")]
    SourceMissing(String),
    #[error("test generation failed: {0}")]
    Generation(String),
    #[error("push failed: {0}")]
    Push(String),
    #[error("pull request creation failed: {0}")]
    PrCreation(String),

    // -- Scan consumer (propagates to queue retry) --
    #[error("coverage scan failed: {0}")]
    Scan(String),

    // -- Infrastructure (generally wrapped into the kinds above) --
    #[error("repository host error: {0}")]
    Host(String),
    #[error("sandbox error: {0}")]
    Sandbox(String),
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("validator error: {0}")]
    Validator(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("queue error: {0}")]
    Queue(String),
}

impl CoreError {
    /// True for the input/validation kinds that never mutate entity state
    /// and are surfaced directly as HTTP 400 by `CommandSurface`.
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidRepoUrl(_)
                | CoreError::MissingField(_)
                | CoreError::MissingDependencies(_)
                | CoreError::RepoNotFound
                | CoreError::JobNotFound
        )
    }

    /// The message to persist onto `ImprovementJob.error_message`. No
    /// secrets leak: this is always built from the already-sanitized
    /// `Display` text of the error, never from raw provider payloads.
    pub fn job_message(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_classified() {
        assert!(CoreError::RepoNotFound.is_validation_error());
        assert!(CoreError::JobNotFound.is_validation_error());
        assert!(!CoreError::InsufficientPermissions.is_validation_error());
        assert!(!CoreError::Scan("boom".into()).is_validation_error());
    }

    #[test]
    fn job_message_contains_insufficient_permissions_literal() {
        let err = CoreError::InsufficientPermissions;
        assert!(err.job_message().contains("Insufficient permissions"));
    }
}
