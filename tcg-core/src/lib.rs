//! Job-orchestration and sandboxed verification pipeline.
//!
//! Durable job queues, per-repository serialization discipline, the
//! coverage-scan workflow, the test-generation loop with compile/execute/
//! coverage validation and bounded retry, and the isolated subprocess
//! execution model wrapping every step that touches untrusted repository
//! code.

pub mod ai_generator;
pub mod command_surface;
pub mod coverage_scanner;
pub mod dependency_analyzer;
pub mod queue;
pub mod repo_host;
pub mod sandbox;
pub mod store;
pub mod test_validator;
pub mod use_case;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use ai_generator::AIGenerator;
pub use command_surface::CommandSurface;
pub use coverage_scanner::CoverageScanner;
pub use dependency_analyzer::DependencyAnalyzer;
pub use queue::{ImproveQueue, ScanQueue};
pub use repo_host::RepositoryHost;
pub use sandbox::SandboxRunner;
pub use store::{JobStore, RepoStore};
pub use test_validator::TestValidator;
pub use use_case::ImproveCoverageUseCase;
