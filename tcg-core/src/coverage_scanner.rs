//! C5 — `CoverageScanner`: install dependencies, run the test framework
//! with coverage collection, produce a per-file line-coverage report.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tcg_common::{FileCoverage, is_excluded_path};

use crate::sandbox::{ContainerRunRequest, SandboxRunner, remove_scratch_file, write_scratch_file};
use tcg_common::CoreError;

const INSTALL_TIMEOUT: Duration = Duration::from_secs(120);
const TEST_TIMEOUT: Duration = Duration::from_secs(90);
const OUTPUT_BUFFER_CAP: usize = 10 * 1024 * 1024;

const RECOGNIZED_CONFIG_FILENAMES: &[&str] = &[
    "jest.config.js",
    "jest.config.ts",
    "jest.config.cjs",
    "jest.config.mjs",
    "jest.config.json",
];

/// C5: produces an ordered collection of per-file coverage, or fails only
/// on unrecoverable problems (setup cannot complete, tooling absent,
/// timeout).
#[async_trait]
pub trait CoverageScanner: Send + Sync {
    async fn scan(&self, local_path: &Path) -> Result<Vec<FileCoverage>, CoreError>;
}

/// Jest-backed [`CoverageScanner`] for Node/TypeScript repositories.
pub struct NodeCoverageScanner {
    sandbox: Arc<dyn SandboxRunner>,
}

impl NodeCoverageScanner {
    pub fn new(sandbox: Arc<dyn SandboxRunner>) -> Self {
        Self { sandbox }
    }

    fn install_command(local_path: &Path) -> (&'static str, Vec<String>) {
        if local_path.join("package-lock.json").exists() {
            ("npm", vec!["ci".to_string(), "--ignore-scripts".to_string()])
        } else if local_path.join("yarn.lock").exists() {
            (
                "yarn",
                vec![
                    "install".to_string(),
                    "--frozen-lockfile".to_string(),
                    "--ignore-scripts".to_string(),
                ],
            )
        } else if local_path.join("pnpm-lock.yaml").exists() {
            (
                "pnpm",
                vec![
                    "install".to_string(),
                    "--frozen-lockfile".to_string(),
                    "--ignore-scripts".to_string(),
                ],
            )
        } else {
            (
                "npm",
                vec!["install".to_string(), "--ignore-scripts".to_string()],
            )
        }
    }

    async fn ensure_dependencies_installed(&self, local_path: &Path) -> Result<(), CoreError> {
        if local_path.join("node_modules").exists() {
            return Ok(());
        }
        let (program, args) = Self::install_command(local_path);
        let outcome = self
            .sandbox
            .run_in_container(ContainerRunRequest {
                command: program,
                args: &args,
                host_directory: local_path,
                env: &HashMap::new(),
                timeout: INSTALL_TIMEOUT,
                allow_network: true,
                run_as_root: false,
            })
            .await;

        if outcome.combined_output.len() > OUTPUT_BUFFER_CAP {
            return Err(CoreError::Scan("install output exceeded buffer cap".to_string()));
        }
        if !outcome.success {
            return Err(CoreError::Scan(format!(
                "dependency install failed: {}",
                outcome.combined_output
            )));
        }
        Ok(())
    }

    fn has_existing_jest_config(local_path: &Path) -> bool {
        if RECOGNIZED_CONFIG_FILENAMES
            .iter()
            .any(|name| local_path.join(name).exists())
        {
            return true;
        }
        let package_json = local_path.join("package.json");
        let Ok(text) = std::fs::read_to_string(package_json) else {
            return false;
        };
        serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v.get("jest").cloned())
            .is_some()
    }

    fn minimal_config_contents() -> String {
        format!(
            r#"module.exports = {{
  collectCoverage: true,
  collectCoverageFrom: ['**/*.{{ts,tsx}}'],
  coveragePathIgnorePatterns: [{}],
  coverageReporters: ['json-summary'],
  testEnvironment: 'node',
}};
"#,
            tcg_common::CANONICAL_EXCLUDED_DIRS
                .iter()
                .chain(
                    tcg_common::CANONICAL_EXCLUDED_FILE_PATTERNS
                        .iter()
                        .filter(|p| p.starts_with('.'))
                )
                .map(|p| format!("'{p}'"))
                .collect::<Vec<_>>()
                .join(", ")
        )
    }

    async fn run_tests_with_coverage(
        &self,
        local_path: &Path,
        config_path: Option<&Path>,
    ) -> Result<Option<serde_json::Value>, CoreError> {
        let runner = if local_path.join("node_modules/.bin/jest").exists() {
            "node_modules/.bin/jest"
        } else {
            "/toolchain/bin/jest"
        };

        let mut args = vec![
            "--coverage".to_string(),
            "--coverageReporters=json-summary".to_string(),
            "--passWithNoTests".to_string(),
            "--forceExit".to_string(),
            "--ci".to_string(),
            "--silent".to_string(),
        ];
        if let Some(config_path) = config_path {
            args.push("--config".to_string());
            args.push(
                config_path
                    .strip_prefix(local_path)
                    .unwrap_or(config_path)
                    .display()
                    .to_string(),
            );
        }

        let outcome = self
            .sandbox
            .run_in_container(ContainerRunRequest {
                command: runner,
                args: &args,
                host_directory: local_path,
                env: &HashMap::new(),
                timeout: TEST_TIMEOUT,
                allow_network: false,
                run_as_root: false,
            })
            .await;

        if outcome.combined_output.len() > OUTPUT_BUFFER_CAP {
            return Err(CoreError::Scan("test output exceeded buffer cap".to_string()));
        }
        if outcome.combined_output.contains(crate::sandbox::TIMEOUT_MARKER) {
            return Err(CoreError::Timeout(TEST_TIMEOUT));
        }

        // A non-zero exit from test-assertion failures is a soft condition;
        // the summary file (if produced) is still consumed. Only a missing
        // summary combined with failure is treated by the caller as empty.
        let summary_path = local_path.join("coverage").join("coverage-summary.json");
        match tokio::fs::read_to_string(&summary_path).await {
            Ok(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| CoreError::Scan(format!("malformed coverage summary: {e}"))),
            Err(_) => Ok(None),
        }
    }

    fn parse_summary(local_path: &Path, summary: &serde_json::Value) -> Vec<FileCoverage> {
        let Some(object) = summary.as_object() else {
            return Vec::new();
        };

        let canonical_repo = std::fs::canonicalize(local_path).unwrap_or_else(|_| local_path.to_path_buf());

        let mut entries = Vec::new();
        for (file_path, stats) in object {
            if file_path == "total" {
                continue;
            }
            let Ok(canonical_file) = std::fs::canonicalize(file_path) else {
                continue;
            };
            let Ok(rel_path) = canonical_file.strip_prefix(&canonical_repo) else {
                continue; // escapes the repo
            };
            let rel_str = rel_path.to_string_lossy().replace('\\', "/");
            if is_excluded_path(&rel_str) {
                continue;
            }
            let pct = stats
                .get("lines")
                .and_then(|lines| lines.get("pct"))
                .and_then(|pct| pct.as_f64())
                .unwrap_or(0.0)
                .clamp(0.0, 100.0);
            if let Ok(fc) = FileCoverage::new(rel_str, pct) {
                entries.push(fc);
            }
        }
        entries
    }

    fn fallback_walk(local_path: &Path) -> Vec<FileCoverage> {
        let mut entries = Vec::new();
        let mut stack = vec![local_path.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(read_dir) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in read_dir.flatten() {
                let path = entry.path();
                let Ok(rel) = path.strip_prefix(local_path) else {
                    continue;
                };
                let rel_str = rel.to_string_lossy().replace('\\', "/");
                if path.is_dir() {
                    if !is_excluded_path(&format!("{rel_str}/__dir__")) {
                        stack.push(path);
                    }
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some("ts")
                    && path.extension().and_then(|e| e.to_str()) != Some("tsx")
                {
                    continue;
                }
                if is_excluded_path(&rel_str) {
                    continue;
                }
                if let Ok(fc) = FileCoverage::new(rel_str, 0.0) {
                    entries.push(fc);
                }
            }
        }
        entries
    }
}

#[async_trait]
impl CoverageScanner for NodeCoverageScanner {
    async fn scan(&self, local_path: &Path) -> Result<Vec<FileCoverage>, CoreError> {
        self.ensure_dependencies_installed(local_path).await?;

        let wrote_temp_config = !Self::has_existing_jest_config(local_path);
        let temp_config_path: Option<PathBuf> = if wrote_temp_config {
            let path = local_path.join("jest.config.ci-scan.cjs");
            write_scratch_file(&path, &Self::minimal_config_contents()).await?;
            Some(path)
        } else {
            None
        };

        let run_result = self
            .run_tests_with_coverage(local_path, temp_config_path.as_deref())
            .await;

        if let Some(path) = &temp_config_path {
            remove_scratch_file(path).await;
        }

        let summary = run_result?;

        let entries = match summary {
            Some(summary) => {
                let parsed = Self::parse_summary(local_path, &summary);
                if parsed.is_empty() {
                    Self::fallback_walk(local_path)
                } else {
                    parsed
                }
            }
            None => Self::fallback_walk(local_path),
        };

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_command_prefers_npm_ci_with_package_lock() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package-lock.json"), "{}").unwrap();
        let (program, args) = NodeCoverageScanner::install_command(dir.path());
        assert_eq!(program, "npm");
        assert!(args.contains(&"ci".to_string()));
    }

    #[test]
    fn install_command_falls_back_to_permissive_install() {
        let dir = tempfile::tempdir().unwrap();
        let (program, args) = NodeCoverageScanner::install_command(dir.path());
        assert_eq!(program, "npm");
        assert!(args.contains(&"install".to_string()));
    }

    #[test]
    fn install_command_always_skips_scripts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("yarn.lock"), "").unwrap();
        let (_, args) = NodeCoverageScanner::install_command(dir.path());
        assert!(args.iter().any(|a| a.contains("ignore-scripts")));
    }

    #[test]
    fn fallback_walk_reports_zero_percent_and_respects_exclusions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/svc.ts"), "export const x = 1;").unwrap();
        std::fs::write(dir.path().join("src/svc.test.ts"), "it('x', () => {});").unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        std::fs::write(dir.path().join("node_modules/pkg/index.ts"), "export {};").unwrap();

        let entries = NodeCoverageScanner::fallback_walk(dir.path());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].file_path, "src/svc.ts");
        assert_eq!(entries[0].lines_coverage, 0.0);
    }

    #[test]
    fn parse_summary_discards_escaping_and_excluded_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/svc.ts"), "export const x = 1;").unwrap();
        std::fs::write(dir.path().join("src/svc.d.ts"), "declare const x: number;").unwrap();

        let canonical_svc = std::fs::canonicalize(dir.path().join("src/svc.ts")).unwrap();
        let canonical_dts = std::fs::canonicalize(dir.path().join("src/svc.d.ts")).unwrap();

        let summary = serde_json::json!({
            "total": {"lines": {"pct": 90.0}},
            canonical_svc.to_string_lossy().to_string(): {"lines": {"pct": 75.5}},
            canonical_dts.to_string_lossy().to_string(): {"lines": {"pct": 100.0}},
            "/escaped/outside/repo.ts": {"lines": {"pct": 50.0}},
        });

        let entries = NodeCoverageScanner::parse_summary(dir.path(), &summary);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].file_path, "src/svc.ts");
        assert_eq!(entries[0].lines_coverage, 75.5);
    }
}
