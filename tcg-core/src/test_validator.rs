//! C6 — `TestValidator`: compile-check a generated test file, execute it in
//! isolation, and enforce the coverage bar the orchestration loop requires
//! before a test is accepted.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::sandbox::{ContainerRunRequest, SandboxRunner, remove_scratch_file, write_scratch_file};
use tcg_common::CoreError;

const COMPILE_TIMEOUT: Duration = Duration::from_secs(60);
const EXECUTE_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_UNCOVERED_IDENTIFIERS: usize = 20;

/// TypeScript diagnostic codes that do not block acceptance of a generated
/// test: type-mismatch/missing-symbol complaints (missing module, missing
/// name, property not on type, type not assignable) that typically stem
/// from incomplete mock typing rather than code that cannot run.
const IGNORABLE_TS_CODES: &[&str] = &["TS2307", "TS2304", "TS2339", "TS2322"];

/// Why a generated test failed validation, carrying enough detail for the
/// repair-prompt step of the generation loop to act on.
#[derive(Debug, Clone)]
pub enum ValidationFailure {
    CompileError(String),
    ExecutionError(String),
    CoverageError(String),
    LowCoverage {
        achieved: f64,
        required: f64,
        uncovered_statements: Vec<String>,
    },
    ValidatorError(String),
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CompileError(msg) => write!(f, "compile error: {msg}"),
            Self::ExecutionError(msg) => write!(f, "execution error: {msg}"),
            Self::CoverageError(msg) => write!(f, "coverage error: {msg}"),
            Self::LowCoverage {
                achieved,
                required,
                uncovered_statements,
            } => write!(
                f,
                "coverage {achieved:.1}% below required {required:.1}%, uncovered: {}",
                uncovered_statements.join(", ")
            ),
            Self::ValidatorError(msg) => write!(f, "validator error: {msg}"),
        }
    }
}

/// C6: accepts or rejects a generated test file against a target source
/// file's coverage bar.
#[async_trait]
pub trait TestValidator: Send + Sync {
    async fn validate(
        &self,
        repo_path: &Path,
        test_file_rel: &str,
        target_source_rel: &str,
        target_coverage: f64,
    ) -> Result<(), ValidationFailure>;
}

/// Jest/tsc-backed [`TestValidator`].
pub struct JestTestValidator {
    sandbox: Arc<dyn SandboxRunner>,
}

impl JestTestValidator {
    pub fn new(sandbox: Arc<dyn SandboxRunner>) -> Self {
        Self { sandbox }
    }

    fn tsconfig_validation_contents(test_file_rel: &str) -> String {
        format!(
            r#"{{
  "compilerOptions": {{
    "noEmit": true,
    "isolatedModules": true,
    "skipLibCheck": true,
    "esModuleInterop": true,
    "target": "ES2020",
    "module": "CommonJS"
  }},
  "files": ["{test_file_rel}"]
}}
"#
        )
    }

    async fn compile_check(&self, repo_path: &Path, test_file_rel: &str) -> Result<(), ValidationFailure> {
        let runner = if repo_path.join("node_modules/.bin/tsc").exists() {
            "node_modules/.bin/tsc"
        } else {
            "/toolchain/bin/tsc"
        };

        let config_path = repo_path.join("tsconfig.validation.json");
        write_scratch_file(&config_path, &Self::tsconfig_validation_contents(test_file_rel))
            .await
            .map_err(|e| ValidationFailure::ValidatorError(e.to_string()))?;

        let outcome = self
            .sandbox
            .run_in_container(ContainerRunRequest {
                command: runner,
                args: &["--project".to_string(), "tsconfig.validation.json".to_string()],
                host_directory: repo_path,
                env: &HashMap::new(),
                timeout: COMPILE_TIMEOUT,
                allow_network: false,
                run_as_root: false,
            })
            .await;

        remove_scratch_file(&config_path).await;

        if outcome.success {
            return Ok(());
        }

        let fatal_lines: Vec<&str> = outcome
            .combined_output
            .lines()
            .filter(|line| line.contains("error TS"))
            .filter(|line| {
                !IGNORABLE_TS_CODES
                    .iter()
                    .any(|code| line.contains(&format!("error {code}")))
            })
            .collect();

        if fatal_lines.is_empty() {
            Ok(())
        } else {
            Err(ValidationFailure::CompileError(fatal_lines.join("\n")))
        }
    }

    fn scoped_config_contents(target_source_rel: &str) -> String {
        format!(
            r#"module.exports = {{
  collectCoverage: true,
  collectCoverageFrom: ['{target_source_rel}'],
  coverageReporters: ['json-summary', 'json'],
  testEnvironment: 'node',
}};
"#
        )
    }

    async fn execute(
        &self,
        repo_path: &Path,
        test_file_rel: &str,
        target_source_rel: &str,
    ) -> Result<(), ValidationFailure> {
        let config_path = repo_path.join("jest.config.verification.js");
        write_scratch_file(&config_path, &Self::scoped_config_contents(target_source_rel))
            .await
            .map_err(|e| ValidationFailure::ValidatorError(e.to_string()))?;

        let runner = if repo_path.join("node_modules/.bin/jest").exists() {
            "node_modules/.bin/jest"
        } else {
            "/toolchain/bin/jest"
        };

        let outcome = self
            .sandbox
            .run_in_container(ContainerRunRequest {
                command: runner,
                args: &[
                    test_file_rel.to_string(),
                    "--config".to_string(),
                    config_path
                        .strip_prefix(repo_path)
                        .unwrap_or(&config_path)
                        .display()
                        .to_string(),
                    "--forceExit".to_string(),
                    "--ci".to_string(),
                    "--silent".to_string(),
                ],
                env: &HashMap::new(),
                host_directory: repo_path,
                timeout: EXECUTE_TIMEOUT,
                allow_network: false,
                run_as_root: false,
            })
            .await;

        remove_scratch_file(&config_path).await;

        if outcome.combined_output.contains(crate::sandbox::TIMEOUT_MARKER) {
            return Err(ValidationFailure::ExecutionError(
                "test execution timed out".to_string(),
            ));
        }

        let summary_path = repo_path.join("coverage").join("coverage-summary.json");
        let has_summary = tokio::fs::metadata(&summary_path).await.is_ok();

        if !has_summary && !outcome.success {
            return Err(ValidationFailure::ExecutionError(
                extract_last_json_payload(&outcome.combined_output)
                    .unwrap_or_else(|| tail(&outcome.combined_output, 4000)),
            ));
        }

        Ok(())
    }

    async fn enforce_coverage(
        &self,
        repo_path: &Path,
        target_source_rel: &str,
        target_coverage: f64,
    ) -> Result<(), ValidationFailure> {
        let summary_path = repo_path.join("coverage").join("coverage-summary.json");
        let summary_text = tokio::fs::read_to_string(&summary_path)
            .await
            .map_err(|_| ValidationFailure::CoverageError("no coverage summary produced".to_string()))?;
        let summary: serde_json::Value = serde_json::from_str(&summary_text)
            .map_err(|e| ValidationFailure::ValidatorError(format!("malformed coverage summary: {e}")))?;

        let Some(object) = summary.as_object() else {
            return Err(ValidationFailure::CoverageError("empty coverage map".to_string()));
        };

        let entry = object
            .iter()
            .filter(|(key, _)| *key != "total")
            .filter(|(key, _)| key.ends_with(target_source_rel))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, value)| value);

        let Some(entry) = entry else {
            return Err(ValidationFailure::CoverageError(format!(
                "no coverage entry for {target_source_rel}"
            )));
        };

        let statements = entry.get("statements");
        let achieved = statements
            .and_then(|s| s.get("pct"))
            .and_then(|p| p.as_f64())
            .or_else(|| {
                let covered = statements.and_then(|s| s.get("covered")).and_then(|v| v.as_f64())?;
                let total = statements.and_then(|s| s.get("total")).and_then(|v| v.as_f64())?;
                if total == 0.0 {
                    Some(100.0)
                } else {
                    Some(covered / total * 100.0)
                }
            })
            .or_else(|| statement_hit_map_pct(entry))
            .unwrap_or(0.0);

        if achieved + f64::EPSILON >= target_coverage {
            return Ok(());
        }

        let uncovered = uncovered_statement_ids(repo_path, target_source_rel)
            .await
            .unwrap_or_default();

        Err(ValidationFailure::LowCoverage {
            achieved,
            required: target_coverage,
            uncovered_statements: uncovered,
        })
    }
}

#[async_trait]
impl TestValidator for JestTestValidator {
    async fn validate(
        &self,
        repo_path: &Path,
        test_file_rel: &str,
        target_source_rel: &str,
        target_coverage: f64,
    ) -> Result<(), ValidationFailure> {
        self.compile_check(repo_path, test_file_rel).await?;
        self.execute(repo_path, test_file_rel, target_source_rel).await?;
        self.enforce_coverage(repo_path, target_source_rel, target_coverage).await
    }
}

/// Scan `output` line-by-line for JSON object payloads, keeping the last
/// one that parses (test runners interleave progress text before the
/// structured result).
fn extract_last_json_payload(output: &str) -> Option<String> {
    let mut last = None;
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('{') && serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
            last = Some(trimmed.to_string());
        }
    }
    last
}

fn tail(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        text.to_string()
    } else {
        text[text.len() - max_chars..].to_string()
    }
}

/// Statement coverage percentage computed directly from a `coverage-final.json`
/// entry's statement-hit map (`hits_nonzero / total`), for summaries that
/// publish neither a `pct` field nor `covered`/`total` counts.
fn statement_hit_map_pct(entry: &serde_json::Value) -> Option<f64> {
    let statement_hits = entry.get("s")?.as_object()?;
    if statement_hits.is_empty() {
        return Some(100.0);
    }
    let total = statement_hits.len() as f64;
    let hits_nonzero = statement_hits.values().filter(|count| count.as_i64() != Some(0)).count() as f64;
    Some(hits_nonzero / total * 100.0)
}

async fn uncovered_statement_ids(repo_path: &Path, target_source_rel: &str) -> Option<Vec<String>> {
    let final_path = repo_path.join("coverage").join("coverage-final.json");
    let text = tokio::fs::read_to_string(final_path).await.ok()?;
    let parsed: serde_json::Value = serde_json::from_str(&text).ok()?;
    let object = parsed.as_object()?;

    let entry = object
        .iter()
        .filter(|(key, _)| key.ends_with(target_source_rel))
        .max_by_key(|(key, _)| key.len())
        .map(|(_, value)| value)?;

    let statement_hits = entry.get("s")?.as_object()?;
    let mut ids: Vec<String> = statement_hits
        .iter()
        .filter(|(_, count)| count.as_i64() == Some(0))
        .map(|(id, _)| id.clone())
        .collect();
    ids.sort();
    ids.truncate(MAX_UNCOVERED_IDENTIFIERS);
    Some(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_last_of_several_json_lines() {
        let output = "running...\n{\"a\":1}\nmore text\n{\"a\":2}\n";
        assert_eq!(extract_last_json_payload(output), Some("{\"a\":2}".to_string()));
    }

    #[test]
    fn returns_none_when_no_json_present() {
        assert_eq!(extract_last_json_payload("plain text only"), None);
    }

    #[test]
    fn tail_truncates_to_last_n_chars() {
        let text = "a".repeat(10);
        assert_eq!(tail(&text, 4), "aaaa");
    }

    #[test]
    fn tail_returns_whole_string_when_shorter_than_cap() {
        assert_eq!(tail("short", 100), "short");
    }

    #[test]
    fn low_coverage_display_includes_uncovered_ids() {
        let failure = ValidationFailure::LowCoverage {
            achieved: 40.0,
            required: 80.0,
            uncovered_statements: vec!["0".to_string(), "3".to_string()],
        };
        let rendered = failure.to_string();
        assert!(rendered.contains("40.0"));
        assert!(rendered.contains("0, 3"));
    }

    #[test]
    fn coverage_error_display_includes_message() {
        let failure = ValidationFailure::CoverageError("no coverage entry for src/foo.ts".to_string());
        assert!(failure.to_string().contains("no coverage entry for src/foo.ts"));
    }

    #[test]
    fn statement_hit_map_pct_computes_hits_over_total() {
        let entry = serde_json::json!({ "s": { "0": 1, "1": 0, "2": 2, "3": 0 } });
        assert_eq!(statement_hit_map_pct(&entry), Some(50.0));
    }

    #[test]
    fn statement_hit_map_pct_is_none_without_a_statement_map() {
        let entry = serde_json::json!({ "lines": { "pct": 90.0 } });
        assert_eq!(statement_hit_map_pct(&entry), None);
    }
}
