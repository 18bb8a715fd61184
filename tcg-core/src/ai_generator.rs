//! C7 — `AIGenerator`: bounded generate → validate → repair loop that
//! produces an accepted test file for a target source file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::dependency_analyzer::DependencyAnalyzer;
use crate::sandbox::{ContainerRunRequest, SandboxRunner, remove_scratch_file, write_scratch_file};
use crate::test_validator::{TestValidator, ValidationFailure};
use tcg_common::CoreError;

const MAX_ATTEMPTS: u32 = 3;
const GENERATE_TIMEOUT: Duration = Duration::from_secs(180);

/// Extensions eligible for test generation.
const ELIGIBLE_EXTENSIONS: &[&str] = &["ts", "tsx"];

/// Generator-specific early-exclusion skip-list. Distinct from
/// `tcg_common::is_excluded_path` (the coverage-scanner's exclusion set):
/// a file can be scanned for coverage but still unsuitable as a generation
/// target (a DTO, an entity, a migration, an app bootstrap file).
const EXCLUDED_FILE_NAMES: &[&str] = &["app.ts", "main.ts", "index.ts", "jest.config.ts"];
const EXCLUDED_DIRS: &[&str] = &[
    "interfaces",
    "dto",
    "entities",
    "migrations",
    "node_modules",
    "dist",
    "coverage",
    "types",
];
const EXCLUDED_SUFFIXES: &[&str] = &[
    ".interface.ts",
    ".d.ts",
    ".module.ts",
    ".entity.ts",
    ".dto.ts",
    ".spec.ts",
    ".test.ts",
];

/// Whether `source_rel` is excluded from test generation specifically,
/// independent of whether it would be scanned for coverage.
fn is_excluded_from_generation(source_rel: &str) -> bool {
    let path = Path::new(source_rel);

    if let Some(file_name) = path.file_name().and_then(|n| n.to_str()) {
        if EXCLUDED_FILE_NAMES.contains(&file_name) {
            return true;
        }
    }

    if path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .is_some_and(|name| EXCLUDED_DIRS.contains(&name))
    }) {
        return true;
    }

    EXCLUDED_SUFFIXES.iter().any(|suffix| source_rel.ends_with(suffix))
}

/// C7: produces a relative path to an accepted test file, or fails with the
/// last validation error after exhausting retries.
#[async_trait]
pub trait AIGenerator: Send + Sync {
    async fn generate_test(
        &self,
        repo_path: &Path,
        target_source_rel: &str,
        target_coverage: f64,
    ) -> Result<String, CoreError>;
}

/// Whether `source_rel` is eligible for generation at all: generator-specific
/// excluded directories/file patterns are never targeted, nor are non-TS
/// sources.
pub fn is_eligible_for_generation(source_rel: &str) -> bool {
    if is_excluded_from_generation(source_rel) {
        return false;
    }
    Path::new(source_rel)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| ELIGIBLE_EXTENSIONS.contains(&ext))
}

/// Derive the final test file path from a target source path, alongside
/// the source: `src/foo.ts` -> `src/foo.test.ts`.
pub fn derive_test_path(source_rel: &str) -> String {
    let path = Path::new(source_rel);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("target");
    let file_name = format!("{stem}.test.ts");
    match path.parent() {
        Some(parent) if parent.as_os_str().len() > 0 => {
            parent.join(file_name).to_string_lossy().replace('\\', "/")
        }
        _ => file_name,
    }
}

/// Derive the staging path a candidate test is written to and validated at
/// before being atomically renamed over `test_rel`: the final `.test.ts` or
/// `.spec.ts` suffix becomes `.verification.test.ts`.
pub fn derive_verification_path(test_rel: &str) -> String {
    for suffix in [".test.ts", ".spec.ts"] {
        if let Some(prefix) = test_rel.strip_suffix(suffix) {
            return format!("{prefix}.verification.test.ts");
        }
    }
    format!("{test_rel}.verification.test.ts")
}

fn system_instruction() -> String {
    "You write a single Jest + TypeScript test file that exercises the given \
     source file's exported behavior as thoroughly as possible, using the \
     dependency signatures provided to construct realistic mocks. Respond \
     with only the test file's source code."
        .to_string()
}

fn user_prompt(
    source_rel: &str,
    source_text: &str,
    dependency_context: &str,
    target_coverage: f64,
    prior_error: Option<&str>,
) -> String {
    let mut prompt = format!(
        "Target file: {source_rel}\nTarget line coverage: {target_coverage:.1}%\n\n\
         Source:\n```typescript\n{source_text}\n```\n"
    );
    if !dependency_context.is_empty() {
        prompt.push('\n');
        prompt.push_str(dependency_context);
    }
    if let Some(error) = prior_error {
        prompt.push_str(&format!(
            "\nThe previous attempt failed validation with the following error. \
             Revise the test file to fix it while keeping the existing coverage intact:\n{error}\n"
        ));
    }
    prompt
}

/// Strip a single fenced code block (```typescript ... ``` or ``` ... ```)
/// if the generator wrapped its output in one; otherwise return as-is.
fn sanitize_generated_code(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(after_open) = trimmed.strip_prefix("```") {
        let after_lang = after_open
            .strip_prefix("typescript")
            .or_else(|| after_open.strip_prefix("ts"))
            .unwrap_or(after_open);
        let after_lang = after_lang.strip_prefix('\n').unwrap_or(after_lang);
        if let Some(body) = after_lang.strip_suffix("```") {
            return body.trim().to_string();
        }
        return after_lang.trim_end_matches('`').trim().to_string();
    }
    trimmed.to_string()
}

/// Tolerant extraction of generated code across the handful of response
/// shapes the generator CLI is known to emit.
fn extract_generated_code(raw_output: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(raw_output.trim()) {
        if let Some(text) = value.get("testCode").and_then(|v| v.as_str()) {
            return Some(sanitize_generated_code(text));
        }
        if let Some(text) = value
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
        {
            return Some(sanitize_generated_code(text));
        }
        if let Some(text) = value.get("content").and_then(|v| v.as_str()) {
            return Some(sanitize_generated_code(text));
        }
        if let Some(text) = value.get("text").and_then(|v| v.as_str()) {
            return Some(sanitize_generated_code(text));
        }
        return None;
    }
    if raw_output.trim().is_empty() {
        None
    } else {
        Some(sanitize_generated_code(raw_output))
    }
}

/// Generator CLI-backed [`AIGenerator`], invoked inside the sandbox with
/// network access so it can reach the model API.
pub struct SandboxAIGenerator {
    sandbox: Arc<dyn SandboxRunner>,
    validator: Arc<dyn TestValidator>,
    analyzer: Arc<dyn DependencyAnalyzer>,
    api_key: Option<String>,
}

impl SandboxAIGenerator {
    pub fn new(
        sandbox: Arc<dyn SandboxRunner>,
        validator: Arc<dyn TestValidator>,
        analyzer: Arc<dyn DependencyAnalyzer>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            sandbox,
            validator,
            analyzer,
            api_key,
        }
    }

    async fn invoke_generator(
        &self,
        repo_path: &Path,
        system_path: &Path,
        prompt_path: &Path,
    ) -> Result<String, CoreError> {
        let mut env = HashMap::new();
        if let Some(key) = &self.api_key {
            env.insert("GEMINI_API_KEY".to_string(), key.clone());
        }

        let runner = if repo_path.join("node_modules/.bin/generator-cli").exists() {
            "node_modules/.bin/generator-cli"
        } else {
            "/toolchain/bin/generator-cli"
        };

        let outcome = self
            .sandbox
            .run_in_container(ContainerRunRequest {
                command: runner,
                args: &[
                    "--system".to_string(),
                    system_path
                        .strip_prefix(repo_path)
                        .unwrap_or(system_path)
                        .display()
                        .to_string(),
                    "--prompt".to_string(),
                    prompt_path
                        .strip_prefix(repo_path)
                        .unwrap_or(prompt_path)
                        .display()
                        .to_string(),
                ],
                host_directory: repo_path,
                env: &env,
                timeout: GENERATE_TIMEOUT,
                allow_network: true,
                run_as_root: false,
            })
            .await;

        if outcome.combined_output.contains(crate::sandbox::TIMEOUT_MARKER) {
            return Err(CoreError::Timeout(GENERATE_TIMEOUT));
        }
        if !outcome.success {
            return Err(CoreError::Generation(format!(
                "generator CLI exited non-zero: {}",
                outcome.combined_output
            )));
        }

        extract_generated_code(&outcome.combined_output)
            .ok_or_else(|| CoreError::Generation("generator produced no usable code".to_string()))
    }
}

#[async_trait]
impl AIGenerator for SandboxAIGenerator {
    async fn generate_test(
        &self,
        repo_path: &Path,
        target_source_rel: &str,
        target_coverage: f64,
    ) -> Result<String, CoreError> {
        if !is_eligible_for_generation(target_source_rel) {
            return Err(CoreError::SourceMissing(target_source_rel.to_string()));
        }

        let full_source_path = repo_path.join(target_source_rel);
        let source_text = tokio::fs::read_to_string(&full_source_path)
            .await
            .map_err(|_| CoreError::SourceMissing(target_source_rel.to_string()))?;

        let signatures = self.analyzer.analyze(target_source_rel, repo_path).await;
        let dependency_context = self.analyzer.format_for_prompt(&signatures);

        let test_rel = derive_test_path(target_source_rel);
        let final_test_path = repo_path.join(&test_rel);
        let verification_rel = derive_verification_path(&test_rel);
        let working_path = repo_path.join(&verification_rel);

        let system_path = repo_path.join(".gemini").join("system.md");
        write_scratch_file(&system_path, &system_instruction()).await?;
        let prompt_path = repo_path.join(".gemini-prompt.txt");

        let mut last_error: Option<String> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let prompt = user_prompt(
                target_source_rel,
                &source_text,
                &dependency_context,
                target_coverage,
                last_error.as_deref(),
            );
            // Overwritten each attempt, never deleted mid-loop: a failed
            // attempt's candidate is simply replaced by the next one.
            write_scratch_file(&prompt_path, &prompt).await?;

            let generation_result = self.invoke_generator(repo_path, &system_path, &prompt_path).await;

            let generated_code = match generation_result {
                Ok(code) => code,
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "generation attempt failed");
                    last_error = Some(e.to_string());
                    continue;
                }
            };

            if let Err(e) = write_scratch_file(&working_path, &generated_code).await {
                last_error = Some(e.to_string());
                continue;
            }

            match self
                .validator
                .validate(repo_path, &verification_rel, target_source_rel, target_coverage)
                .await
            {
                Ok(()) => {
                    remove_scratch_file(&system_path).await;
                    remove_scratch_file(&prompt_path).await;
                    if let Err(e) = tokio::fs::rename(&working_path, &final_test_path).await {
                        return Err(CoreError::Generation(format!(
                            "failed to finalize accepted test file: {e}"
                        )));
                    }
                    return Ok(test_rel);
                }
                Err(failure) => {
                    tracing::info!(attempt, %failure, "generated test rejected");
                    last_error = Some(render_failure(&failure));
                }
            }
        }

        remove_scratch_file(&system_path).await;
        remove_scratch_file(&prompt_path).await;
        remove_scratch_file(&working_path).await;
        Err(CoreError::Generation(format!(
            "generation failed after {MAX_ATTEMPTS} attempts: {}",
            last_error.unwrap_or_else(|| "no validation attempts recorded".to_string())
        )))
    }
}

fn render_failure(failure: &ValidationFailure) -> String {
    failure.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_test_path_places_test_file_alongside_source() {
        assert_eq!(derive_test_path("src/foo.ts"), "src/foo.test.ts");
    }

    #[test]
    fn derive_test_path_handles_root_level_files() {
        assert_eq!(derive_test_path("index.ts"), "index.test.ts");
    }

    #[test]
    fn derive_verification_path_substitutes_test_suffix() {
        assert_eq!(
            derive_verification_path("src/foo.test.ts"),
            "src/foo.verification.test.ts"
        );
    }

    #[test]
    fn derive_verification_path_substitutes_spec_suffix() {
        assert_eq!(
            derive_verification_path("src/foo.spec.ts"),
            "src/foo.verification.test.ts"
        );
    }

    #[test]
    fn eligibility_rejects_excluded_paths() {
        assert!(!is_eligible_for_generation("src/foo.d.ts"));
        assert!(!is_eligible_for_generation("node_modules/pkg/index.ts"));
    }

    #[test]
    fn eligibility_rejects_non_typescript_extensions() {
        assert!(!is_eligible_for_generation("README.md"));
    }

    #[test]
    fn eligibility_accepts_ordinary_source() {
        assert!(is_eligible_for_generation("src/user.service.ts"));
    }

    #[test]
    fn sanitize_strips_fenced_typescript_block() {
        let raw = "```typescript\nconst x = 1;\n```";
        assert_eq!(sanitize_generated_code(raw), "const x = 1;");
    }

    #[test]
    fn sanitize_passes_through_unfenced_code() {
        assert_eq!(sanitize_generated_code("const x = 1;"), "const x = 1;");
    }

    #[test]
    fn extract_handles_test_code_shape() {
        let raw = r#"{"testCode": "const x = 1;"}"#;
        assert_eq!(extract_generated_code(raw), Some("const x = 1;".to_string()));
    }

    #[test]
    fn extract_handles_chat_completion_shape() {
        let raw = r#"{"choices": [{"message": {"content": "const x = 1;"}}]}"#;
        assert_eq!(extract_generated_code(raw), Some("const x = 1;".to_string()));
    }

    #[test]
    fn extract_handles_bare_text_fallback() {
        assert_eq!(
            extract_generated_code("const x = 1;"),
            Some("const x = 1;".to_string())
        );
    }

    #[test]
    fn extract_rejects_empty_output() {
        assert_eq!(extract_generated_code(""), None);
    }
}
