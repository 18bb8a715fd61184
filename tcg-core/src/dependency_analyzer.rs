//! C4 — `DependencyAnalyzer`: static extraction of public method signatures
//! of types a target source file depends on, for prompt context.
//!
//! There is no TypeScript compiler available to this crate (the real
//! type-checker only exists inside the sandbox, invoked by
//! [`crate::test_validator`]), so this is a best-effort textual scan in the
//! style of the lightweight Cargo-manifest scanning in
//! `rch_common::cargo_path_deps` and `dependency_closure_planner` — regex
//! over source text rather than a full parse, tolerant of anything it
//! cannot confidently extract.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A single method signature discovered on a dependency type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodSignature {
    pub method_name: String,
    pub params_text: String,
    pub return_type_text: String,
}

/// Public method signatures of one type a target source file depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencySignature {
    pub type_name: String,
    pub methods: Vec<MethodSignature>,
}

/// Framework/infrastructure types excluded from analysis: mocking these has
/// no value for the generator since they are well-known globally.
const DENY_LIST: &[&str] = &[
    "Logger",
    "ConfigService",
    "HttpModule",
    "EventEmitter2",
    "Request",
    "Response",
    "NextFunction",
    "Connection",
    "EntityManager",
];

/// C4: produces dependency signatures for a source file, or an empty
/// collection on failure (logged, never propagated — this is prompt
/// context, not a correctness gate).
#[async_trait]
pub trait DependencyAnalyzer: Send + Sync {
    async fn analyze(&self, source_rel: &str, repo_path: &Path) -> Vec<DependencySignature>;

    /// Render signatures into the human-readable block the generator's
    /// prompt embeds.
    fn format_for_prompt(&self, signatures: &[DependencySignature]) -> String {
        if signatures.is_empty() {
            return String::new();
        }
        let mut block = String::from("Dependency signatures:\n");
        for sig in signatures {
            block.push_str(&format!("\nclass {} {{\n", sig.type_name));
            for method in &sig.methods {
                block.push_str(&format!(
                    "  {}({}): {};\n",
                    method.method_name, method.params_text, method.return_type_text
                ));
            }
            block.push_str("}\n");
        }
        block
    }
}

/// Regex-based [`DependencyAnalyzer`] for TypeScript sources.
pub struct TsDependencyAnalyzer;

impl TsDependencyAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Extract constructor-parameter type names from the first class
    /// declaration's constructor in `source_text`.
    fn constructor_dependency_types(source_text: &str) -> Vec<String> {
        let constructor_re = Regex::new(r"constructor\s*\(([^)]*)\)").expect("valid regex");
        let Some(captures) = constructor_re.captures(source_text) else {
            return Vec::new();
        };
        let params_block = captures.get(1).map(|m| m.as_str()).unwrap_or_default();

        let param_type_re =
            Regex::new(r":\s*([A-Z][A-Za-z0-9_]*)").expect("valid regex");

        let mut seen = HashSet::new();
        let mut types = Vec::new();
        for capture in param_type_re.captures_iter(params_block) {
            let type_name = capture[1].to_string();
            if DENY_LIST.contains(&type_name.as_str()) {
                continue;
            }
            if seen.insert(type_name.clone()) {
                types.push(type_name);
            }
        }
        types
    }

    /// Find the file under `repo_path` that declares `class <type_name>` or
    /// `interface <type_name>`, and extract its public method signatures.
    fn find_and_extract(repo_path: &Path, type_name: &str) -> Option<DependencySignature> {
        let declaration_re =
            Regex::new(&format!(r"(?:class|interface)\s+{type_name}\b")).ok()?;

        let source_text = find_declaring_file(repo_path, &declaration_re)?;
        let methods = extract_public_methods(&source_text);
        if methods.is_empty() {
            return None;
        }
        Some(DependencySignature {
            type_name: type_name.to_string(),
            methods,
        })
    }
}

impl Default for TsDependencyAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DependencyAnalyzer for TsDependencyAnalyzer {
    async fn analyze(&self, source_rel: &str, repo_path: &Path) -> Vec<DependencySignature> {
        let full_path = repo_path.join(source_rel);
        let source_text = match tokio::fs::read_to_string(&full_path).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(path = %full_path.display(), error = %e, "dependency analysis: failed to read source file");
                return Vec::new();
            }
        };

        let repo_path = repo_path.to_path_buf();
        let dependency_types = Self::constructor_dependency_types(&source_text);
        tokio::task::spawn_blocking(move || {
            dependency_types
                .into_iter()
                .filter_map(|type_name| Self::find_and_extract(&repo_path, &type_name))
                .collect()
        })
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "dependency analysis task panicked");
            Vec::new()
        })
    }
}

/// Walk `repo_path` (skipping `node_modules`/`.git`) looking for a `.ts`
/// file whose text matches `declaration_re`.
fn find_declaring_file(repo_path: &Path, declaration_re: &Regex) -> Option<String> {
    let mut stack = vec![repo_path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if matches!(name, "node_modules" | ".git" | "dist" | "build" | "coverage") {
                    continue;
                }
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("ts") {
                if let Ok(text) = std::fs::read_to_string(&path) {
                    if declaration_re.is_match(&text) {
                        return Some(text);
                    }
                }
            }
        }
    }
    None
}

/// Extract public (non-`private`/`protected`) method signatures from a
/// class/interface body, without truncating parameter or return-type text.
fn extract_public_methods(source_text: &str) -> Vec<MethodSignature> {
    let method_re = Regex::new(
        r"(?m)^\s*(?:public\s+)?(?:async\s+)?([a-zA-Z_][A-Za-z0-9_]*)\s*\(([^)]*)\)\s*:\s*([A-Za-z0-9_<>\[\]., |]+?)\s*[{;]",
    )
    .expect("valid regex");

    let reserved = ["constructor", "if", "for", "while", "switch", "catch"];

    let mut methods = Vec::new();
    for line in source_text.lines() {
        if line.trim_start().starts_with("private") || line.trim_start().starts_with("protected") {
            continue;
        }
        if let Some(captures) = method_re.captures(line) {
            let method_name = captures[1].to_string();
            if reserved.contains(&method_name.as_str()) {
                continue;
            }
            methods.push(MethodSignature {
                method_name,
                params_text: captures[2].trim().to_string(),
                return_type_text: captures[3].trim().to_string(),
            });
        }
    }
    methods
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn analyze_returns_empty_when_source_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = TsDependencyAnalyzer::new();
        let signatures = analyzer.analyze("src/does-not-exist.ts", dir.path()).await;
        assert!(signatures.is_empty());
    }

    #[tokio::test]
    async fn analyze_extracts_constructor_dependency_methods() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();

        let mut user_repo = std::fs::File::create(dir.path().join("src/user.repository.ts")).unwrap();
        writeln!(
            user_repo,
            "export class UserRepository {{\n  public findById(id: string): Promise<User> {{ return null; }}\n  private helper(): void {{}}\n}}"
        )
        .unwrap();

        let mut service = std::fs::File::create(dir.path().join("src/user.service.ts")).unwrap();
        writeln!(
            service,
            "export class UserService {{\n  constructor(private readonly userRepository: UserRepository) {{}}\n}}"
        )
        .unwrap();

        let analyzer = TsDependencyAnalyzer::new();
        let signatures = analyzer.analyze("src/user.service.ts", dir.path()).await;

        assert_eq!(signatures.len(), 1);
        assert_eq!(signatures[0].type_name, "UserRepository");
        assert_eq!(signatures[0].methods.len(), 1);
        assert_eq!(signatures[0].methods[0].method_name, "findById");
        assert_eq!(signatures[0].methods[0].return_type_text, "Promise<User>");
    }

    #[test]
    fn deny_listed_types_are_skipped() {
        let source = "constructor(private logger: Logger, private repo: OrderRepository) {}";
        let types = TsDependencyAnalyzer::constructor_dependency_types(source);
        assert_eq!(types, vec!["OrderRepository".to_string()]);
    }

    #[test]
    fn format_for_prompt_renders_empty_string_for_no_signatures() {
        let analyzer = TsDependencyAnalyzer::new();
        assert_eq!(analyzer.format_for_prompt(&[]), "");
    }

    #[test]
    fn format_for_prompt_includes_type_and_method_names() {
        let analyzer = TsDependencyAnalyzer::new();
        let signatures = vec![DependencySignature {
            type_name: "OrderRepository".to_string(),
            methods: vec![MethodSignature {
                method_name: "findById".to_string(),
                params_text: "id: string".to_string(),
                return_type_text: "Promise<Order>".to_string(),
            }],
        }];
        let block = analyzer.format_for_prompt(&signatures);
        assert!(block.contains("class OrderRepository"));
        assert!(block.contains("findById(id: string): Promise<Order>;"));
    }
}
