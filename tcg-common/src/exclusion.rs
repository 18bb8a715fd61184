//! The canonical coverage exclusion set.
//!
//! This is the single source of truth shared by the coverage-config writer,
//! the fallback file walker, and the post-filter of parsed coverage entries.
//! Divergence between those three consumers would cause files to be
//! reported at 0% that were deliberately excluded by the runner, so every
//! consumer must call [`is_excluded_path`] rather than re-deriving the set.

/// Directory names excluded anywhere in a path.
pub const CANONICAL_EXCLUDED_DIRS: &[&str] = &[
    "node_modules",
    "dist",
    "build",
    "coverage",
    ".git",
    "interfaces",
    "interface",
    "types",
    "type",
    "enums",
    "enum",
    "constants",
    "typings",
];

/// Filename suffix patterns excluded regardless of directory.
pub const CANONICAL_EXCLUDED_FILE_PATTERNS: &[&str] = &[
    ".d.ts",
    ".interface.ts",
    ".interfaces.ts",
    ".types.ts",
    ".type.ts",
    ".enum.ts",
    ".enums.ts",
    ".constants.ts",
    ".constant.ts",
    ".spec.ts",
    ".test.ts",
    ".spec.tsx",
    ".test.tsx",
    "app.ts",
    "main.ts",
    "index.ts",
    ".module.ts",
    ".entity.ts",
];

/// True if `rel_path` (repo-relative, forward-slash separated) matches the
/// canonical exclusion set by directory component or filename pattern.
pub fn is_excluded_path(rel_path: &str) -> bool {
    let normalized = rel_path.replace('\\', "/");
    let components: Vec<&str> = normalized.split('/').collect();

    if components
        .iter()
        .take(components.len().saturating_sub(1))
        .any(|c| CANONICAL_EXCLUDED_DIRS.contains(c))
    {
        return true;
    }

    let file_name = components.last().copied().unwrap_or("");
    CANONICAL_EXCLUDED_FILE_PATTERNS
        .iter()
        .any(|pattern| file_name.ends_with(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excludes_by_directory() {
        assert!(is_excluded_path("src/node_modules/foo/bar.ts"));
        assert!(is_excluded_path("dist/out.ts"));
        assert!(is_excluded_path("src/types/foo.ts"));
    }

    #[test]
    fn excludes_by_file_pattern() {
        assert!(is_excluded_path("src/svc.spec.ts"));
        assert!(is_excluded_path("src/svc.test.ts"));
        assert!(is_excluded_path("src/svc.d.ts"));
        assert!(is_excluded_path("src/svc.entity.ts"));
        assert!(is_excluded_path("src/index.ts"));
        assert!(is_excluded_path("src/main.ts"));
    }

    #[test]
    fn keeps_ordinary_source_files() {
        assert!(!is_excluded_path("src/services/user_service.ts"));
        assert!(!is_excluded_path("src/controllers/auth.controller.ts"));
    }

    #[test]
    fn handles_backslash_separators() {
        assert!(is_excluded_path("src\\node_modules\\foo\\bar.ts"));
    }
}
