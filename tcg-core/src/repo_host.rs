//! C3 — `RepositoryHost`: provider-side operations (dependency presence,
//! permission check, clone, push-branch, open pull request, cleanup).
//!
//! Clone/commit/push plumbing is grounded on `git2`'s usage in
//! `turborepo-scm`; PR creation and manifest/permission inspection use
//! `octocrab`, the established GitHub REST client in this corpus.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tcg_common::CoreError;

/// Parsed `owner/repo` identity extracted from a hosting URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoIdentity {
    pub owner: String,
    pub repo: String,
}

/// Parse `https://github.com/<owner>/<repo>[.git]` into its identity.
/// Fails fast with `InvalidRepoUrl` on anything else.
pub fn parse_github_url(url: &str) -> Result<RepoIdentity, CoreError> {
    let trimmed = url.trim().trim_end_matches('/');
    let without_suffix = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    let path = without_suffix
        .strip_prefix("https://github.com/")
        .or_else(|| without_suffix.strip_prefix("git@github.com:"))
        .ok_or_else(|| CoreError::InvalidRepoUrl(url.to_string()))?;

    let mut parts = path.splitn(2, '/');
    let owner = parts.next().unwrap_or_default();
    let repo = parts.next().unwrap_or_default();
    if owner.is_empty() || repo.is_empty() {
        return Err(CoreError::InvalidRepoUrl(url.to_string()));
    }
    Ok(RepoIdentity {
        owner: owner.to_string(),
        repo: repo.to_string(),
    })
}

/// File map for `commit_and_push`: in-clone relative path to file contents.
pub type FileMap = HashMap<PathBuf, String>;

/// C3: provider-side operations. Malformed URLs fail fast with
/// `CoreError::InvalidRepoUrl`; all other failures surface as
/// `CoreError::Host`.
#[async_trait]
pub trait RepositoryHost: Send + Sync {
    /// True iff every name in `deps` appears in the manifest's declared
    /// runtime or development dependencies, inspected via a read-only API
    /// call (no clone).
    async fn has_required_dependencies(&self, url: &str, deps: &[&str]) -> Result<bool, CoreError>;

    /// True iff the configured credential has write/admin rights. When no
    /// credential is configured, returns `true` (development mode) and logs
    /// a warning.
    async fn check_permissions(&self, url: &str) -> Result<bool, CoreError>;

    /// Clone `url` (optionally a single `branch`, shallow) into a uniquely
    /// named directory under the configured base path. Never embeds
    /// credentials in the URL; injects them via an HTTP auth header
    /// instead, and configures a bot commit identity on the clone.
    async fn clone(&self, url: &str, branch: Option<&str>) -> Result<PathBuf, CoreError>;

    /// The branch the fresh checkout's `HEAD` resolves to, falling back to
    /// `"main"` if the checkout reports none.
    fn default_branch(&self, local_path: &Path) -> Result<String, CoreError>;

    /// Create a branch, write `file_map` (creating parent directories),
    /// stage only `paths_to_stage` (or the keys of `file_map` if absent —
    /// never stage everything), commit, and push with upstream tracking.
    async fn commit_and_push(
        &self,
        local_path: &Path,
        branch_name: &str,
        file_map: &FileMap,
        commit_message: &str,
        paths_to_stage: Option<&[PathBuf]>,
    ) -> Result<(), CoreError>;

    /// Open a pull request; in credential-absent mode, returns a synthesized
    /// mock URL and logs instead of calling the provider.
    async fn create_pull_request(
        &self,
        url: &str,
        head_branch: &str,
        title: &str,
        body: &str,
        base_branch: &str,
    ) -> Result<String, CoreError>;

    /// Recursively remove the clone directory; silent if already absent.
    async fn cleanup(&self, local_path: &Path);
}

/// GitHub-backed [`RepositoryHost`]: `git2` for clone/commit/push, `octocrab`
/// for manifest inspection, permission checks, and PR creation.
pub struct GitHubRepositoryHost {
    token: Option<String>,
    clone_base_path: PathBuf,
    bot_name: String,
    bot_email: String,
}

impl GitHubRepositoryHost {
    pub fn new(token: Option<String>, clone_base_path: PathBuf) -> Self {
        Self {
            token,
            clone_base_path,
            bot_name: "tcg-bot".to_string(),
            bot_email: "tcg-bot@users.noreply.github.com".to_string(),
        }
    }

    fn octocrab(&self) -> Result<octocrab::Octocrab, CoreError> {
        let mut builder = octocrab::Octocrab::builder();
        if let Some(token) = &self.token {
            builder = builder.personal_token(token.clone());
        }
        builder
            .build()
            .map_err(|e| CoreError::Host(format!("failed to build GitHub client: {e}")))
    }
}

#[async_trait]
impl RepositoryHost for GitHubRepositoryHost {
    async fn has_required_dependencies(&self, url: &str, deps: &[&str]) -> Result<bool, CoreError> {
        let identity = parse_github_url(url)?;
        let octocrab = self.octocrab()?;
        let content = octocrab
            .repos(&identity.owner, &identity.repo)
            .get_content()
            .path("package.json")
            .send()
            .await
            .map_err(|e| CoreError::Host(format!("failed to read package.json: {e}")))?;

        let decoded = content
            .items
            .first()
            .and_then(|item| item.decoded_content())
            .ok_or_else(|| CoreError::Host("package.json has no readable content".to_string()))?;

        let manifest: serde_json::Value = serde_json::from_str(&decoded)
            .map_err(|e| CoreError::Host(format!("package.json is not valid JSON: {e}")))?;

        let declared = |section: &str| -> Vec<String> {
            manifest
                .get(section)
                .and_then(|v| v.as_object())
                .map(|obj| obj.keys().cloned().collect())
                .unwrap_or_default()
        };
        let mut all_deps = declared("dependencies");
        all_deps.extend(declared("devDependencies"));

        Ok(deps.iter().all(|d| all_deps.iter().any(|dep| dep == d)))
    }

    async fn check_permissions(&self, url: &str) -> Result<bool, CoreError> {
        let Some(_token) = &self.token else {
            tracing::warn!(url, "no GitHub credential configured; assuming write access (development mode)");
            return Ok(true);
        };
        let identity = parse_github_url(url)?;
        let octocrab = self.octocrab()?;
        let repo = octocrab
            .repos(&identity.owner, &identity.repo)
            .get()
            .await
            .map_err(|e| CoreError::Host(format!("failed to fetch repository metadata: {e}")))?;

        Ok(repo
            .permissions
            .map(|p| p.push || p.admin)
            .unwrap_or(false))
    }

    async fn clone(&self, url: &str, branch: Option<&str>) -> Result<PathBuf, CoreError> {
        let identity = parse_github_url(url)?;
        let local_path = self
            .clone_base_path
            .join(format!("{}-{}-{}", identity.owner, identity.repo, uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&local_path)
            .await
            .map_err(|e| CoreError::Host(format!("failed to create clone directory: {e}")))?;

        let clone_url = format!("https://github.com/{}/{}.git", identity.owner, identity.repo);

        let local_path_owned = local_path.clone();
        let branch_owned = branch.map(str::to_string);
        let auth_token = self.token.clone();
        let repo = tokio::task::spawn_blocking(move || -> Result<git2::Repository, git2::Error> {
            let mut callbacks = git2::RemoteCallbacks::new();
            if let Some(token) = auth_token {
                callbacks.credentials(move |_url, _username, _allowed| {
                    git2::Cred::userpass_plaintext("x-access-token", &token)
                });
            }
            let mut fetch_options = git2::FetchOptions::new();
            fetch_options.remote_callbacks(callbacks);

            let mut builder = git2::build::RepoBuilder::new();
            builder.fetch_options(fetch_options);
            if let Some(branch) = &branch_owned {
                builder.branch(branch);
            }
            builder.clone(&clone_url, &local_path_owned)
        })
        .await
        .map_err(|e| CoreError::Host(format!("clone task panicked: {e}")))?
        .map_err(|e| CoreError::Host(format!("git clone failed: {e}")))?;

        let mut config = repo
            .config()
            .map_err(|e| CoreError::Host(format!("failed to open git config: {e}")))?;
        config
            .set_str("user.name", &self.bot_name)
            .and_then(|_| config.set_str("user.email", &self.bot_email))
            .map_err(|e| CoreError::Host(format!("failed to configure bot identity: {e}")))?;

        Ok(local_path)
    }

    fn default_branch(&self, local_path: &Path) -> Result<String, CoreError> {
        let repo = git2::Repository::open(local_path)
            .map_err(|e| CoreError::Host(format!("failed to open clone: {e}")))?;
        match repo.head() {
            Ok(head) => Ok(head
                .shorthand()
                .map(str::to_string)
                .unwrap_or_else(|| "main".to_string())),
            Err(_) => Ok("main".to_string()),
        }
    }

    async fn commit_and_push(
        &self,
        local_path: &Path,
        branch_name: &str,
        file_map: &FileMap,
        commit_message: &str,
        paths_to_stage: Option<&[PathBuf]>,
    ) -> Result<(), CoreError> {
        for (relative_path, contents) in file_map {
            let full_path = local_path.join(relative_path);
            if let Some(parent) = full_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| CoreError::Push(format!("failed to create {parent:?}: {e}")))?;
            }
            tokio::fs::write(&full_path, contents)
                .await
                .map_err(|e| CoreError::Push(format!("failed to write {full_path:?}: {e}")))?;
        }

        let local_path = local_path.to_path_buf();
        let branch_name = branch_name.to_string();
        let commit_message = commit_message.to_string();
        let stage_paths: Vec<PathBuf> = paths_to_stage
            .map(|p| p.to_vec())
            .unwrap_or_else(|| file_map.keys().cloned().collect());
        let auth_token = self.token.clone();

        tokio::task::spawn_blocking(move || -> Result<(), git2::Error> {
            let repo = git2::Repository::open(&local_path)?;

            let head_commit = repo.head()?.peel_to_commit()?;
            let branch = repo.branch(&branch_name, &head_commit, true)?;
            repo.set_head(branch.get().name().unwrap_or_default())?;
            repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))?;

            let mut index = repo.index()?;
            for path in &stage_paths {
                index.add_path(path)?;
            }
            index.write()?;
            let tree_id = index.write_tree()?;
            let tree = repo.find_tree(tree_id)?;

            let signature = repo.signature()?;
            repo.commit(
                Some("HEAD"),
                &signature,
                &signature,
                &commit_message,
                &tree,
                &[&head_commit],
            )?;

            let mut remote = repo.find_remote("origin")?;
            let mut callbacks = git2::RemoteCallbacks::new();
            if let Some(token) = auth_token {
                callbacks.credentials(move |_url, _username, _allowed| {
                    git2::Cred::userpass_plaintext("x-access-token", &token)
                });
            }
            let mut push_options = git2::PushOptions::new();
            push_options.remote_callbacks(callbacks);
            let refspec = format!("refs/heads/{branch_name}:refs/heads/{branch_name}");
            remote.push(&[refspec.as_str()], Some(&mut push_options))?;

            Ok(())
        })
        .await
        .map_err(|e| CoreError::Push(format!("push task panicked: {e}")))?
        .map_err(|e| CoreError::Push(format!("git push failed: {e}")))
    }

    async fn create_pull_request(
        &self,
        url: &str,
        head_branch: &str,
        title: &str,
        body: &str,
        base_branch: &str,
    ) -> Result<String, CoreError> {
        let identity = parse_github_url(url)?;

        let Some(_token) = &self.token else {
            let mock_url = format!(
                "https://github.com/{}/{}/pull/mock-{}",
                identity.owner,
                identity.repo,
                uuid::Uuid::new_v4()
            );
            tracing::info!(url = %mock_url, "no GitHub credential configured; synthesizing mock PR URL");
            return Ok(mock_url);
        };

        let octocrab = self.octocrab()?;
        let pr = octocrab
            .pulls(&identity.owner, &identity.repo)
            .create(title, head_branch, base_branch)
            .body(body)
            .send()
            .await
            .map_err(|e| CoreError::PrCreation(e.to_string()))?;

        pr.html_url
            .map(|u| u.to_string())
            .ok_or_else(|| CoreError::PrCreation("provider returned no PR URL".to_string()))
    }

    async fn cleanup(&self, local_path: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(local_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %local_path.display(), error = %e, "failed to clean up clone directory");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_https_github_url() {
        let id = parse_github_url("https://github.com/octocat/hello-world").unwrap();
        assert_eq!(id.owner, "octocat");
        assert_eq!(id.repo, "hello-world");
    }

    #[test]
    fn parses_https_url_with_git_suffix_and_trailing_slash() {
        let id = parse_github_url("https://github.com/octocat/hello-world.git/").unwrap();
        assert_eq!(id.owner, "octocat");
        assert_eq!(id.repo, "hello-world");
    }

    #[test]
    fn parses_ssh_style_url() {
        let id = parse_github_url("git@github.com:octocat/hello-world.git").unwrap();
        assert_eq!(id.owner, "octocat");
        assert_eq!(id.repo, "hello-world");
    }

    #[test]
    fn rejects_malformed_urls() {
        assert!(matches!(
            parse_github_url("not-a-url"),
            Err(CoreError::InvalidRepoUrl(_))
        ));
        assert!(matches!(
            parse_github_url("https://github.com/onlyowner"),
            Err(CoreError::InvalidRepoUrl(_))
        ));
    }
}
