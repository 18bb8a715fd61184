//! C1 — `SandboxRunner`: isolated, network-restricted, filesystem-scoped
//! command execution.
//!
//! Grounded on the process-execution idiom in `rch-wkr`'s `executor` module
//! (spawn, capture combined output, map non-zero exit and spawn failure to a
//! structured result rather than a Rust panic) and on the timeout/output-
//! capture contract shown in `pantsbuild-pants`'
//! `process_execution::local::CommandRunner`. The actual isolation backend
//! is `bollard` (the Rust Docker Engine API client) — every untrusted
//! command in this domain must run inside a container, unlike a trusted
//! local `cargo build`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    WaitContainerOptions,
};
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use futures_util::StreamExt;
use tcg_common::CoreError;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Fixed in-sandbox mount point for the scoped host directory.
pub const SANDBOX_APP_DIR: &str = "/app";
/// Fixed in-sandbox mount point for the shared, read-only toolchain volume.
pub const SANDBOX_TOOLCHAIN_DIR: &str = "/toolchain";
/// Distinguished marker appended to output when a run is killed on timeout.
pub const TIMEOUT_MARKER: &str = "\n[TCG_SANDBOX_TIMEOUT]";

/// Outcome of a sandboxed (`run_in_container`) or host (`run_on_host`) command.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub success: bool,
    pub combined_output: String,
}

impl RunOutcome {
    pub fn timed_out(partial_output: impl Into<String>) -> Self {
        let mut combined_output = partial_output.into();
        combined_output.push_str(TIMEOUT_MARKER);
        Self {
            success: false,
            combined_output,
        }
    }
}

/// Request to execute a command inside the ephemeral sandbox.
pub struct ContainerRunRequest<'a> {
    pub command: &'a str,
    pub args: &'a [String],
    pub host_directory: &'a Path,
    pub env: &'a HashMap<String, String>,
    pub timeout: Duration,
    pub allow_network: bool,
    pub run_as_root: bool,
}

/// C1: execute commands in an isolated, network-restricted, filesystem-
/// scoped environment with timeout and output capture, or on the host for
/// local bookkeeping that never touches untrusted code.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Run `request.command` inside a fresh container. Mounts
    /// `host_directory` read-write at [`SANDBOX_APP_DIR`] and the shared
    /// toolchain volume read-only at [`SANDBOX_TOOLCHAIN_DIR`], with
    /// `NODE_PATH` pointed at the toolchain's `node_modules` so the test
    /// runner, type-checker, and generator CLI resolve without a per-job
    /// install. Network is denied unless `allow_network` is set.
    async fn run_in_container(&self, request: ContainerRunRequest<'_>) -> RunOutcome;

    /// Run a command directly on the host. Only used for bookkeeping that
    /// never executes untrusted repository code (e.g. removing a scratch
    /// directory).
    async fn run_on_host(
        &self,
        command: &str,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<RunOutcome, CoreError>;

    /// Probe the toolchain volume for marker binaries and, if missing, run a
    /// one-off privileged install that populates it. Bootstrap failures are
    /// logged but never prevent worker startup — per-job runs then fail
    /// explicitly with a `Sandbox` error instead.
    async fn ensure_toolchain(&self);
}

/// Docker-backed [`SandboxRunner`].
pub struct DockerSandboxRunner {
    docker: Docker,
    image: String,
    toolchain_volume: String,
}

impl DockerSandboxRunner {
    /// Connect using the platform default Docker socket, or `docker_host`
    /// when given (mirrors `DOCKER_HOST` override convention).
    pub fn connect(docker_host: Option<&str>, image: impl Into<String>) -> Result<Self, CoreError> {
        let docker = match docker_host {
            Some(host) => Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| CoreError::Sandbox(format!("docker connect failed: {e}")))?,
            None => Docker::connect_with_local_defaults()
                .map_err(|e| CoreError::Sandbox(format!("docker connect failed: {e}")))?,
        };
        Ok(Self {
            docker,
            image: image.into(),
            toolchain_volume: "tcg-toolchain".to_string(),
        })
    }

    async fn run_container(
        &self,
        cmd: Vec<String>,
        host_directory: &Path,
        env: &HashMap<String, String>,
        timeout: Duration,
        allow_network: bool,
        run_as_root: bool,
    ) -> RunOutcome {
        let mut env_vec: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        env_vec.push(format!("NODE_PATH={SANDBOX_TOOLCHAIN_DIR}/node_modules"));

        let host_dir_str = match host_directory.to_str() {
            Some(s) => s.to_string(),
            None => {
                return RunOutcome {
                    success: false,
                    combined_output: "host directory is not valid UTF-8".to_string(),
                };
            }
        };

        let host_config = HostConfig {
            mounts: Some(vec![
                Mount {
                    target: Some(SANDBOX_APP_DIR.to_string()),
                    source: Some(host_dir_str),
                    typ: Some(MountTypeEnum::BIND),
                    read_only: Some(false),
                    ..Default::default()
                },
                Mount {
                    target: Some(SANDBOX_TOOLCHAIN_DIR.to_string()),
                    source: Some(self.toolchain_volume.clone()),
                    typ: Some(MountTypeEnum::VOLUME),
                    read_only: Some(true),
                    ..Default::default()
                },
            ]),
            network_mode: Some(if allow_network {
                "bridge".to_string()
            } else {
                "none".to_string()
            }),
            ..Default::default()
        };

        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(cmd),
            env: Some(env_vec),
            working_dir: Some(SANDBOX_APP_DIR.to_string()),
            host_config: Some(host_config),
            user: if run_as_root {
                None
            } else {
                Some("1000:1000".to_string())
            },
            ..Default::default()
        };

        let name = format!("tcg-sandbox-{}", uuid::Uuid::new_v4());
        let create_result = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await;

        let container_id = match create_result {
            Ok(response) => response.id,
            Err(e) => {
                return RunOutcome {
                    success: false,
                    combined_output: format!("failed to create sandbox container: {e}"),
                };
            }
        };

        if let Err(e) = self.docker.start_container::<String>(&container_id, None).await {
            let _ = self.cleanup_container(&container_id).await;
            return RunOutcome {
                success: false,
                combined_output: format!("failed to start sandbox container: {e}"),
            };
        }

        let run = async {
            let mut combined_output = String::new();
            let mut logs = self.docker.logs::<String>(
                &container_id,
                Some(LogsOptions {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            );
            while let Some(chunk) = logs.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message } | LogOutput::StdErr { message }) => {
                        combined_output.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        combined_output.push_str(&format!("\n[log stream error: {e}]"));
                        break;
                    }
                }
            }

            let mut wait_stream = self
                .docker
                .wait_container(&container_id, None::<WaitContainerOptions<String>>);
            let exit_ok = matches!(wait_stream.next().await, Some(Ok(response)) if response.status_code == 0);

            (exit_ok, combined_output)
        };

        let outcome = match tokio::time::timeout(timeout, run).await {
            Ok((success, combined_output)) => RunOutcome {
                success,
                combined_output,
            },
            Err(_) => {
                let _ = self
                    .docker
                    .kill_container::<String>(&container_id, None)
                    .await;
                RunOutcome::timed_out(format!("sandbox command timed out after {timeout:?}"))
            }
        };

        let _ = self.cleanup_container(&container_id).await;
        outcome
    }

    async fn cleanup_container(&self, container_id: &str) -> Result<(), bollard::errors::Error> {
        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
    }
}

#[async_trait]
impl SandboxRunner for DockerSandboxRunner {
    async fn run_in_container(&self, request: ContainerRunRequest<'_>) -> RunOutcome {
        let mut cmd = vec![request.command.to_string()];
        cmd.extend(request.args.iter().cloned());
        self.run_container(
            cmd,
            request.host_directory,
            request.env,
            request.timeout,
            request.allow_network,
            request.run_as_root,
        )
        .await
    }

    async fn run_on_host(
        &self,
        command: &str,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<RunOutcome, CoreError> {
        let mut process = Command::new(command);
        process.args(args).current_dir(cwd).stdin(std::process::Stdio::null());

        let child = process
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| CoreError::Sandbox(format!("failed to spawn {command}: {e}")))?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                Ok(RunOutcome {
                    success: output.status.success(),
                    combined_output: combined,
                })
            }
            Ok(Err(e)) => Err(CoreError::Sandbox(format!("host command failed: {e}"))),
            Err(_) => Ok(RunOutcome::timed_out(format!(
                "host command timed out after {timeout:?}"
            ))),
        }
    }

    async fn ensure_toolchain(&self) {
        let markers = ["jest", "tsc", "generator-cli"];
        let probe = self
            .run_container(
                vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!(
                        "for m in {}; do test -x {SANDBOX_TOOLCHAIN_DIR}/bin/$m || exit 1; done",
                        markers.join(" ")
                    ),
                ],
                Path::new("/tmp"),
                &HashMap::new(),
                Duration::from_secs(30),
                false,
                false,
            )
            .await;

        if probe.success {
            tracing::info!("toolchain volume already populated");
            return;
        }

        tracing::warn!("toolchain volume missing markers, running privileged bootstrap install");
        let install = self
            .run_container(
                vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!(
                        "npm install --prefix {SANDBOX_TOOLCHAIN_DIR} jest ts-jest typescript jest-json-reporter"
                    ),
                ],
                Path::new("/tmp"),
                &HashMap::new(),
                Duration::from_secs(300),
                true,
                true,
            )
            .await;

        if !install.success {
            tracing::error!(
                output = %install.combined_output,
                "toolchain bootstrap failed; per-job sandbox runs will fail explicitly"
            );
        }
    }
}

/// Write `text` to a host-side scratch file. Shared helper for the many
/// call sites that create and delete transient prompt/config files within
/// one call or one attempt.
pub async fn write_scratch_file(path: &Path, text: &str) -> Result<(), CoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CoreError::Sandbox(format!("failed to create {parent:?}: {e}")))?;
    }
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| CoreError::Sandbox(format!("failed to create {path:?}: {e}")))?;
    file.write_all(text.as_bytes())
        .await
        .map_err(|e| CoreError::Sandbox(format!("failed to write {path:?}: {e}")))?;
    Ok(())
}

/// Delete a scratch file, silent if already absent (used on all exit paths
/// from `finally`-style cleanup blocks).
pub async fn remove_scratch_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove scratch file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timed_out_outcome_is_marked_unsuccessful() {
        let outcome = RunOutcome::timed_out("partial");
        assert!(!outcome.success);
        assert!(outcome.combined_output.contains("partial"));
        assert!(outcome.combined_output.contains(TIMEOUT_MARKER));
    }

    #[tokio::test]
    async fn write_and_remove_scratch_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("scratch.txt");
        write_scratch_file(&path, "hello").await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "hello");
        remove_scratch_file(&path).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn remove_scratch_file_is_silent_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never-created.txt");
        remove_scratch_file(&path).await;
    }
}
