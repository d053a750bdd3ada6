//! Container sandbox backend. A long-lived detached container mounts the
//! workspace at `/workspace`; each command is a `docker exec` into it.
//! Commands outside the workspace fall back to a one-shot `docker run` that
//! mounts the other directory ad hoc.

use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use super::CommandRequest;
use super::CommandResult;
use super::SandboxRunner;
use super::run_with_watchdog;
use crate::error::Result;
use crate::error::SableErr;
use crate::policy::SandboxPolicy;

const PROBE_TIMEOUT: Duration = Duration::from_secs(20);
const CONTAINER_WORKDIR: &str = "/workspace";

static CONTAINER_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub struct DockerSandbox {
    docker_bin: String,
    image: String,
    workspace: PathBuf,
    policy: SandboxPolicy,
    /// Name of the detached keep-alive container, once started.
    container: Mutex<Option<String>>,
}

impl DockerSandbox {
    pub fn new(image: impl Into<String>, workspace: PathBuf, policy: SandboxPolicy) -> Self {
        Self::with_docker_bin("docker", image, workspace, policy)
    }

    /// Test seam: a bogus binary makes every probe fail deterministically.
    pub fn with_docker_bin(
        docker_bin: impl Into<String>,
        image: impl Into<String>,
        workspace: PathBuf,
        policy: SandboxPolicy,
    ) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            image: image.into(),
            workspace,
            policy,
            container: Mutex::new(None),
        }
    }

    async fn docker(&self, args: &[&str], timeout: Duration) -> Result<CommandResult> {
        let mut argv = vec![self.docker_bin.clone()];
        argv.extend(args.iter().map(|s| s.to_string()));
        run_with_watchdog(
            &argv,
            &std::env::temp_dir(),
            timeout,
            timeout,
            &CancellationToken::new(),
        )
        .await
    }

    fn network_arg(&self) -> &'static str {
        if self.policy.has_network_access() {
            "bridge"
        } else {
            "none"
        }
    }

    fn workspace_mount(&self) -> String {
        let suffix = if self.policy.is_read_only() { ":ro" } else { "" };
        format!(
            "{}:{CONTAINER_WORKDIR}{suffix}",
            self.workspace.to_string_lossy()
        )
    }

    /// Start (or reuse) the detached keep-alive container.
    async fn ensure_container(&self) -> Result<String> {
        let mut guard = self.container.lock().await;
        if let Some(name) = guard.as_ref() {
            return Ok(name.clone());
        }
        let name = format!(
            "sable-{}-{}",
            std::process::id(),
            CONTAINER_COUNTER.fetch_add(1, Ordering::SeqCst)
        );
        let mount = self.workspace_mount();
        let network = format!("--network={}", self.network_arg());
        let keepalive = "trap 'exit 0' TERM INT; while true; do sleep 3600; done";
        let out = self
            .docker(
                &[
                    "run", "-d", "--rm", "--name", &name, &network, "-v", &mount, "-w",
                    CONTAINER_WORKDIR, &self.image, "sh", "-lc", keepalive,
                ],
                PROBE_TIMEOUT,
            )
            .await?;
        if out.exit_code != 0 {
            return Err(SableErr::SandboxUnavailable(format!(
                "docker run failed: {}",
                out.stderr.trim()
            )));
        }
        debug!("started sandbox container {name}");
        *guard = Some(name.clone());
        Ok(name)
    }

    /// Map a host dir inside the workspace onto its container path.
    fn container_dir(&self, dir: &Path) -> Option<String> {
        let rel = dir.strip_prefix(&self.workspace).ok()?;
        if rel.as_os_str().is_empty() {
            Some(CONTAINER_WORKDIR.to_string())
        } else {
            Some(format!("{CONTAINER_WORKDIR}/{}", rel.to_string_lossy()))
        }
    }
}

#[async_trait]
impl SandboxRunner for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    /// `version` → `image inspect` (best-effort `pull` on miss) → one
    /// throwaway run to confirm the image has a shell.
    async fn probe(&self) -> Result<()> {
        let version = self.docker(&["version", "--format", "{{.Server.Version}}"], PROBE_TIMEOUT)
            .await
            .map_err(|e| SableErr::SandboxUnavailable(format!("docker not runnable: {e}")))?;
        if version.exit_code != 0 {
            return Err(SableErr::SandboxUnavailable(format!(
                "docker daemon unreachable: {}",
                version.stderr.trim()
            )));
        }

        let inspect = self
            .docker(&["image", "inspect", &self.image], PROBE_TIMEOUT)
            .await?;
        if inspect.exit_code != 0 {
            let pull = self
                .docker(&["pull", &self.image], Duration::from_secs(120))
                .await?;
            if pull.exit_code != 0 {
                return Err(SableErr::SandboxUnavailable(format!(
                    "image {} not present and pull failed: {}",
                    self.image,
                    pull.stderr.trim()
                )));
            }
        }

        let echo = self
            .docker(
                &[
                    "run", "--rm", "--network", "none", &self.image, "sh", "-lc", "echo ok",
                ],
                PROBE_TIMEOUT,
            )
            .await?;
        if echo.exit_code != 0 {
            return Err(SableErr::SandboxUnavailable(format!(
                "image {} has no usable shell: {}",
                self.image,
                echo.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn run(&self, request: &CommandRequest) -> Result<CommandResult> {
        let argv: Vec<String> = match self.container_dir(&request.dir) {
            Some(container_dir) => {
                let name = self.ensure_container().await?;
                vec![
                    self.docker_bin.clone(),
                    "exec".into(),
                    "-w".into(),
                    container_dir,
                    name,
                    "sh".into(),
                    "-lc".into(),
                    request.command.clone(),
                ]
            }
            None => {
                // Outside the mounted workspace: one-shot container mounting
                // the other directory ad hoc.
                let mount = format!("{}:{CONTAINER_WORKDIR}", request.dir.to_string_lossy());
                vec![
                    self.docker_bin.clone(),
                    "run".into(),
                    "--rm".into(),
                    format!("--network={}", self.network_arg()),
                    "-v".into(),
                    mount,
                    "-w".into(),
                    CONTAINER_WORKDIR.into(),
                    self.image.clone(),
                    "sh".into(),
                    "-lc".into(),
                    request.command.clone(),
                ]
            }
        };

        run_with_watchdog(
            &argv,
            &std::env::temp_dir(),
            request.timeout,
            request.idle_timeout,
            &request.cancel,
        )
        .await
    }

    async fn close(&self) -> Result<()> {
        let name = self.container.lock().await.take();
        // Double close is a no-op.
        let Some(name) = name else {
            return Ok(());
        };
        let out = self.docker(&["rm", "-f", &name], PROBE_TIMEOUT).await?;
        if out.exit_code != 0 {
            warn!("failed to remove container {name}: {}", out.stderr.trim());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    fn sandbox() -> DockerSandbox {
        DockerSandbox::with_docker_bin(
            "/nonexistent/docker-binary",
            "alpine:3.20",
            PathBuf::from("/home/dev/project"),
            SandboxPolicy::workspace_write(),
        )
    }

    #[tokio::test]
    async fn probe_fails_with_descriptive_error_when_docker_is_missing() {
        let err = sandbox().probe().await.unwrap_err();
        assert_eq!("SandboxUnavailable", err.code());
        assert!(err.to_string().contains("docker"));
    }

    #[tokio::test]
    async fn close_without_container_is_a_noop() {
        sandbox().close().await.unwrap();
        sandbox().close().await.unwrap();
    }

    #[test]
    fn container_dir_maps_workspace_subdirs() {
        let sandbox = sandbox();
        assert_eq!(
            Some("/workspace".to_string()),
            sandbox.container_dir(Path::new("/home/dev/project"))
        );
        assert_eq!(
            Some("/workspace/src".to_string()),
            sandbox.container_dir(Path::new("/home/dev/project/src"))
        );
        assert_eq!(None, sandbox.container_dir(Path::new("/etc")));
    }

    #[test]
    fn read_only_policy_mounts_ro() {
        let sandbox = DockerSandbox::with_docker_bin(
            "docker",
            "alpine:3.20",
            PathBuf::from("/ws"),
            SandboxPolicy::ReadOnly,
        );
        assert_eq!("/ws:/workspace:ro", sandbox.workspace_mount());
        assert_eq!("none", sandbox.network_arg());
    }
}
