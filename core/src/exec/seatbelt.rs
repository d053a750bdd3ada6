//! macOS seatbelt backend. Each invocation assembles an SBPL profile from
//! the sandbox policy and runs one independent `sandbox-exec` subprocess; no
//! long-lived session exists.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::CommandRequest;
use super::CommandResult;
use super::SandboxRunner;
use super::run_with_watchdog;
use crate::error::Result;
use crate::error::SableErr;
use crate::policy::SandboxPolicy;

/// Only trust `sandbox-exec` from `/usr/bin`; if that binary has been
/// tampered with the attacker already has root.
const SEATBELT_EXECUTABLE: &str = "/usr/bin/sandbox-exec";

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct SeatbeltSandbox {
    executable: String,
    workspace: PathBuf,
    policy: SandboxPolicy,
}

impl SeatbeltSandbox {
    pub fn new(workspace: PathBuf, policy: SandboxPolicy) -> Self {
        Self::with_executable(SEATBELT_EXECUTABLE, workspace, policy)
    }

    pub fn with_executable(
        executable: impl Into<String>,
        workspace: PathBuf,
        policy: SandboxPolicy,
    ) -> Self {
        Self {
            executable: executable.into(),
            workspace,
            policy,
        }
    }

    /// Writable roots from the policy, resolved against the workspace; when
    /// the policy does not override them the platform defaults apply.
    fn resolved_writable_roots(&self) -> Vec<PathBuf> {
        let declared = self.policy.writable_roots();
        let uses_defaults =
            declared.is_empty() || declared == [PathBuf::from(".")];
        if !uses_defaults {
            return declared
                .iter()
                .map(|root| {
                    if root.is_absolute() {
                        root.clone()
                    } else {
                        self.workspace.join(root)
                    }
                })
                .collect();
        }

        let mut roots = vec![self.workspace.clone()];
        if let Ok(tmpdir) = std::env::var("TMPDIR") {
            roots.push(PathBuf::from(tmpdir));
        }
        if let Some(home) = dirs::home_dir() {
            roots.push(home.join("Library/Caches"));
            roots.push(home.join(".cache"));
            roots.push(home.join(".npm"));
        }
        roots
    }

    /// Assemble the SBPL profile plus the `-D` parameter args it references.
    fn build_profile(&self) -> (String, Vec<String>) {
        let mut profile = String::from(
            "(version 1)\n\
             (deny default)\n\
             (import \"system.sb\")\n\
             (allow file-read*)\n\
             (allow process*)\n\
             (allow signal (target self))\n\
             (allow sysctl-read)\n",
        );
        let mut params = Vec::new();

        if self.policy.is_unrestricted() {
            profile.push_str("(allow file-write* (regex #\"^/\"))\n");
        } else if !self.policy.is_read_only() {
            let roots = self.resolved_writable_roots();
            if !roots.is_empty() {
                profile.push_str("(allow file-write*\n");
                for (index, root) in roots.iter().enumerate() {
                    let param = format!("WRITABLE_ROOT_{index}");
                    profile.push_str(&format!("  (subpath (param \"{param}\"))\n"));
                    params.push(format!("-D{param}={}", root.to_string_lossy()));
                }
                profile.push_str(")\n");
            }
            let denied = self.policy.read_only_subpaths();
            if !denied.is_empty() {
                profile.push_str("(deny file-write*\n");
                for (index, sub) in denied.iter().enumerate() {
                    let resolved = if sub.is_absolute() {
                        sub.clone()
                    } else {
                        self.workspace.join(sub)
                    };
                    let param = format!("READONLY_SUBPATH_{index}");
                    profile.push_str(&format!("  (subpath (param \"{param}\"))\n"));
                    params.push(format!("-D{param}={}", resolved.to_string_lossy()));
                }
                profile.push_str(")\n");
            }
        }

        if self.policy.has_network_access() {
            profile.push_str("(allow network*)\n");
        }

        (profile, params)
    }
}

#[async_trait]
impl SandboxRunner for SeatbeltSandbox {
    fn name(&self) -> &'static str {
        "seatbelt"
    }

    async fn probe(&self) -> Result<()> {
        let argv = vec![
            self.executable.clone(),
            "-p".to_string(),
            "(version 1)(allow default)".to_string(),
            "/bin/sh".to_string(),
            "-lc".to_string(),
            "echo ok".to_string(),
        ];
        let out = run_with_watchdog(
            &argv,
            &std::env::temp_dir(),
            PROBE_TIMEOUT,
            PROBE_TIMEOUT,
            &CancellationToken::new(),
        )
        .await
        .map_err(|e| SableErr::SandboxUnavailable(format!("sandbox-exec not runnable: {e}")))?;
        if out.exit_code != 0 {
            return Err(SableErr::SandboxUnavailable(format!(
                "sandbox-exec probe failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn run(&self, request: &CommandRequest) -> Result<CommandResult> {
        let (profile, params) = self.build_profile();
        let mut argv = vec![self.executable.clone(), "-p".to_string(), profile];
        argv.extend(params);
        argv.push("--".to_string());
        argv.push("/bin/sh".to_string());
        argv.push("-lc".to_string());
        argv.push(request.command.clone());

        run_with_watchdog(
            &argv,
            &request.dir,
            request.timeout,
            request.idle_timeout,
            &request.cancel,
        )
        .await
    }

    async fn close(&self) -> Result<()> {
        // No persistent session to tear down.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    fn sandbox(policy: SandboxPolicy) -> SeatbeltSandbox {
        SeatbeltSandbox::new(PathBuf::from("/home/dev/project"), policy)
    }

    #[test]
    fn workspace_write_profile_has_write_and_deny_sections() {
        let (profile, params) = sandbox(SandboxPolicy::workspace_write()).build_profile();
        assert!(profile.contains("(allow file-read*)"));
        assert!(profile.contains("(allow file-write*"));
        assert!(profile.contains("(deny file-write*"));
        assert!(profile.contains("(allow network*)"));
        assert!(profile.contains("(import \"system.sb\")"));
        assert!(
            params
                .iter()
                .any(|p| p.starts_with("-DWRITABLE_ROOT_0=/home/dev/project"))
        );
        assert!(
            params
                .iter()
                .any(|p| p.contains("READONLY_SUBPATH_0=/home/dev/project/.git"))
        );
    }

    #[test]
    fn read_only_profile_has_no_write_allowance() {
        let (profile, params) = sandbox(SandboxPolicy::ReadOnly).build_profile();
        assert!(!profile.contains("(allow file-write*"));
        assert!(!profile.contains("(allow network*)"));
        assert_eq!(0, params.len());
    }

    #[test]
    fn full_access_profile_allows_all_writes() {
        let (profile, _) = sandbox(SandboxPolicy::DangerFullAccess).build_profile();
        assert!(profile.contains("(allow file-write* (regex #\"^/\"))"));
        assert!(profile.contains("(allow network*)"));
    }

    #[test]
    fn explicit_roots_override_platform_defaults() {
        let policy = SandboxPolicy::WorkspaceWrite {
            network_access: false,
            writable_roots: vec![PathBuf::from("/custom/root")],
            read_only_subpaths: vec![],
        };
        let roots = sandbox(policy).resolved_writable_roots();
        assert_eq!(vec![PathBuf::from("/custom/root")], roots);
    }
}
