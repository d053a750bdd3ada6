//! Runtime execution policy: who may run what, where, and with which data
//! boundary. Derived once at process start and never persisted.

use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// How liberally commands are run without asking the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PermissionMode {
    /// Sandbox-first: unknown commands run in the sandbox, host escalations
    /// require approval.
    #[default]
    Default,

    /// Everything runs directly on the host without approval prompts.
    FullControl,
}

/// Data-boundary contract enforced by the sandbox runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SandboxPolicy {
    ReadOnly,

    WorkspaceWrite {
        network_access: bool,
        writable_roots: Vec<PathBuf>,
        read_only_subpaths: Vec<PathBuf>,
    },

    DangerFullAccess,

    /// Caller-supplied jail the runner does not manage itself.
    ExternalSandbox,
}

impl SandboxPolicy {
    /// The default boundary for `permission_mode = default`. The agent's
    /// own state dir is shielded from the commands it runs.
    pub fn workspace_write() -> Self {
        SandboxPolicy::WorkspaceWrite {
            network_access: true,
            writable_roots: vec![PathBuf::from(".")],
            read_only_subpaths: vec![PathBuf::from(".git"), PathBuf::from(".sable")],
        }
    }

    pub fn has_network_access(&self) -> bool {
        match self {
            SandboxPolicy::ReadOnly => false,
            SandboxPolicy::WorkspaceWrite { network_access, .. } => *network_access,
            SandboxPolicy::DangerFullAccess | SandboxPolicy::ExternalSandbox => true,
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, SandboxPolicy::ReadOnly)
    }

    pub fn is_unrestricted(&self) -> bool {
        matches!(self, SandboxPolicy::DangerFullAccess)
    }

    pub fn writable_roots(&self) -> &[PathBuf] {
        match self {
            SandboxPolicy::WorkspaceWrite { writable_roots, .. } => writable_roots,
            _ => &[],
        }
    }

    pub fn read_only_subpaths(&self) -> &[PathBuf] {
        match self {
            SandboxPolicy::WorkspaceWrite {
                read_only_subpaths, ..
            } => read_only_subpaths,
            _ => &[],
        }
    }
}

impl std::fmt::Display for SandboxPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SandboxPolicy::ReadOnly => "read_only",
            SandboxPolicy::WorkspaceWrite { .. } => "workspace_write",
            SandboxPolicy::DangerFullAccess => "danger_full_access",
            SandboxPolicy::ExternalSandbox => "external_sandbox",
        };
        f.write_str(name)
    }
}

/// Process-lifetime routing state derived from the permission mode plus the
/// requested sandbox type.
#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    pub permission_mode: PermissionMode,
    pub sandbox_type: Option<String>,
    pub sandbox_policy: SandboxPolicy,
    pub safe_commands: Vec<String>,
    pub fallback_to_host: bool,
    pub fallback_reason: String,

    /// When set, a sandboxed `exit 127` + "command not found" is retried on
    /// the host after approval.
    pub fallback_on_command_not_found: bool,
}

/// Derive the data boundary for a permission mode (spec'd defaults; callers
/// may override the workspace-write fields afterwards).
pub fn derive_sandbox_policy(permission_mode: PermissionMode) -> SandboxPolicy {
    match permission_mode {
        PermissionMode::Default => SandboxPolicy::workspace_write(),
        PermissionMode::FullControl => SandboxPolicy::DangerFullAccess,
    }
}

impl ExecutionPolicy {
    pub fn new(
        permission_mode: PermissionMode,
        sandbox_type: Option<String>,
        safe_commands: Vec<String>,
    ) -> Self {
        Self {
            permission_mode,
            sandbox_type,
            sandbox_policy: derive_sandbox_policy(permission_mode),
            safe_commands,
            fallback_to_host: false,
            fallback_reason: String::new(),
            fallback_on_command_not_found: true,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn default_mode_gets_workspace_write() {
        let policy = derive_sandbox_policy(PermissionMode::Default);
        assert!(policy.has_network_access());
        assert_eq!(&[PathBuf::from(".")], policy.writable_roots());
        assert_eq!(
            vec![PathBuf::from(".git"), PathBuf::from(".sable")],
            policy.read_only_subpaths().to_vec()
        );
    }

    #[test]
    fn full_control_gets_danger_full_access() {
        let policy = derive_sandbox_policy(PermissionMode::FullControl);
        assert!(policy.is_unrestricted());
        assert!(policy.has_network_access());
    }
}
