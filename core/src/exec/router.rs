//! Execution router: decides, per shell command, whether to run in the
//! sandbox or on the host, derives the escalation reason, and owns the
//! process-lifetime fallback state entered when no sandbox probes healthy.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tracing::info;
use tracing::warn;

use super::CommandRequest;
use super::CommandResult;
use super::DockerSandbox;
use super::HostRunner;
use super::SandboxRunner;
use super::SeatbeltSandbox;
use crate::approval::ApprovalBroker;
use crate::approval::ApprovalRequest;
use crate::error::Result;
use crate::error::SableErr;
use crate::flags::SABLE_SANDBOX_IMAGE;
use crate::policy::ExecutionPolicy;
use crate::policy::PermissionMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Sandbox,
    Host,
}

/// Per-call escalation request from the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxPermissions {
    #[default]
    Auto,
    RequireEscalated,
}

/// A decision some outer policy layer already made for this command; the
/// router honors it before its own ladder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Deny { reason: String },
    RequireApproval { route: Route },
    Allow { route: Route },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDecision {
    pub route: Route,
    /// Present when routing to the host needs a human-readable reason.
    pub escalation: Option<String>,
}

pub struct ExecRouter {
    policy: ExecutionPolicy,
    sandbox: Option<Arc<dyn SandboxRunner>>,
    host: HostRunner,
    approval: Arc<ApprovalBroker>,
    workspace: PathBuf,
}

/// Build the probe candidates for the requested sandbox type. Platform
/// rules: darwin only offers seatbelt and rejects an explicit docker
/// request; every other platform defaults to docker.
pub fn build_candidates(
    requested: Option<&str>,
    workspace: &PathBuf,
    policy: &ExecutionPolicy,
) -> Result<Vec<Arc<dyn SandboxRunner>>> {
    let platform = std::env::consts::OS;
    let darwin = platform == "macos";

    if let Some(requested) = requested {
        return match requested {
            "seatbelt" => Ok(vec![Arc::new(SeatbeltSandbox::new(
                workspace.clone(),
                policy.sandbox_policy.clone(),
            ))]),
            "docker" if darwin => Err(SableErr::SandboxUnsupported {
                requested: requested.to_string(),
                platform: "macos",
            }),
            "docker" => Ok(vec![Arc::new(DockerSandbox::new(
                (*SABLE_SANDBOX_IMAGE).to_string(),
                workspace.clone(),
                policy.sandbox_policy.clone(),
            ))]),
            other => Err(SableErr::SandboxUnsupported {
                requested: other.to_string(),
                platform: std::env::consts::OS,
            }),
        };
    }

    if darwin {
        Ok(vec![Arc::new(SeatbeltSandbox::new(
            workspace.clone(),
            policy.sandbox_policy.clone(),
        ))])
    } else {
        Ok(vec![Arc::new(DockerSandbox::new(
            (*SABLE_SANDBOX_IMAGE).to_string(),
            workspace.clone(),
            policy.sandbox_policy.clone(),
        ))])
    }
}

impl ExecRouter {
    /// Probe `candidates` in order and keep the first healthy one. When none
    /// probes OK the router enters fallback-to-host for the rest of the
    /// process and records the combined failure message.
    pub async fn new(
        mut policy: ExecutionPolicy,
        candidates: Vec<Arc<dyn SandboxRunner>>,
        approval: Arc<ApprovalBroker>,
        workspace: PathBuf,
    ) -> Self {
        let mut selected = None;
        let mut failures = Vec::new();

        if policy.permission_mode == PermissionMode::Default {
            for candidate in candidates {
                match candidate.probe().await {
                    Ok(()) => {
                        info!("selected sandbox backend: {}", candidate.name());
                        policy.sandbox_type = Some(candidate.name().to_string());
                        selected = Some(candidate);
                        break;
                    }
                    Err(e) => {
                        warn!("sandbox {} failed probe: {e}", candidate.name());
                        failures.push(format!("{}: {e}", candidate.name()));
                    }
                }
            }
            if selected.is_none() {
                policy.fallback_to_host = true;
                policy.fallback_reason = failures.join("; ");
                warn!(
                    "no sandbox available, falling back to host: {}",
                    policy.fallback_reason
                );
            }
        }

        Self {
            policy,
            sandbox: selected,
            host: HostRunner,
            approval,
            workspace,
        }
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    pub fn fallback_reason(&self) -> &str {
        &self.policy.fallback_reason
    }

    /// The routing ladder from the top: full-control, outer policy
    /// decisions, explicit escalation requests, fallback state, sandbox.
    pub fn decide_route(
        &self,
        permissions: SandboxPermissions,
        outer: Option<&PolicyDecision>,
    ) -> Result<CommandDecision> {
        if self.policy.permission_mode == PermissionMode::FullControl {
            return Ok(CommandDecision {
                route: Route::Host,
                escalation: None,
            });
        }

        if let Some(decision) = outer {
            return match decision {
                PolicyDecision::Deny { reason } => Err(SableErr::ApprovalAborted {
                    reason: format!("denied by policy: {reason}"),
                }),
                PolicyDecision::RequireApproval { route } => Ok(CommandDecision {
                    route: *route,
                    escalation: Some("required by policy".to_string()),
                }),
                PolicyDecision::Allow { route } => Ok(CommandDecision {
                    route: *route,
                    escalation: None,
                }),
            };
        }

        if permissions == SandboxPermissions::RequireEscalated {
            return Ok(CommandDecision {
                route: Route::Host,
                escalation: Some("sandbox_permissions=require_escalated requested".to_string()),
            });
        }

        if self.policy.fallback_to_host {
            return Ok(CommandDecision {
                route: Route::Host,
                escalation: Some(format!(
                    "sandbox unavailable: {}",
                    self.policy.fallback_reason
                )),
            });
        }

        Ok(CommandDecision {
            route: Route::Sandbox,
            escalation: None,
        })
    }

    /// Decide, get consent where required, run, and apply the
    /// command-not-found host fallback. The returned decision tells the
    /// caller which route actually ran.
    pub async fn execute(
        &self,
        request: &CommandRequest,
        permissions: SandboxPermissions,
        outer: Option<&PolicyDecision>,
    ) -> Result<(CommandResult, CommandDecision)> {
        let decision = self.decide_route(permissions, outer)?;

        match decision.route {
            Route::Host => {
                let result = self.run_on_host(request, decision.escalation.as_deref()).await?;
                Ok((result, decision))
            }
            Route::Sandbox => {
                let Some(sandbox) = &self.sandbox else {
                    // Should not happen: fallback state already routed host.
                    return Err(SableErr::SandboxUnavailable(
                        "no sandbox selected".to_string(),
                    ));
                };
                let result = sandbox.run(request).await?;

                if self.policy.fallback_on_command_not_found
                    && is_command_not_found(&result)
                {
                    let missing = first_word(&request.command);
                    let escalation = format!(
                        "`{missing}` is not available in the sandbox; approve running on the host"
                    );
                    let host_result =
                        self.run_on_host(request, Some(&escalation)).await?;
                    return Ok((
                        host_result,
                        CommandDecision {
                            route: Route::Host,
                            escalation: Some(escalation),
                        },
                    ));
                }

                Ok((result, decision))
            }
        }
    }

    /// Host execution: approval-gated in default mode, direct in full
    /// control.
    async fn run_on_host(
        &self,
        request: &CommandRequest,
        reason: Option<&str>,
    ) -> Result<CommandResult> {
        if self.policy.permission_mode == PermissionMode::Default {
            let approved = self
                .approval
                .approve(&ApprovalRequest {
                    tool_name: "BASH".to_string(),
                    action: "run on host".to_string(),
                    reason: reason.unwrap_or("outside safe command set").to_string(),
                    command: request.command.clone(),
                })
                .await?;
            if !approved {
                return Err(SableErr::ApprovalAborted {
                    reason: "denied by user".to_string(),
                });
            }
        }
        self.host.run(request).await
    }

    pub fn workspace(&self) -> &PathBuf {
        &self.workspace
    }

    pub async fn close(&self) -> Result<()> {
        if let Some(sandbox) = &self.sandbox {
            sandbox.close().await?;
        }
        Ok(())
    }
}

fn is_command_not_found(result: &CommandResult) -> bool {
    result.exit_code == 127
        && (result.stderr.contains("not found") || result.stderr.contains("command not found"))
}

fn first_word(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or(command)
}
