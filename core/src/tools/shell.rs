//! BASH: shell execution behind the execution router.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;

use super::Capability;
use super::Tool;
use super::ToolContext;
use super::ToolHandler;
use super::error_result;
use super::object_schema;
use crate::error::Result;
use crate::error::SableErr;
use crate::exec::CommandRequest;
use crate::exec::Route;
use crate::exec::SandboxPermissions;
use crate::exec::TimeoutKind;

pub(crate) fn tool() -> Tool {
    Tool::new(
        "BASH",
        "Run a shell command. Commands run in the sandbox by default; host \
         execution requires approval.",
        object_schema(
            json!({
                "command": {"type": "string", "description": "Shell command text"},
                "dir": {"type": "string", "description": "Working directory, default workspace root"},
                "timeout_ms": {"type": "integer", "description": "Wall-clock budget, default 90000"},
                "idle_timeout_ms": {"type": "integer", "description": "Silence budget, default 45000"},
                "sandbox_permissions": {
                    "type": "string",
                    "enum": ["auto", "require_escalated"],
                    "description": "Pass require_escalated to request host execution",
                },
            }),
            &["command"],
        ),
        Capability::Execute,
        Arc::new(BashHandler),
    )
}

#[derive(Deserialize)]
struct BashArgs {
    command: String,
    dir: Option<String>,
    timeout_ms: Option<u64>,
    idle_timeout_ms: Option<u64>,
    #[serde(default)]
    sandbox_permissions: SandboxPermissions,
}

struct BashHandler;

#[async_trait]
impl ToolHandler for BashHandler {
    async fn run(
        &self,
        ctx: &ToolContext,
        args: Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let args: BashArgs = serde_json::from_value(Value::Object(args))?;
        let Some(router) = &ctx.router else {
            return Ok(error_result(
                "NoRouter",
                "shell execution is not available in this context",
            ));
        };

        let dir = match &args.dir {
            Some(dir) => ctx.resolve(dir),
            None => ctx.workspace.clone(),
        };
        let mut request =
            CommandRequest::new(args.command.clone(), dir).with_cancel(ctx.cancel.clone());
        if let Some(ms) = args.timeout_ms {
            request.timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = args.idle_timeout_ms {
            request.idle_timeout = Duration::from_millis(ms);
        }

        let (result, decision) = match router
            .execute(&request, args.sandbox_permissions, None)
            .await
        {
            Ok(pair) => pair,
            // Approval denials and aborts come back as an error result the
            // model can read; the run loop decides whether the turn ends.
            Err(e @ (SableErr::ApprovalAborted { .. } | SableErr::ApprovalRequired { .. })) => {
                return Ok(error_result(e.code(), &e.to_string()));
            }
            Err(e) => return Err(e),
        };

        let mut map = Map::new();
        if let Some(kind) = result.timed_out {
            let code = match (decision.route, kind) {
                (Route::Sandbox, TimeoutKind::Command) => "SandboxCommandTimeout",
                (Route::Sandbox, TimeoutKind::Idle) => "SandboxIdleTimeout",
                (Route::Host, TimeoutKind::Command) => "HostCommandTimeout",
                (Route::Host, TimeoutKind::Idle) => "HostIdleTimeout",
            };
            map = error_result(code, "command killed by watchdog");
        }
        map.insert("stdout".into(), json!(result.stdout));
        map.insert("stderr".into(), json!(result.stderr));
        map.insert("exit_code".into(), json!(result.exit_code));
        map.insert("route".into(), json!(decision.route));
        if let Some(escalation) = decision.escalation {
            map.insert("escalation".into(), json!(escalation));
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::approval::ApprovalBroker;
    use crate::exec::ExecRouter;
    use crate::policy::ExecutionPolicy;
    use crate::policy::PermissionMode;

    async fn full_control_ctx() -> ToolContext {
        let router = ExecRouter::new(
            ExecutionPolicy::new(PermissionMode::FullControl, None, Vec::new()),
            Vec::new(),
            Arc::new(ApprovalBroker::new(&[], None)),
            PathBuf::from("/tmp"),
        )
        .await;
        let mut ctx = ToolContext::new(PathBuf::from("/tmp"));
        ctx.router = Some(Arc::new(router));
        ctx
    }

    #[tokio::test]
    async fn runs_on_host_in_full_control() {
        let ctx = full_control_ctx().await;
        let args = json!({"command": "echo shell-tool"})
            .as_object()
            .unwrap()
            .clone();
        let out = BashHandler.run(&ctx, args).await.unwrap();
        assert_eq!("shell-tool\n", out["stdout"]);
        assert_eq!(0, out["exit_code"]);
        assert_eq!("host", out["route"]);
    }

    #[tokio::test]
    async fn timeout_becomes_tool_error_with_partial_output() {
        let ctx = full_control_ctx().await;
        let args = json!({"command": "echo early; sleep 20", "timeout_ms": 300})
            .as_object()
            .unwrap()
            .clone();
        let out = BashHandler.run(&ctx, args).await.unwrap();
        assert_eq!("HostCommandTimeout", out["error"]["code"]);
        assert_eq!("early\n", out["stdout"]);
    }

    #[tokio::test]
    async fn denied_approval_is_an_error_result_not_a_crash() {
        // Default mode with no prompter: host route surfaces
        // ApprovalRequired as a readable tool error.
        let router = ExecRouter::new(
            ExecutionPolicy::new(PermissionMode::Default, None, Vec::new()),
            Vec::new(),
            Arc::new(ApprovalBroker::new(&[], None)),
            PathBuf::from("/tmp"),
        )
        .await;
        let mut ctx = ToolContext::new(PathBuf::from("/tmp"));
        ctx.router = Some(Arc::new(router));

        let args = json!({"command": "python3 app.py"})
            .as_object()
            .unwrap()
            .clone();
        let out = BashHandler.run(&ctx, args).await.unwrap();
        assert_eq!("ApprovalRequired", out["error"]["code"]);
    }
}
