//! LSP_ACTIVATE: progressive disclosure of language-server toolsets. The
//! registry keeps registered toolsets dormant until the model asks for one;
//! activation surfaces the new tools and returns their names.

use std::sync::Arc;

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

pub const LSP_ACTIVATE_TOOL: &str = "LSP_ACTIVATE";

pub(crate) fn tool() -> Tool {
    Tool::new(
        LSP_ACTIVATE_TOOL,
        "Activate a registered language-server toolset; returns the names of \
         the tools that became available.",
        object_schema(
            json!({
                "toolset": {"type": "string", "description": "Registered toolset name, e.g. a language id"},
            }),
            &["toolset"],
        ),
        Capability::Meta,
        Arc::new(LspActivateHandler),
    )
}

#[derive(Deserialize)]
struct LspArgs {
    toolset: String,
}

struct LspActivateHandler;

#[async_trait]
impl ToolHandler for LspActivateHandler {
    async fn run(
        &self,
        ctx: &ToolContext,
        args: Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let args: LspArgs = serde_json::from_value(Value::Object(args))?;
        let Some(registry) = ctx.registry.upgrade() else {
            return Ok(error_result(
                "NoRegistry",
                "toolset activation is not available in this context",
            ));
        };
        match registry.activate_toolset(&args.toolset) {
            Some(added) => {
                let mut map = Map::new();
                map.insert("activated".into(), json!(args.toolset));
                map.insert("added_tools".into(), json!(added));
                Ok(map)
            }
            None => Ok(error_result(
                "UnknownToolset",
                &format!("no dormant toolset named `{}`", args.toolset),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;
    use sable_protocol::ToolCall;

    use super::*;
    use crate::tools::ToolRegistry;

    struct NoopHandler;

    #[async_trait]
    impl ToolHandler for NoopHandler {
        async fn run(
            &self,
            _ctx: &ToolContext,
            _args: Map<String, Value>,
        ) -> Result<Map<String, Value>> {
            Ok(Map::new())
        }
    }

    fn dormant_tool(name: &str) -> Tool {
        Tool::new(
            name,
            "stub",
            json!({"type": "object", "properties": {}}),
            Capability::ReadOnly,
            Arc::new(NoopHandler),
        )
    }

    #[tokio::test]
    async fn activation_surfaces_new_tools() {
        let registry = Arc::new(ToolRegistry::builtin());
        registry.register_toolset(
            "rust",
            vec![dormant_tool("LSP_DEFINITION"), dormant_tool("LSP_REFERENCES")],
        );
        let before = registry.definitions().len();

        let mut ctx = ToolContext::new(PathBuf::from("."));
        ctx.registry = Arc::downgrade(&registry);
        let call = ToolCall {
            id: "c1".into(),
            name: LSP_ACTIVATE_TOOL.into(),
            args: json!({"toolset": "rust"}).as_object().unwrap().clone(),
            thought_signature: None,
        };
        let response = registry.dispatch(&ctx, &call).await;

        assert_eq!(
            json!(["LSP_DEFINITION", "LSP_REFERENCES"]),
            response.result["added_tools"]
        );
        assert_eq!(before + 2, registry.definitions().len());

        // A second activation of the same toolset no longer exists.
        let response = registry.dispatch(&ctx, &call).await;
        assert_eq!("UnknownToolset", response.result["error"]["code"]);
    }
}
