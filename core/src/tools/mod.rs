//! Tool registry and dispatcher. A tool is a small capability record
//! `{name, description, schema, capability, run}`; dispatch validates the
//! model's arguments against the declared schema before running, and folds
//! every failure into an `{error: ...}` result so the model can recover.

mod fs_tools;
mod lsp;
mod patch;
mod read;
mod search;
mod shell;
mod write;

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::Weak;

use async_trait::async_trait;
use sable_protocol::ToolCall;
use sable_protocol::ToolResponse;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client_common::ToolDefinition;
use crate::error::Result;
use crate::exec::ExecRouter;

pub use lsp::LSP_ACTIVATE_TOOL;

/// What a tool is allowed to touch; used for display and coarse filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ReadOnly,
    Mutating,
    Execute,
    Meta,
}

/// Per-dispatch environment threaded through every `run` call.
pub struct ToolContext {
    pub workspace: PathBuf,
    pub router: Option<Arc<ExecRouter>>,
    pub cancel: CancellationToken,
    /// Back-reference for tools that mutate the registry (LSP_ACTIVATE).
    pub registry: Weak<ToolRegistry>,
}

impl ToolContext {
    pub fn new(workspace: PathBuf) -> Self {
        Self {
            workspace,
            router: None,
            cancel: CancellationToken::new(),
            registry: Weak::new(),
        }
    }

    /// Resolve a model-supplied path against the workspace root.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.workspace.join(p)
        }
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn run(&self, ctx: &ToolContext, args: Map<String, Value>)
    -> Result<Map<String, Value>>;
}

#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub schema: Value,
    pub capability: Capability,
    handler: Arc<dyn ToolHandler>,
}

impl Tool {
    pub fn new(
        name: &str,
        description: &str,
        schema: Value,
        capability: Capability,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            schema,
            capability,
            handler,
        }
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.schema.clone(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    active: HashMap<String, Tool>,
    /// Toolsets registered but not yet surfaced to the model; activated on
    /// demand through LSP_ACTIVATE.
    dormant: HashMap<String, Vec<Tool>>,
}

/// Name-keyed map of active tools plus dormant toolsets.
#[derive(Default)]
pub struct ToolRegistry {
    state: RwLock<RegistryState>,
}

impl ToolRegistry {
    /// Registry pre-populated with the built-in file, search and shell
    /// tools.
    pub fn builtin() -> Self {
        let registry = Self::default();
        for tool in [
            read::tool(),
            write::tool(),
            patch::tool(),
            search::tool(),
            fs_tools::glob_tool(),
            fs_tools::list_tool(),
            fs_tools::stat_tool(),
            shell::tool(),
            lsp::tool(),
        ] {
            registry.insert(tool);
        }
        registry
    }

    pub fn insert(&self, tool: Tool) {
        if let Ok(mut state) = self.state.write() {
            state.active.insert(tool.name.clone(), tool);
        }
    }

    pub fn register_toolset(&self, name: &str, tools: Vec<Tool>) {
        if let Ok(mut state) = self.state.write() {
            state.dormant.insert(name.to_string(), tools);
        }
    }

    /// Move a dormant toolset into the active map, returning the names that
    /// became visible. Unknown or already-active toolsets return None.
    pub fn activate_toolset(&self, name: &str) -> Option<Vec<String>> {
        let mut state = self.state.write().ok()?;
        let tools = state.dormant.remove(name)?;
        let mut added = Vec::with_capacity(tools.len());
        for tool in tools {
            added.push(tool.name.clone());
            state.active.insert(tool.name.clone(), tool);
        }
        added.sort();
        Some(added)
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let Ok(state) = self.state.read() else {
            return Vec::new();
        };
        let mut defs: Vec<ToolDefinition> =
            state.active.values().map(Tool::definition).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    fn get(&self, name: &str) -> Option<Tool> {
        self.state.read().ok()?.active.get(name).cloned()
    }

    /// Look up, validate, and run one tool call. Tool failures never abort
    /// the loop: they come back as an `{error: {code, message}}` result the
    /// model can read. The response id always equals the call id.
    pub async fn dispatch(&self, ctx: &ToolContext, call: &ToolCall) -> ToolResponse {
        let result = match self.get(&call.name) {
            Some(tool) => match validate_args(&tool.schema, &call.args) {
                Ok(()) => {
                    debug!("dispatching tool {} (call {})", call.name, call.id);
                    match tool.handler.run(ctx, call.args.clone()).await {
                        Ok(result) => result,
                        Err(e) => error_result(e.code(), &e.to_string()),
                    }
                }
                Err(reason) => error_result("InvalidArgs", &reason),
            },
            None => error_result("UnknownTool", &format!("no tool named `{}`", call.name)),
        };

        ToolResponse {
            id: call.id.clone(),
            name: call.name.clone(),
            result,
        }
    }
}

pub(crate) fn error_result(code: &str, message: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(
        "error".to_string(),
        json!({"code": code, "message": message}),
    );
    map
}

/// Validate `args` against the JSON-schema subset the built-in tools use:
/// top-level object with typed properties and a `required` list.
pub(crate) fn validate_args(schema: &Value, args: &Map<String, Value>) -> std::result::Result<(), String> {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !args.contains_key(name) {
                return Err(format!("missing required argument `{name}`"));
            }
        }
    }

    for (name, value) in args {
        let Some(property) = properties.get(name) else {
            return Err(format!("unexpected argument `{name}`"));
        };
        let Some(expected) = property.get("type").and_then(Value::as_str) else {
            continue;
        };
        let ok = match expected {
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            _ => true,
        };
        if !ok {
            return Err(format!("argument `{name}` must be a {expected}"));
        }
    }
    Ok(())
}

/// Shorthand used by the tool modules to build their arg schemas.
pub(crate) fn object_schema(
    properties: Value,
    required: &[&str],
) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: "call-1".to_string(),
            name: name.to_string(),
            args: args.as_object().cloned().unwrap_or_default(),
            thought_signature: None,
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result() {
        let registry = ToolRegistry::builtin();
        let ctx = ToolContext::new(PathBuf::from("."));
        let response = registry.dispatch(&ctx, &call("NOPE", json!({}))).await;
        assert_eq!("call-1", response.id);
        assert_eq!("UnknownTool", response.result["error"]["code"]);
    }

    #[tokio::test]
    async fn missing_required_arg_is_rejected_before_run() {
        let registry = ToolRegistry::builtin();
        let ctx = ToolContext::new(PathBuf::from("."));
        let response = registry.dispatch(&ctx, &call("READ", json!({}))).await;
        assert_eq!("InvalidArgs", response.result["error"]["code"]);
    }

    #[tokio::test]
    async fn wrong_arg_type_is_rejected() {
        let registry = ToolRegistry::builtin();
        let ctx = ToolContext::new(PathBuf::from("."));
        let response = registry
            .dispatch(&ctx, &call("READ", json!({"path": 42})))
            .await;
        assert_eq!("InvalidArgs", response.result["error"]["code"]);
    }

    #[test]
    fn definitions_are_sorted_for_reproducibility() {
        let registry = ToolRegistry::builtin();
        let names: Vec<String> = registry.definitions().iter().map(|d| d.name.clone()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(sorted, names);
        assert!(names.contains(&"BASH".to_string()));
        assert!(names.contains(&"PATCH".to_string()));
    }
}
