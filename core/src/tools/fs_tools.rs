//! GLOB, LIST and STAT: filesystem listing variants. Output is sorted so
//! results are reproducible across runs.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use wildmatch::WildMatch;

use super::Capability;
use super::Tool;
use super::ToolContext;
use super::ToolHandler;
use super::object_schema;
use crate::error::Result;

const GLOB_CAP: usize = 500;

pub(crate) fn glob_tool() -> Tool {
    Tool::new(
        "GLOB",
        "Match files under a directory with a wildcard pattern (`*`, `?`).",
        object_schema(
            json!({
                "pattern": {"type": "string", "description": "Wildcard pattern, matched against workspace-relative paths"},
                "path": {"type": "string", "description": "Directory to search, default workspace root"},
            }),
            &["pattern"],
        ),
        Capability::ReadOnly,
        Arc::new(GlobHandler),
    )
}

pub(crate) fn list_tool() -> Tool {
    Tool::new(
        "LIST",
        "List the entries of one directory.",
        object_schema(
            json!({
                "path": {"type": "string", "description": "Directory to list, default workspace root"},
            }),
            &[],
        ),
        Capability::ReadOnly,
        Arc::new(ListHandler),
    )
}

pub(crate) fn stat_tool() -> Tool {
    Tool::new(
        "STAT",
        "Report metadata for one path.",
        object_schema(
            json!({
                "path": {"type": "string", "description": "Path to inspect"},
            }),
            &["path"],
        ),
        Capability::ReadOnly,
        Arc::new(StatHandler),
    )
}

#[derive(Deserialize)]
struct GlobArgs {
    pattern: String,
    path: Option<String>,
}

struct GlobHandler;

#[async_trait]
impl ToolHandler for GlobHandler {
    async fn run(
        &self,
        ctx: &ToolContext,
        args: Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let args: GlobArgs = serde_json::from_value(Value::Object(args))?;
        let root = match &args.path {
            Some(p) => ctx.resolve(p),
            None => ctx.workspace.clone(),
        };
        let matcher = WildMatch::new(&args.pattern);

        let mut all = Vec::new();
        walk(&root, &mut all);
        let mut matches: Vec<String> = all
            .iter()
            .filter_map(|p| p.strip_prefix(&root).ok())
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|rel| matcher.matches(rel))
            .collect();
        matches.sort();
        let truncated = matches.len() > GLOB_CAP;
        matches.truncate(GLOB_CAP);

        let mut map = Map::new();
        map.insert("matches".into(), json!(matches));
        map.insert("count".into(), json!(matches.len()));
        map.insert("truncated".into(), json!(truncated));
        Ok(map)
    }
}

#[derive(Deserialize)]
struct ListArgs {
    path: Option<String>,
}

struct ListHandler;

#[async_trait]
impl ToolHandler for ListHandler {
    async fn run(
        &self,
        ctx: &ToolContext,
        args: Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let args: ListArgs = serde_json::from_value(Value::Object(args))?;
        let root = match &args.path {
            Some(p) => ctx.resolve(p),
            None => ctx.workspace.clone(),
        };

        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            let kind = if entry.path().is_dir() { "dir" } else { "file" };
            entries.push((entry.file_name().to_string_lossy().into_owned(), kind));
        }
        entries.sort();

        let mut map = Map::new();
        map.insert(
            "entries".into(),
            Value::Array(
                entries
                    .iter()
                    .map(|(name, kind)| json!({"name": name, "type": kind}))
                    .collect(),
            ),
        );
        map.insert("count".into(), json!(entries.len()));
        Ok(map)
    }
}

#[derive(Deserialize)]
struct StatArgs {
    path: String,
}

struct StatHandler;

#[async_trait]
impl ToolHandler for StatHandler {
    async fn run(
        &self,
        ctx: &ToolContext,
        args: Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let args: StatArgs = serde_json::from_value(Value::Object(args))?;
        let path = ctx.resolve(&args.path);

        let mut map = Map::new();
        map.insert("path".into(), json!(args.path));
        match std::fs::metadata(&path) {
            Ok(meta) => {
                map.insert("exists".into(), json!(true));
                map.insert("is_dir".into(), json!(meta.is_dir()));
                map.insert("size".into(), json!(meta.len()));
                if let Ok(modified) = meta.modified() {
                    let stamp: DateTime<Utc> = modified.into();
                    map.insert("modified".into(), json!(stamp.to_rfc3339()));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                map.insert("exists".into(), json!(false));
            }
            Err(e) => return Err(e.into()),
        }
        Ok(map)
    }
}

fn walk(path: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(path) else {
        return;
    };
    for entry in entries.flatten() {
        let entry_path = entry.path();
        if entry.file_name() == ".git" {
            continue;
        }
        if entry_path.is_dir() {
            walk(&entry_path, out);
        } else {
            out.push(entry_path);
        }
    }
}
