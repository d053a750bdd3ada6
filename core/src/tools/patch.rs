//! PATCH: anchored replacement of an exact substring, with creation
//! semantics for empty anchors and a capped unified-diff preview.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use similar::ChangeTag;
use similar::TextDiff;

use super::Capability;
use super::Tool;
use super::ToolContext;
use super::ToolHandler;
use super::error_result;
use super::object_schema;
use crate::error::Result;

const PREVIEW_SIDE_CAP: usize = 4;
const PREVIEW_LINE_CAP: usize = 120;

pub(crate) fn tool() -> Tool {
    Tool::new(
        "PATCH",
        "Replace an exact substring in a file. An empty `old` creates the file; \
         multiple matches require `replace_all`.",
        object_schema(
            json!({
                "path": {"type": "string", "description": "File to patch"},
                "old": {"type": "string", "description": "Exact text to replace"},
                "new": {"type": "string", "description": "Replacement text"},
                "replace_all": {"type": "boolean", "description": "Replace every match"},
            }),
            &["path", "old", "new"],
        ),
        Capability::Mutating,
        Arc::new(PatchHandler),
    )
}

#[derive(Deserialize)]
struct PatchArgs {
    path: String,
    old: String,
    new: String,
    #[serde(default)]
    replace_all: bool,
}

struct PatchHandler;

#[async_trait]
impl ToolHandler for PatchHandler {
    async fn run(
        &self,
        ctx: &ToolContext,
        args: Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let args: PatchArgs = serde_json::from_value(Value::Object(args))?;
        let path = ctx.resolve(&args.path);

        if args.old.is_empty() {
            let existing = match std::fs::read_to_string(&path) {
                Ok(contents) => Some(contents),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            };
            return match existing {
                None => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, &args.new)?;
                    Ok(success(&args.path, true, 1, preview("", &args.new, 1)))
                }
                Some(contents) if contents.is_empty() => {
                    std::fs::write(&path, &args.new)?;
                    Ok(success(&args.path, false, 1, preview("", &args.new, 1)))
                }
                Some(_) => Ok(error_result(
                    "PatchConflict",
                    "empty `old` requires a nonexistent or empty target file",
                )),
            };
        }

        let contents = std::fs::read_to_string(&path)?;
        let matches = contents.matches(&args.old).count();
        if matches == 0 {
            return Ok(error_result("PatchConflict", "`old` text not found in file"));
        }
        if matches > 1 && !args.replace_all {
            return Ok(error_result(
                "PatchConflict",
                &format!("`old` matches {matches} locations; pass replace_all=true"),
            ));
        }

        let replaced = if args.replace_all { matches } else { 1 };
        let updated = if args.replace_all {
            contents.replace(&args.old, &args.new)
        } else {
            contents.replacen(&args.old, &args.new, 1)
        };
        std::fs::write(&path, &updated)?;

        let anchor_line = line_of_first_match(&contents, &args.old);
        Ok(success(
            &args.path,
            false,
            replaced,
            preview(&args.old, &args.new, anchor_line),
        ))
    }
}

fn line_of_first_match(contents: &str, old: &str) -> usize {
    match contents.find(old) {
        Some(offset) => contents[..offset].lines().count() + 1,
        None => 1,
    }
}

/// Unified-diff preview of the changed fragment, capped at four lines per
/// side and 120 chars per line, headed by `@@ -L,O +L,N @@`.
fn preview(old: &str, new: &str, anchor_line: usize) -> String {
    let old_lines = if old.is_empty() { 0 } else { old.lines().count() };
    let new_lines = if new.is_empty() { 0 } else { new.lines().count() };
    let mut out = format!("@@ -{anchor_line},{old_lines} +{anchor_line},{new_lines} @@\n");

    let diff = TextDiff::from_lines(old, new);
    let mut removed = 0usize;
    let mut added = 0usize;
    for change in diff.iter_all_changes() {
        let (sign, budget) = match change.tag() {
            ChangeTag::Delete => ('-', &mut removed),
            ChangeTag::Insert => ('+', &mut added),
            ChangeTag::Equal => continue,
        };
        if *budget == PREVIEW_SIDE_CAP {
            continue;
        }
        *budget += 1;
        let line: String = change
            .value()
            .trim_end_matches('\n')
            .chars()
            .take(PREVIEW_LINE_CAP)
            .collect();
        out.push(sign);
        out.push_str(&line);
        out.push('\n');
    }
    if removed == PREVIEW_SIDE_CAP || added == PREVIEW_SIDE_CAP {
        out.push_str("…\n");
    }
    out
}

fn success(path: &str, created: bool, replaced: usize, patch: String) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("path".into(), json!(path));
    map.insert("created".into(), json!(created));
    map.insert("replaced".into(), json!(replaced));
    map.insert("metadata".into(), json!({"patch": patch}));
    map
}
