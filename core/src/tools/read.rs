//! READ: file-segment read under a dual line/token budget.

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
use super::object_schema;
use crate::context::estimate_tokens;
use crate::error::Result;

const DEFAULT_LIMIT: usize = 2000;
const DEFAULT_MAX_TOKENS: u32 = 4000;
const TRUNCATION_SENTINEL: &str = "…[line truncated]";

pub(crate) fn tool() -> Tool {
    Tool::new(
        "READ",
        "Read a segment of a text file, bounded by a line count and a token budget.",
        object_schema(
            json!({
                "path": {"type": "string", "description": "File to read"},
                "offset": {"type": "integer", "description": "First line to return, 0-based"},
                "limit": {"type": "integer", "description": "Maximum number of lines"},
                "max_tokens": {"type": "integer", "description": "Token budget for the segment"},
            }),
            &["path"],
        ),
        Capability::ReadOnly,
        Arc::new(ReadHandler),
    )
}

#[derive(Deserialize)]
struct ReadArgs {
    path: String,
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
    max_tokens: Option<u32>,
}

struct ReadHandler;

#[async_trait]
impl ToolHandler for ReadHandler {
    async fn run(
        &self,
        ctx: &ToolContext,
        args: Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let args: ReadArgs = serde_json::from_value(Value::Object(args))?;
        let path = ctx.resolve(&args.path);
        let contents = std::fs::read_to_string(&path)?;
        let limit = args.limit.unwrap_or(DEFAULT_LIMIT).max(1);
        let max_tokens = args.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS).max(1);

        Ok(read_segment(&contents, args.offset, limit, max_tokens))
    }
}

fn read_segment(contents: &str, offset: usize, limit: usize, max_tokens: u32) -> Map<String, Value> {
    let lines: Vec<&str> = contents.lines().collect();
    let total_lines = lines.len();

    if offset >= total_lines {
        return result(0, 0, 0, 0, false, "", String::new());
    }

    let mut out = String::new();
    let mut used_tokens = 0u32;
    let mut emitted = 0usize;
    let mut truncated_reason = "";

    for line in lines.iter().skip(offset) {
        if emitted == limit {
            truncated_reason = "line_limit";
            break;
        }
        let line_tokens = estimate_tokens(line).max(1);
        if used_tokens + line_tokens > max_tokens {
            // Force-truncate the first over-budget line so a single long
            // line cannot blow the budget or starve the caller of output.
            let remaining = (max_tokens - used_tokens) as usize;
            let keep_chars = remaining.saturating_mul(4);
            let truncated: String = line.chars().take(keep_chars).collect();
            out.push_str(&truncated);
            out.push_str(TRUNCATION_SENTINEL);
            out.push('\n');
            used_tokens = max_tokens;
            emitted += 1;
            truncated_reason = "token_limit";
            break;
        }
        out.push_str(line);
        out.push('\n');
        used_tokens += line_tokens;
        emitted += 1;
    }

    let start_line = offset + 1;
    let end_line = offset + emitted;
    let has_more = end_line < total_lines || truncated_reason == "token_limit";
    result(
        start_line,
        end_line,
        emitted,
        used_tokens,
        has_more,
        truncated_reason,
        out,
    )
}

#[allow(clippy::too_many_arguments)]
fn result(
    start_line: usize,
    end_line: usize,
    line_count: usize,
    used_tokens: u32,
    has_more: bool,
    truncated_reason: &str,
    content: String,
) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("start_line".into(), json!(start_line));
    map.insert("end_line".into(), json!(end_line));
    map.insert("line_count".into(), json!(line_count));
    map.insert("used_tokens".into(), json!(used_tokens));
    map.insert("has_more".into(), json!(has_more));
    map.insert("truncated_reason".into(), json!(truncated_reason));
    map.insert("content".into(), json!(content));
    map
}
