//! SEARCH: plain-text find over one file or a directory tree.

use std::path::Path;
use std::path::PathBuf;
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
use crate::error::Result;

const DEFAULT_LIMIT: usize = 50;
const HARD_CAP: usize = 200;

pub(crate) fn tool() -> Tool {
    Tool::new(
        "SEARCH",
        "Find a text needle in one file or recursively under a directory.",
        object_schema(
            json!({
                "query": {"type": "string", "description": "Text to search for"},
                "path": {"type": "string", "description": "File or directory, default workspace root"},
                "limit": {"type": "integer", "description": "Maximum hits, capped at 200"},
            }),
            &["query"],
        ),
        Capability::ReadOnly,
        Arc::new(SearchHandler),
    )
}

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    path: Option<String>,
    limit: Option<usize>,
}

struct SearchHandler;

#[async_trait]
impl ToolHandler for SearchHandler {
    async fn run(
        &self,
        ctx: &ToolContext,
        args: Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let args: SearchArgs = serde_json::from_value(Value::Object(args))?;
        let root = match &args.path {
            Some(p) => ctx.resolve(p),
            None => ctx.workspace.clone(),
        };
        let limit = args.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, HARD_CAP);
        Ok(search(&root, &args.query, limit))
    }
}

struct Hit {
    file: String,
    line: usize,
    text: String,
}

fn search(root: &Path, query: &str, limit: usize) -> Map<String, Value> {
    let mut files = Vec::new();
    collect_files(root, &mut files);
    files.sort();

    let mut hits: Vec<Hit> = Vec::new();
    let mut scanned_files = 0usize;
    let mut files_with_hits = 0usize;
    let mut truncated = false;

    'files: for file in &files {
        let Ok(contents) = std::fs::read_to_string(file) else {
            // Binary or unreadable; skip rather than fail the search.
            continue;
        };
        scanned_files += 1;
        let mut hit_in_file = false;
        for (i, line) in contents.lines().enumerate() {
            if !line.contains(query) {
                continue;
            }
            if !hit_in_file {
                hit_in_file = true;
                files_with_hits += 1;
            }
            if hits.len() == limit {
                truncated = true;
                break 'files;
            }
            hits.push(Hit {
                file: file.to_string_lossy().into_owned(),
                line: i + 1,
                text: line.chars().take(200).collect(),
            });
        }
    }

    let mut map = Map::new();
    map.insert(
        "hits".into(),
        Value::Array(
            hits.iter()
                .map(|h| json!({"file": h.file, "line": h.line, "text": h.text}))
                .collect(),
        ),
    );
    map.insert("count".into(), json!(hits.len()));
    map.insert("file_count".into(), json!(files_with_hits));
    map.insert("scanned_files".into(), json!(scanned_files));
    map.insert("truncated".into(), json!(truncated));
    map.insert("limit".into(), json!(limit));
    map
}

fn collect_files(path: &Path, out: &mut Vec<PathBuf>) {
    if path.is_file() {
        out.push(path.to_path_buf());
        return;
    }
    let Ok(entries) = std::fs::read_dir(path) else {
        return;
    };
    for entry in entries.flatten() {
        let entry_path = entry.path();
        let name = entry.file_name();
        if name == ".git" || name == ".sable" {
            continue;
        }
        if entry_path.is_dir() {
            collect_files(&entry_path, out);
        } else {
            out.push(entry_path);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    fn fixture() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "needle one\nplain\nneedle two\n").unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/b.txt"), "needle three\n").unwrap();
        std::fs::write(tmp.path().join("c.txt"), "nothing here\n").unwrap();
        tmp
    }

    #[test]
    fn finds_hits_across_directory() {
        let tmp = fixture();
        let out = search(tmp.path(), "needle", 50);
        assert_eq!(3, out["count"]);
        assert_eq!(2, out["file_count"]);
        assert_eq!(3, out["scanned_files"]);
        assert_eq!(false, out["truncated"]);
    }

    #[test]
    fn limit_truncates_and_flags() {
        let tmp = fixture();
        let out = search(tmp.path(), "needle", 2);
        assert_eq!(2, out["count"]);
        assert_eq!(true, out["truncated"]);
        assert_eq!(2, out["limit"]);
    }

    #[test]
    fn exact_limit_is_not_truncated() {
        let tmp = fixture();
        let out = search(tmp.path(), "needle", 3);
        assert_eq!(3, out["count"]);
        assert_eq!(false, out["truncated"]);
    }

    #[test]
    fn single_file_search() {
        let tmp = fixture();
        let out = search(&tmp.path().join("a.txt"), "needle", 50);
        assert_eq!(2, out["count"]);
        assert_eq!(1, out["file_count"]);
    }
}
