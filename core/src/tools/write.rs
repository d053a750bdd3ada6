//! WRITE: full-file replacement.

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

pub(crate) fn tool() -> Tool {
    Tool::new(
        "WRITE",
        "Replace the entire contents of a file, creating it (and parent directories) if needed.",
        object_schema(
            json!({
                "path": {"type": "string", "description": "File to write"},
                "content": {"type": "string", "description": "Full new contents"},
            }),
            &["path", "content"],
        ),
        Capability::Mutating,
        Arc::new(WriteHandler),
    )
}

#[derive(Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
}

struct WriteHandler;

#[async_trait]
impl ToolHandler for WriteHandler {
    async fn run(
        &self,
        ctx: &ToolContext,
        args: Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let args: WriteArgs = serde_json::from_value(Value::Object(args))?;
        let path = ctx.resolve(&args.path);
        let created = !path.exists();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &args.content)?;

        let mut map = Map::new();
        map.insert("path".into(), json!(args.path));
        map.insert("created".into(), json!(created));
        map.insert("bytes_written".into(), json!(args.content.len()));
        map.insert("line_count".into(), json!(args.content.lines().count()));
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn creates_file_and_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(tmp.path().to_path_buf());
        let args = json!({"path": "nested/dir/out.txt", "content": "one\ntwo\n"})
            .as_object()
            .unwrap()
            .clone();

        let out = WriteHandler.run(&ctx, args).await.unwrap();
        assert_eq!(true, out["created"]);
        assert_eq!(8, out["bytes_written"]);
        assert_eq!(2, out["line_count"]);
        assert_eq!(
            "one\ntwo\n",
            std::fs::read_to_string(tmp.path().join("nested/dir/out.txt")).unwrap()
        );
    }

    #[tokio::test]
    async fn overwrite_reports_not_created() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("f.txt"), "old").unwrap();
        let ctx = ToolContext::new(tmp.path().to_path_buf());
        let args = json!({"path": "f.txt", "content": "new"})
            .as_object()
            .unwrap()
            .clone();

        let out = WriteHandler.run(&ctx, args).await.unwrap();
        assert_eq!(false, out["created"]);
        assert_eq!("new", std::fs::read_to_string(tmp.path().join("f.txt")).unwrap());
    }
}
