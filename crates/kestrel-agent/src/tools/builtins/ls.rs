use async_trait::async_trait;
use kestrel::chat::Tool;
use serde_json::{Value, json};

use crate::error::ToolError;
use crate::tools::{ToolCtx, ToolExecutor};

/// List directory entries; directories carry a trailing slash.
pub struct LsTool;

#[async_trait]
impl ToolExecutor for LsTool {
    fn definition(&self) -> Tool {
        Tool::function(
            "ls",
            "- Lists files and directories under a path\n\
             - Directories end with a trailing slash\n\
             - Increase depth to descend into subdirectories",
            json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Directory to list. Defaults to the working directory."
                    },
                    "depth": {
                        "type": "integer",
                        "description": "How many levels to descend. Defaults to 1.",
                        "minimum": 1
                    }
                }
            }),
        )
    }

    async fn execute(&self, ctx: &ToolCtx, args: Value) -> Result<Value, ToolError> {
        let path = args.get("path").and_then(Value::as_str).unwrap_or("");
        let depth = args.get("depth").and_then(Value::as_u64).unwrap_or(1) as usize;

        let entries = ctx.env.list_directory(path, depth).await?;
        if entries.is_empty() {
            return Ok(Value::String("empty directory".to_string()));
        }
        Ok(Value::String(entries.join("\n")))
    }
}
