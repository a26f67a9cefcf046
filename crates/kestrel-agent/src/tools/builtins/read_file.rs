use async_trait::async_trait;
use kestrel::chat::Tool;
use serde_json::{Value, json};

use crate::error::ToolError;
use crate::tools::{ToolCtx, ToolExecutor};

/// Read a file from the environment, optionally a line window.
pub struct ReadFileTool;

#[async_trait]
impl ToolExecutor for ReadFileTool {
    fn definition(&self) -> Tool {
        Tool::function(
            "read_file",
            "- Reads a file from the working tree\n\
             - Pass offset/limit to read a window of lines from large files\n\
             - Prefer reading whole files when they are small",
            json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "File path, absolute or relative to the working directory"
                    },
                    "offset": {
                        "type": "integer",
                        "description": "0-based line to start reading from",
                        "minimum": 0
                    },
                    "limit": {
                        "type": "integer",
                        "description": "Maximum number of lines to read",
                        "minimum": 1
                    }
                },
                "required": ["path"]
            }),
        )
    }

    async fn execute(&self, ctx: &ToolCtx, args: Value) -> Result<Value, ToolError> {
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidRequest("path is required".to_string()))?;
        let offset = args.get("offset").and_then(Value::as_u64).map(|v| v as usize);
        let limit = args.get("limit").and_then(Value::as_u64).map(|v| v as usize);

        let content = ctx.env.read_file(path, offset, limit).await?;
        Ok(Value::String(content))
    }
}
