use async_trait::async_trait;
use kestrel::chat::Tool;
use serde_json::{Value, json};

use crate::error::ToolError;
use crate::tools::{ToolCtx, ToolExecutor};

/// Write a file, creating parent directories as needed.
pub struct WriteFileTool;

#[async_trait]
impl ToolExecutor for WriteFileTool {
    fn definition(&self) -> Tool {
        Tool::function(
            "write_file",
            "- Writes content to a file, replacing it if it exists\n\
             - Creates parent directories automatically\n\
             - For small targeted changes prefer edit_file",
            json!({
                "type": "object",
                "properties": {
                    "file_path": {
                        "type": "string",
                        "description": "Destination path, absolute or relative to the working directory"
                    },
                    "content": {
                        "type": "string",
                        "description": "Full content to write"
                    }
                },
                "required": ["file_path", "content"]
            }),
        )
    }

    async fn execute(&self, ctx: &ToolCtx, args: Value) -> Result<Value, ToolError> {
        let path = args
            .get("file_path")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidRequest("file_path is required".to_string()))?;
        let content = args
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidRequest("content is required".to_string()))?;

        ctx.env.write_file(path, content).await?;
        Ok(Value::String(format!("wrote {} bytes to {}", content.len(), path)))
    }
}
