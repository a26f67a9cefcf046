use async_trait::async_trait;
use kestrel::chat::Tool;
use serde_json::{Value, json};

use crate::error::ToolError;
use crate::tools::{ToolCtx, ToolExecutor};

/// Exact string replacement in a single file.
pub struct EditFileTool;

#[async_trait]
impl ToolExecutor for EditFileTool {
    fn definition(&self) -> Tool {
        Tool::function(
            "edit_file",
            "- Replaces an exact string in a file\n\
             - The old string must match exactly, including whitespace\n\
             - Fails when the old string is ambiguous unless replace_all is set",
            json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "File path, absolute or relative to the working directory"
                    },
                    "old": {
                        "type": "string",
                        "description": "Exact text to replace"
                    },
                    "new": {
                        "type": "string",
                        "description": "Replacement text"
                    },
                    "replace_all": {
                        "type": "boolean",
                        "description": "Replace every occurrence instead of requiring a unique match",
                        "default": false
                    }
                },
                "required": ["path", "old", "new"]
            }),
        )
    }

    async fn execute(&self, ctx: &ToolCtx, args: Value) -> Result<Value, ToolError> {
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidRequest("path is required".to_string()))?;
        let old = args
            .get("old")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidRequest("old is required".to_string()))?;
        let new = args
            .get("new")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidRequest("new is required".to_string()))?;
        let replace_all = args.get("replace_all").and_then(Value::as_bool).unwrap_or(false);

        let replaced = ctx.env.edit_file(path, old, new, replace_all).await?;
        Ok(Value::String(format!("replaced {} occurrence(s) in {}", replaced, path)))
    }
}
