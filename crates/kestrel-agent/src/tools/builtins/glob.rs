use async_trait::async_trait;
use kestrel::chat::Tool;
use serde_json::{Value, json};

use crate::error::ToolError;
use crate::tools::{ToolCtx, ToolExecutor};

/// Fast file pattern matching tool.
pub struct GlobTool;

#[async_trait]
impl ToolExecutor for GlobTool {
    fn definition(&self) -> Tool {
        Tool::function(
            "glob",
            "- Fast file pattern matching tool that works with any codebase size\n\
             - Supports glob patterns like \"**/*.rs\" or \"src/**/*.ts\"\n\
             - Returns matching file paths sorted by modification time\n\
             - Use this tool when you need to find files by name patterns",
            json!({
                "type": "object",
                "properties": {
                    "pattern": {
                        "type": "string",
                        "description": "The glob pattern to match files against (e.g., \"**/*.rs\")"
                    },
                    "path": {
                        "type": "string",
                        "description": "The directory to search in. Defaults to the working directory."
                    },
                    "limit": {
                        "type": "integer",
                        "description": "Maximum number of results to return. Defaults to 100.",
                        "minimum": 1
                    }
                },
                "required": ["pattern"]
            }),
        )
    }

    async fn execute(&self, ctx: &ToolCtx, args: Value) -> Result<Value, ToolError> {
        let pattern = args
            .get("pattern")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidRequest("pattern is required".to_string()))?;
        let base = args.get("path").and_then(Value::as_str).unwrap_or("");
        let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(100) as usize;

        let mut matches = ctx.env.glob(pattern, base).await?;
        let truncated = matches.len() > limit;
        matches.truncate(limit);

        let mut output = matches.join("\n");
        if truncated {
            output.push_str(&format!(
                "\n\n[Results limited to {}. Refine your pattern to see more specific matches.]",
                limit
            ));
        }
        if output.is_empty() {
            output = "no files matched".to_string();
        }
        Ok(Value::String(output))
    }
}
