use async_trait::async_trait;
use kestrel::chat::Tool;
use serde_json::{Value, json};

use crate::error::ToolError;
use crate::tools::{ToolCtx, ToolExecutor};

/// Regex content search across the working tree.
pub struct GrepTool;

#[async_trait]
impl ToolExecutor for GrepTool {
    fn definition(&self) -> Tool {
        Tool::function(
            "grep",
            "- Searches file contents with a regular expression\n\
             - Returns path:line:text matches\n\
             - Narrow with glob_filter (e.g. \"*.rs\") when the tree is large",
            json!({
                "type": "object",
                "properties": {
                    "pattern": {
                        "type": "string",
                        "description": "Regular expression to search for"
                    },
                    "path": {
                        "type": "string",
                        "description": "Directory or file to search. Defaults to the working directory."
                    },
                    "glob_filter": {
                        "type": "string",
                        "description": "Only search files matching this glob"
                    },
                    "case_insensitive": {
                        "type": "boolean",
                        "default": false
                    },
                    "max_results": {
                        "type": "integer",
                        "description": "Maximum matches to return. Defaults to 100.",
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
        let path = args.get("path").and_then(Value::as_str).unwrap_or("");
        let glob_filter = args.get("glob_filter").and_then(Value::as_str);
        let case_insensitive =
            args.get("case_insensitive").and_then(Value::as_bool).unwrap_or(false);
        let max_results = args.get("max_results").and_then(Value::as_u64).unwrap_or(100) as usize;

        let matches = ctx
            .env
            .grep(pattern, path, glob_filter, case_insensitive, max_results)
            .await?;

        if matches.is_empty() {
            return Ok(Value::String("no matches".to_string()));
        }
        let lines: Vec<String> = matches
            .iter()
            .map(|m| format!("{}:{}:{}", m.path, m.line_number, m.line))
            .collect();
        Ok(Value::String(lines.join("\n")))
    }
}
