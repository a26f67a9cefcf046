use async_trait::async_trait;
use kestrel::chat::Tool;
use serde_json::{Value, json};

use crate::error::ToolError;
use crate::tools::{ToolCtx, ToolExecutor};

/// Execute a shell command in the working directory.
pub struct ShellTool;

#[async_trait]
impl ToolExecutor for ShellTool {
    fn definition(&self) -> Tool {
        Tool::function(
            "shell",
            "- Executes a shell command and returns stdout, stderr and the exit code\n\
             - Commands run in the session working directory unless working_dir is given\n\
             - Long-running commands are killed at the timeout",
            json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The command to execute"
                    },
                    "timeout_ms": {
                        "type": "integer",
                        "description": "Timeout in milliseconds. Defaults to 120000.",
                        "minimum": 1
                    },
                    "working_dir": {
                        "type": "string",
                        "description": "Directory to run in, relative to the working directory"
                    }
                },
                "required": ["command"]
            }),
        )
    }

    async fn execute(&self, ctx: &ToolCtx, args: Value) -> Result<Value, ToolError> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidRequest("command is required".to_string()))?;
        let timeout_ms = args.get("timeout_ms").and_then(Value::as_u64);
        let working_dir = args.get("working_dir").and_then(Value::as_str);

        let result = ctx
            .env
            .exec_command(&ctx.cancel, command, timeout_ms, working_dir, &[])
            .await?;

        let mut output = String::new();
        if !result.stdout.is_empty() {
            output.push_str(&result.stdout);
        }
        if !result.stderr.is_empty() {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&result.stderr);
        }
        if result.timed_out {
            return Err(ToolError::ExecutionFailed(format!(
                "command timed out after {} ms\n{}",
                result.duration_ms, output
            )));
        }
        if result.exit_code != 0 {
            return Err(ToolError::ExecutionFailed(format!(
                "exit code {}\n{}",
                result.exit_code, output
            )));
        }
        Ok(Value::String(output))
    }
}
