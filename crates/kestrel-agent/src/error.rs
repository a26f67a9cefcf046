use kestrel::error::LLMError;

/// Terminal failures of the session loop.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("session is closed")]
    SessionClosed,
    #[error("turn limit reached ({turns} > {max_turns})")]
    TurnLimit { turns: u64, max_turns: u64 },
    #[error("max tool rounds reached")]
    MaxToolRounds,
    #[error("repeated malformed tool calls detected (repeats={repeats} limit={limit})")]
    RepeatedMalformedToolCalls { repeats: u32, limit: u32 },
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Llm(#[from] LLMError),
}

/// Unified error type for tool execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Session error: {0}")]
    SessionError(String),
    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Failures surfaced by the execution environment.
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

impl From<EnvError> for ToolError {
    fn from(error: EnvError) -> Self {
        match error {
            EnvError::InvalidPath(msg) => ToolError::InvalidRequest(msg),
            EnvError::NotFound(msg) => ToolError::InvalidRequest(msg),
            other => ToolError::ExecutionFailed(other.to_string()),
        }
    }
}
