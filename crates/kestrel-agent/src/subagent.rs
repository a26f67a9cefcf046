//! Sub-agent supervision: spawn / send / wait / close nested sessions.
//!
//! Children share the parent's client, profile, environment and tool
//! registry and inherit depth + 1, gated by `max_subagent_depth`. The
//! registry only ever sees the [`AgentHandle`] interface the session hands
//! it per execution; no strong upward references are stored.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use kestrel::chat::Tool;
use log::debug;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;
use crate::session::Session;
use crate::tools::{ToolCtx, ToolExecutor, ToolRegistry};

/// Default wait when `timeout_ms` is omitted.
const DEFAULT_WAIT: Duration = Duration::from_secs(300);

/// The supervision surface sub-agent tools call into.
#[async_trait]
pub trait AgentHandle: Send + Sync {
    /// Spawn a child and feed it `task` as its first input; returns the
    /// child's id without waiting for completion.
    async fn spawn_agent(&self, task: &str) -> Result<String, ToolError>;
    /// Enqueue another input on the child.
    async fn send_input(&self, agent_id: &str, input: &str) -> Result<(), ToolError>;
    /// Block until the child's current input completes, up to the timeout.
    async fn wait(&self, agent_id: &str, timeout_ms: Option<u64>) -> Result<String, ToolError>;
    async fn close_agent(&self, agent_id: &str) -> Result<(), ToolError>;
}

struct ChildAgent {
    session: Arc<Session>,
    cancel: CancellationToken,
}

/// Owns a session's children. Closing the parent closes every child.
#[derive(Default)]
pub struct SubAgentSupervisor {
    children: Mutex<HashMap<String, ChildAgent>>,
}

impl SubAgentSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, agent_id: &str) -> Option<Arc<Session>> {
        self.children.lock().get(agent_id).map(|c| c.session.clone())
    }

    pub async fn close_all(&self) {
        let drained: Vec<ChildAgent> = self.children.lock().drain().map(|(_, c)| c).collect();
        for child in drained {
            child.cancel.cancel();
            Box::pin(child.session.close()).await;
        }
    }
}

impl Session {
    /// The handle this session hands to the registry for each execution.
    pub(crate) fn agent_handle(&self) -> Option<Arc<dyn AgentHandle>> {
        let weak = self.self_weak.clone();
        Some(Arc::new(SessionAgents { session: weak }))
    }

    async fn spawn_child(&self, task: &str) -> Result<String, ToolError> {
        let config = self.config.lock().clone();
        let child_depth = self.depth + 1;
        if child_depth > config.max_subagent_depth {
            return Err(ToolError::InvalidRequest(format!(
                "sub-agent depth limit exceeded (depth {} > max {})",
                child_depth, config.max_subagent_depth
            )));
        }

        let child = Session::with_depth(
            config,
            self.profile.clone(),
            self.env.clone(),
            self.client.clone(),
            self.registry.clone(),
            child_depth,
        )
        .await;
        let agent_id = child.id().to_string();
        debug!("session {} spawned sub-agent {}", self.id(), agent_id);

        // Forward child events into the parent's channel; session ids keep
        // them apart for consumers.
        if let (Some(mut child_events), Some(parent_tx)) =
            (child.take_events(), self.event_sender())
        {
            tokio::spawn(async move {
                while let Some(event) = child_events.recv().await {
                    if parent_tx.send(event).await.is_err() {
                        return;
                    }
                }
            });
        }

        let cancel = CancellationToken::new();
        self.supervisor
            .children
            .lock()
            .insert(agent_id.clone(), ChildAgent { session: child.clone(), cancel: cancel.clone() });

        // Mark busy before the task is scheduled so an immediate wait()
        // blocks instead of observing a not-yet-started child.
        child.mark_processing(true);
        let first_input = task.to_string();
        tokio::spawn(async move {
            let _ = child.process_input(&cancel, &first_input).await;
        });

        Ok(agent_id)
    }

    async fn child_send_input(&self, agent_id: &str, input: &str) -> Result<(), ToolError> {
        let child = self
            .supervisor
            .get(agent_id)
            .ok_or_else(|| ToolError::InvalidRequest(format!("unknown agent: {}", agent_id)))?;
        if child.is_closed() {
            return Err(ToolError::SessionError(format!("agent {} is closed", agent_id)));
        }
        if child.is_processing() {
            child.follow_up(input);
            return Ok(());
        }
        // Idle child: start a fresh input.
        let cancel = self
            .supervisor
            .children
            .lock()
            .get(agent_id)
            .map(|c| c.cancel.clone())
            .unwrap_or_default();
        child.mark_processing(true);
        let input = input.to_string();
        tokio::spawn(async move {
            let _ = child.process_input(&cancel, &input).await;
        });
        Ok(())
    }

    async fn child_wait(&self, agent_id: &str, timeout_ms: Option<u64>) -> Result<String, ToolError> {
        let child = self
            .supervisor
            .get(agent_id)
            .ok_or_else(|| ToolError::InvalidRequest(format!("unknown agent: {}", agent_id)))?;
        let timeout = timeout_ms.map(Duration::from_millis).unwrap_or(DEFAULT_WAIT);
        child
            .wait_idle(timeout)
            .await
            .ok_or_else(|| ToolError::ExecutionFailed(format!("wait timed out after {:?}", timeout)))
    }

    async fn child_close(&self, agent_id: &str) -> Result<(), ToolError> {
        let child = self.supervisor.children.lock().remove(agent_id);
        let Some(child) = child else {
            return Err(ToolError::InvalidRequest(format!("unknown agent: {}", agent_id)));
        };
        child.cancel.cancel();
        child.session.close().await;
        Ok(())
    }
}

/// Weak bridge from tool executions back to the owning session.
struct SessionAgents {
    session: Weak<Session>,
}

impl SessionAgents {
    fn session(&self) -> Result<Arc<Session>, ToolError> {
        self.session
            .upgrade()
            .ok_or_else(|| ToolError::SessionError("session is gone".to_string()))
    }
}

#[async_trait]
impl AgentHandle for SessionAgents {
    async fn spawn_agent(&self, task: &str) -> Result<String, ToolError> {
        self.session()?.spawn_child(task).await
    }

    async fn send_input(&self, agent_id: &str, input: &str) -> Result<(), ToolError> {
        self.session()?.child_send_input(agent_id, input).await
    }

    async fn wait(&self, agent_id: &str, timeout_ms: Option<u64>) -> Result<String, ToolError> {
        self.session()?.child_wait(agent_id, timeout_ms).await
    }

    async fn close_agent(&self, agent_id: &str) -> Result<(), ToolError> {
        self.session()?.child_close(agent_id).await
    }
}

fn handle(ctx: &ToolCtx) -> Result<&Arc<dyn AgentHandle>, ToolError> {
    ctx.agents
        .as_ref()
        .ok_or_else(|| ToolError::SessionError("sub-agents are not available here".to_string()))
}

/// Register the four sub-agent tools.
pub fn register_subagent_tools(registry: &ToolRegistry) -> Result<(), ToolError> {
    registry.register(Arc::new(SpawnAgentTool))?;
    registry.register(Arc::new(SendInputTool))?;
    registry.register(Arc::new(WaitTool))?;
    registry.register(Arc::new(CloseAgentTool))?;
    Ok(())
}

/// Spawn a nested agent working on a task.
pub struct SpawnAgentTool;

#[async_trait]
impl ToolExecutor for SpawnAgentTool {
    fn definition(&self) -> Tool {
        Tool::function(
            "spawn_agent",
            "- Spawns a sub-agent that starts working on the given task\n\
             - Returns the agent id immediately; pair with wait to collect the result\n\
             - Sub-agents share your tools and working directory",
            json!({
                "type": "object",
                "properties": {
                    "task": {
                        "type": "string",
                        "description": "The task the sub-agent should carry out"
                    }
                },
                "required": ["task"]
            }),
        )
    }

    async fn execute(&self, ctx: &ToolCtx, args: Value) -> Result<Value, ToolError> {
        let task = args
            .get("task")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidRequest("task is required".to_string()))?;
        let agent_id = handle(ctx)?.spawn_agent(task).await?;
        Ok(json!({"agent_id": agent_id, "status": "running"}))
    }
}

/// Queue another input on a sub-agent.
pub struct SendInputTool;

#[async_trait]
impl ToolExecutor for SendInputTool {
    fn definition(&self) -> Tool {
        Tool::function(
            "send_input",
            "- Sends a follow-up input to a running sub-agent",
            json!({
                "type": "object",
                "properties": {
                    "agent_id": {"type": "string"},
                    "input": {"type": "string"}
                },
                "required": ["agent_id", "input"]
            }),
        )
    }

    async fn execute(&self, ctx: &ToolCtx, args: Value) -> Result<Value, ToolError> {
        let agent_id = args
            .get("agent_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidRequest("agent_id is required".to_string()))?;
        let input = args
            .get("input")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidRequest("input is required".to_string()))?;
        handle(ctx)?.send_input(agent_id, input).await?;
        Ok(json!({"agent_id": agent_id, "status": "queued"}))
    }
}

/// Wait for a sub-agent's current input to complete.
pub struct WaitTool;

#[async_trait]
impl ToolExecutor for WaitTool {
    fn definition(&self) -> Tool {
        Tool::function(
            "wait",
            "- Waits for a sub-agent to finish its current input\n\
             - Returns the agent's latest assistant output",
            json!({
                "type": "object",
                "properties": {
                    "agent_id": {"type": "string"},
                    "timeout_ms": {
                        "type": "integer",
                        "description": "How long to wait. Defaults to 300000.",
                        "minimum": 1
                    }
                },
                "required": ["agent_id"]
            }),
        )
    }

    async fn execute(&self, ctx: &ToolCtx, args: Value) -> Result<Value, ToolError> {
        let agent_id = args
            .get("agent_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidRequest("agent_id is required".to_string()))?;
        let timeout_ms = args.get("timeout_ms").and_then(Value::as_u64);
        let output = handle(ctx)?.wait(agent_id, timeout_ms).await?;
        Ok(Value::String(output))
    }
}

/// Close a sub-agent.
pub struct CloseAgentTool;

#[async_trait]
impl ToolExecutor for CloseAgentTool {
    fn definition(&self) -> Tool {
        Tool::function(
            "close_agent",
            "- Closes a sub-agent and discards its session",
            json!({
                "type": "object",
                "properties": {
                    "agent_id": {"type": "string"}
                },
                "required": ["agent_id"]
            }),
        )
    }

    async fn execute(&self, ctx: &ToolCtx, args: Value) -> Result<Value, ToolError> {
        let agent_id = args
            .get("agent_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidRequest("agent_id is required".to_string()))?;
        handle(ctx)?.close_agent(agent_id).await?;
        Ok(json!({"agent_id": agent_id, "status": "closed"}))
    }
}
