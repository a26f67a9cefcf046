//! Tool registry: name to executor map with schema validation and
//! per-tool output truncation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kestrel::ToolCall;
use kestrel::chat::{Tool, is_valid_tool_name};
use parking_lot::RwLock;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::env::ExecutionEnv;
use crate::error::ToolError;
use crate::subagent::AgentHandle;
use crate::truncate::{self, LimitOverride, OutputLimit};

pub mod builtins;

/// Everything a tool sees during one execution. Built per call; the
/// registry itself never holds session state.
#[derive(Clone)]
pub struct ToolCtx {
    pub cancel: CancellationToken,
    pub env: Arc<dyn ExecutionEnv>,
    /// Present when the owning session allows sub-agent tools.
    pub agents: Option<Arc<dyn AgentHandle>>,
    /// Session-level truncation overrides keyed by tool name.
    pub output_overrides: Arc<HashMap<String, LimitOverride>>,
}

impl ToolCtx {
    pub fn new(env: Arc<dyn ExecutionEnv>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            env,
            agents: None,
            output_overrides: Arc::new(HashMap::new()),
        }
    }
}

/// A named executor with a JSON-schema input.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// The tool definition advertised to the model.
    fn definition(&self) -> Tool;

    /// Run with validated arguments. String results pass through to the
    /// model verbatim; other values are pretty-printed JSON.
    async fn execute(&self, ctx: &ToolCtx, args: Value) -> Result<Value, ToolError>;
}

/// Outcome of one tool call.
#[derive(Debug, Clone)]
pub struct ToolExecResult {
    pub tool_name: String,
    pub call_id: String,
    /// Possibly truncated string handed back to the model.
    pub output: String,
    /// Untruncated output, preserved for the event stream.
    pub full_output: String,
    pub is_error: bool,
}

struct RegisteredTool {
    definition: Tool,
    schema: jsonschema::Validator,
    executor: Arc<dyn ToolExecutor>,
    limit: OutputLimit,
}

/// Shared, read-mostly tool registry. Executions hold the read lock only
/// for the lookup, never across the executor itself.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<RegisteredTool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register with the tool's default output limit.
    pub fn register(&self, executor: Arc<dyn ToolExecutor>) -> Result<(), ToolError> {
        self.register_with_limit(executor, None)
    }

    /// Register, replacing any prior tool of the same name. The parameters
    /// schema is compiled here so execution only validates.
    pub fn register_with_limit(
        &self,
        executor: Arc<dyn ToolExecutor>,
        limit: Option<OutputLimit>,
    ) -> Result<(), ToolError> {
        let definition = executor.definition();
        let name = definition.function.name.clone();
        if !is_valid_tool_name(&name) {
            return Err(ToolError::InvalidRequest(format!("invalid tool name: {:?}", name)));
        }

        let parameters = if definition.function.parameters.is_null() {
            serde_json::json!({"type": "object", "properties": {}})
        } else {
            definition.function.parameters.clone()
        };
        let schema = jsonschema::validator_for(&parameters).map_err(|err| {
            ToolError::InvalidRequest(format!("invalid parameters schema for {}: {}", name, err))
        })?;

        let limit = limit.unwrap_or_else(|| truncate::default_limit_for(&name));
        let registered = Arc::new(RegisteredTool { definition, schema, executor, limit });
        self.tools.write().insert(name, registered);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> bool {
        self.tools.write().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    /// Advertised definitions, sorted by name for stable prompts.
    pub fn definitions(&self) -> Vec<Tool> {
        let mut definitions: Vec<Tool> =
            self.tools.read().values().map(|t| t.definition.clone()).collect();
        definitions.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        definitions
    }

    /// Execute one call: id synthesis, lookup, argument parse, schema
    /// validation, run, stringify, truncate. Failures become `is_error`
    /// results rather than errors; the model sees them as tool output.
    pub async fn execute_call(&self, ctx: &ToolCtx, call: &ToolCall) -> ToolExecResult {
        let name = call.function.name.clone();
        let arguments = call.function.arguments.as_str();
        let call_id = if call.id.trim().is_empty() {
            synthesize_call_id(arguments)
        } else {
            call.id.clone()
        };

        let registered = { self.tools.read().get(&name).cloned() };
        let Some(registered) = registered else {
            return self.failure(ctx, &name, &call_id, format!("unknown tool: {}", name));
        };

        let parsed: Value = match serde_json::from_str(effective_args(arguments)) {
            Ok(value) => value,
            Err(err) => {
                return self.failure(
                    ctx,
                    &name,
                    &call_id,
                    format!("invalid tool arguments JSON: {}", err),
                );
            }
        };

        if let Err(err) = registered.schema.validate(&parsed) {
            return self.failure(
                ctx,
                &name,
                &call_id,
                format!("tool args schema validation failed: {}", err),
            );
        }

        match registered.executor.execute(ctx, parsed).await {
            Ok(value) => {
                let full_output = stringify(value);
                let output = self.truncated(ctx, &name, &full_output);
                ToolExecResult { tool_name: name, call_id, output, full_output, is_error: false }
            }
            Err(err) => self.failure(ctx, &name, &call_id, err.to_string()),
        }
    }

    fn failure(&self, ctx: &ToolCtx, name: &str, call_id: &str, message: String) -> ToolExecResult {
        let output = self.truncated(ctx, name, &message);
        ToolExecResult {
            tool_name: name.to_string(),
            call_id: call_id.to_string(),
            output,
            full_output: message,
            is_error: true,
        }
    }

    fn truncated(&self, ctx: &ToolCtx, name: &str, output: &str) -> String {
        let base = self
            .tools
            .read()
            .get(name)
            .map(|t| t.limit)
            .unwrap_or_else(|| truncate::default_limit_for(name));
        let limit = match ctx.output_overrides.get(name) {
            Some(over) => base.apply(over),
            None => base,
        };
        truncate::truncate(output, &limit)
    }
}

/// Blank call ids get a stable synthetic one derived from the arguments.
fn synthesize_call_id(arguments: &str) -> String {
    let digest = Sha256::digest(arguments.as_bytes());
    format!("call_{}", hex::encode(&digest[..8]))
}

/// Providers occasionally send no arguments at all for zero-parameter
/// tools; treat that as the empty object rather than a JSON error.
fn effective_args(arguments: &str) -> &str {
    if arguments.trim().is_empty() { "{}" } else { arguments }
}

fn stringify(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string()),
    }
}
