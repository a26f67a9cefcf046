use std::collections::HashMap;

use kestrel::chat::ReasoningEffort;
use kestrel::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::truncate::LimitOverride;

/// A project documentation file injected into the system prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDoc {
    pub path: String,
    pub content: String,
}

/// Per-session policy knobs. Everything has a default; embedders override
/// what they need.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Hard cap on rounds within one input.
    pub max_tool_rounds_per_input: usize,
    /// Session-lifetime cap on LLM calls; 0 disables the limit.
    pub max_turns: u64,
    pub loop_detection: bool,
    /// Identical consecutive rounds before steering is injected.
    pub loop_detection_window: u32,
    /// Identical consecutive malformed rounds before the input aborts.
    pub repeated_malformed_tool_call_limit: u32,
    pub retry: RetryPolicy,
    /// Per-tool truncation overrides keyed by tool name.
    pub tool_output_limits: HashMap<String, LimitOverride>,
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Forwarded verbatim on every request.
    pub provider_options: HashMap<String, Value>,
    /// Appended after everything else in the system prompt.
    pub user_instruction_override: Option<String>,
    pub max_subagent_depth: usize,
    pub project_docs: Vec<ProjectDoc>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds_per_input: 200,
            max_turns: 0,
            loop_detection: true,
            loop_detection_window: 10,
            repeated_malformed_tool_call_limit: 3,
            retry: RetryPolicy::default(),
            tool_output_limits: HashMap::new(),
            reasoning_effort: None,
            provider_options: HashMap::new(),
            user_instruction_override: None,
            max_subagent_depth: 1,
            project_docs: Vec::new(),
            temperature: None,
            top_p: None,
            max_tokens: None,
        }
    }
}
