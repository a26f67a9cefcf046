//! The canonical, provider-independent chat model.
//!
//! Adapters translate between these shapes and their wire dialects. The
//! invariant that matters most: a [`ChatResponse`] reconstructed from an
//! aggregated stream is content-equivalent to what the unary call would
//! have returned for the same server reply.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::LLMError;
use crate::stream::ChatStream;
use crate::{ToolCall, Usage};

pub mod accumulator;

/// Role of a participant in a chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    /// Platform-level instructions
    System,
    /// Application-level instructions, merged with system by most dialects
    Developer,
    /// The human participant
    User,
    /// The model
    Assistant,
    /// A tool result addressed back to the model
    Tool,
}

/// An image payload: remote URL, local path, or raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    /// An http(s) URL, forwarded as-is where the dialect allows it.
    Url(String),
    /// A filesystem path; adapters read and inline it as base64.
    Path(String),
    /// Raw bytes with an explicit media type, inlined as base64.
    Inline { data: Vec<u8>, media_type: String },
}

/// A thinking/reasoning block attributed to the assistant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Thinking {
    pub text: String,
    /// Provider signature for replay (Anthropic).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// True for opaque redacted thinking payloads.
    #[serde(default)]
    pub redacted: bool,
}

/// The result of a tool call, addressed by the call id it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    /// String or arbitrary JSON-serializable value.
    pub content: Value,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    /// Render the content the way it is sent to providers: strings pass
    /// through, everything else is serialized as JSON.
    pub fn content_string(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// One typed part of a message's ordered content list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { source: ImageSource },
    Audio { data: Vec<u8>, media_type: String },
    Document { data: Vec<u8>, media_type: String },
    ToolCall { call: ToolCall },
    ToolResult { result: ToolResult },
    Thinking { thinking: Thinking },
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Vec<ContentPart>,
}

impl ChatMessage {
    pub fn new(role: ChatRole) -> Self {
        Self { role, content: Vec::new() }
    }

    /// Create a new builder for a system message
    pub fn system() -> ChatMessageBuilder {
        ChatMessageBuilder::new(ChatRole::System)
    }

    /// Create a new builder for a developer message
    pub fn developer() -> ChatMessageBuilder {
        ChatMessageBuilder::new(ChatRole::Developer)
    }

    /// Create a new builder for a user message
    pub fn user() -> ChatMessageBuilder {
        ChatMessageBuilder::new(ChatRole::User)
    }

    /// Create a new builder for an assistant message
    pub fn assistant() -> ChatMessageBuilder {
        ChatMessageBuilder::new(ChatRole::Assistant)
    }

    /// A complete tool message answering `tool_call_id`.
    pub fn tool_result_named(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<Value>,
        is_error: bool,
    ) -> Self {
        Self {
            role: ChatRole::Tool,
            content: vec![ContentPart::ToolResult {
                result: ToolResult {
                    tool_call_id: tool_call_id.into(),
                    name: name.into(),
                    content: content.into(),
                    is_error,
                },
            }],
        }
    }

    /// All text parts concatenated.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.content {
            if let ContentPart::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }

    /// All thinking parts concatenated.
    pub fn thinking_text(&self) -> String {
        let mut out = String::new();
        for part in &self.content {
            if let ContentPart::Thinking { thinking } = part {
                out.push_str(&thinking.text);
            }
        }
        out
    }

    /// Tool calls carried by this message, in content order.
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::ToolCall { call } => Some(call),
                _ => None,
            })
            .collect()
    }

    /// Tool results carried by this message, in content order.
    pub fn tool_results(&self) -> Vec<&ToolResult> {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::ToolResult { result } => Some(result),
                _ => None,
            })
            .collect()
    }

    /// Rough character weight of this message, used for context estimates.
    pub fn approx_chars(&self) -> usize {
        self.content
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => text.len(),
                ContentPart::Thinking { thinking } => thinking.text.len(),
                ContentPart::ToolCall { call } => {
                    call.function.name.len() + call.function.arguments.len()
                }
                ContentPart::ToolResult { result } => result.content_string().len(),
                ContentPart::Image { .. } => 0,
                ContentPart::Audio { data, .. } | ContentPart::Document { data, .. } => data.len(),
            })
            .sum()
    }
}

/// Builder for ChatMessage
#[derive(Debug)]
pub struct ChatMessageBuilder {
    role: ChatRole,
    content: Vec<ContentPart>,
}

impl ChatMessageBuilder {
    pub fn new(role: ChatRole) -> Self {
        Self { role, content: Vec::new() }
    }

    /// Append a text part
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.content.push(ContentPart::Text { text: text.into() });
        self
    }

    /// Append an image by URL
    pub fn image_url(mut self, url: impl Into<String>) -> Self {
        self.content.push(ContentPart::Image { source: ImageSource::Url(url.into()) });
        self
    }

    /// Append an image from a local path
    pub fn image_path(mut self, path: impl Into<String>) -> Self {
        self.content.push(ContentPart::Image { source: ImageSource::Path(path.into()) });
        self
    }

    /// Append inline image bytes
    pub fn image_bytes(mut self, data: Vec<u8>, media_type: impl Into<String>) -> Self {
        self.content.push(ContentPart::Image {
            source: ImageSource::Inline { data, media_type: media_type.into() },
        });
        self
    }

    /// Append a tool call
    pub fn tool_call(mut self, call: ToolCall) -> Self {
        self.content.push(ContentPart::ToolCall { call });
        self
    }

    /// Append a thinking block
    pub fn thinking(mut self, thinking: Thinking) -> Self {
        self.content.push(ContentPart::Thinking { thinking });
        self
    }

    /// Build the ChatMessage
    pub fn build(self) -> ChatMessage {
        ChatMessage { role: self.role, content: self.content }
    }
}

/// Represents a function definition for a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionTool {
    /// The name of the function
    pub name: String,
    /// Description of what the function does
    pub description: String,
    /// JSON Schema for the function's parameters
    pub parameters: Value,
}

/// Represents a tool that can be used in chat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    /// The type of tool (e.g. "function")
    #[serde(rename = "type")]
    pub tool_type: String,
    /// The function definition if this is a function tool
    pub function: FunctionTool,
}

impl Tool {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionTool {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Tool choice determines how the LLM uses available tools.
/// The behavior is standardized across different LLM providers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// Model can use any tool, but it must use at least one.
    Any,
    /// Model can use any tool, and may elect to use none.
    #[default]
    Auto,
    /// Model must use the named tool and only that tool.
    Tool(String),
    /// Explicitly disables the use of tools.
    None,
}

/// The reasoning effort requested from reasoning-capable models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl fmt::Display for ReasoningEffort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReasoningEffort::Low => write!(f, "low"),
            ReasoningEffort::Medium => write!(f, "medium"),
            ReasoningEffort::High => write!(f, "high"),
        }
    }
}

/// Structured-output request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Any valid JSON object.
    Json,
    /// JSON conforming to the given schema.
    JsonSchema { schema: Value },
}

/// A provider-independent chat request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Canonical provider key; empty means the client's first registered.
    #[serde(default)]
    pub provider: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    /// Provider-specific knobs keyed by canonical provider name. Adapters
    /// merge their own sub-map into the wire body; reserved keys like
    /// `auto_cache` are consumed rather than forwarded.
    #[serde(default)]
    pub provider_options: HashMap<String, Value>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Default::default()
        }
    }

    /// The adapter's sub-map of provider options, if present.
    pub fn options_for(&self, provider: &str) -> Option<&Value> {
        self.provider_options.get(provider)
    }

    /// Request invariants: non-empty messages, unique syntactically valid
    /// tool names.
    pub fn validate(&self) -> Result<(), LLMError> {
        if self.messages.is_empty() {
            return Err(LLMError::configuration(
                self.provider.clone(),
                "request must contain at least one message",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for tool in &self.tools {
            let name = &tool.function.name;
            if !is_valid_tool_name(name) {
                return Err(LLMError::configuration(
                    self.provider.clone(),
                    format!("invalid tool name: {:?}", name),
                ));
            }
            if !seen.insert(name.as_str()) {
                return Err(LLMError::configuration(
                    self.provider.clone(),
                    format!("duplicate tool name: {:?}", name),
                ));
            }
        }
        Ok(())
    }
}

/// Tool names: 1..=64 chars of `[A-Za-z0-9_-]`.
pub fn is_valid_tool_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Why the model stopped producing output.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Other,
}

/// A provider-independent chat response. The message role is always
/// assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub provider: String,
    pub model: String,
    pub message: ChatMessage,
    pub finish_reason: FinishReason,
    /// The provider's own finish/stop reason string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason_raw: Option<String>,
    pub usage: Usage,
    /// Raw provider payload (unary) or last structural frame (streaming).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl ChatResponse {
    pub fn text(&self) -> String {
        self.message.text()
    }

    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.message.tool_calls()
    }

    pub fn thinking(&self) -> String {
        self.message.thinking_text()
    }
}

impl fmt::Display for ChatResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text())
    }
}

/// One semantic event on the unified stream.
///
/// Invariants: every `TextStart` is closed by exactly one `TextEnd` with
/// the same id (likewise reasoning and tool-call ids); `Finish` terminates
/// the happy path and carries a complete response equivalent to the unary
/// result. Errors travel as the `Err` arm of the stream item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    StreamStart,
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    ReasoningStart {
        id: String,
    },
    ReasoningDelta {
        id: String,
        delta: String,
    },
    ReasoningEnd {
        id: String,
    },
    ToolCallStart {
        id: String,
        name: String,
        call_type: String,
    },
    /// Carries the accumulated argument buffer, not the increment.
    ToolCallDelta {
        id: String,
        name: String,
        arguments: String,
    },
    ToolCallEnd {
        id: String,
        name: String,
        arguments: String,
    },
    StepFinish {
        finish_reason: FinishReason,
    },
    Finish {
        finish_reason: FinishReason,
        usage: Usage,
        response: Box<ChatResponse>,
    },
    /// Raw provider frame passed through for observability. May be dropped
    /// under consumer lag.
    ProviderEvent {
        raw: Value,
    },
}

/// Unified provider trait: one unary call, one streaming call.
///
/// Cancellation arrives via the token; adapters abort in-flight HTTP work
/// and surface a `stream` error variant when it fires.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Canonical provider key, e.g. `"anthropic"`.
    fn name(&self) -> &str;

    /// Unary chat interaction.
    async fn complete(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
    ) -> Result<ChatResponse, LLMError>;

    /// Streaming chat interaction.
    async fn stream(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
    ) -> Result<ChatStream, LLMError>;
}
