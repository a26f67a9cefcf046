//! Anthropic Messages API adapter.
//!
//! Also carries providers that speak the Messages dialect with different
//! execution policies; the Kimi profile forces streaming with a large
//! `max_tokens` floor and reduces unary calls through the accumulator.

use std::collections::BTreeMap;
use std::ops::ControlFlow;

use async_trait::async_trait;
use futures::StreamExt;
use log::debug;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use crate::chat::accumulator::StreamAccumulator;
use crate::chat::{
    ChatMessage, ChatProvider, ChatRequest, ChatResponse, ChatRole, ContentPart, FinishReason,
    ImageSource, ResponseFormat, StreamEvent, Thinking, ToolChoice,
};
use crate::error::LLMError;
use crate::providers::{self, SseDecoder};
use crate::sse::SseEvent;
use crate::stream::{ChatStream, StreamSender};
use crate::{ToolCall, Usage};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const PROMPT_CACHING_BETA: &str = "prompt-caching-2024-07-31";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const FORCED_STREAM_MIN_TOKENS: u32 = 16000;

/// Configuration for a Messages-dialect adapter.
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    /// Overrides `https://api.anthropic.com/v1`; trailing slashes stripped.
    pub base_url: Option<String>,
}

/// Client for the Anthropic Messages API.
pub struct AnthropicMessages {
    provider: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
    /// Unary calls are implemented by driving the stream; `max_tokens`
    /// gets a 16k floor.
    force_streaming: bool,
}

impl AnthropicMessages {
    pub fn new(config: AnthropicConfig) -> Self {
        Self::with_provider("anthropic", config, false)
    }

    /// The Kimi provider speaks the Messages dialect but requires
    /// streaming even for unary calls.
    pub fn kimi(config: AnthropicConfig) -> Self {
        Self::with_provider("kimi", config, true)
    }

    fn with_provider(provider: &str, config: AnthropicConfig, force_streaming: bool) -> Self {
        Self {
            provider: provider.to_string(),
            api_key: config.api_key,
            base_url: providers::normalize_base_url(
                config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL),
            ),
            client: reqwest::Client::new(),
            force_streaming,
        }
    }

    fn auto_cache_enabled(&self, request: &ChatRequest) -> bool {
        let default = self.provider == "anthropic";
        request
            .options_for(&self.provider)
            .and_then(|opts| opts.get("auto_cache"))
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    fn request(&self, body: &Value, beta_headers: &[String]) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION);
        for beta in beta_headers {
            builder = builder.header("anthropic-beta", beta);
        }
        builder.json(body)
    }

    fn build_body(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<(Value, Vec<String>), LLMError> {
        let mut system_parts = Vec::new();
        let mut messages: Vec<Value> = Vec::new();

        for message in &request.messages {
            match message.role {
                ChatRole::System | ChatRole::Developer => {
                    let text = message.text();
                    if !text.is_empty() {
                        system_parts.push(text);
                    }
                }
                ChatRole::User => {
                    push_merged(&mut messages, "user", self.user_blocks(message)?);
                }
                ChatRole::Assistant => {
                    push_merged(&mut messages, "assistant", assistant_blocks(message));
                }
                ChatRole::Tool => {
                    let blocks: Vec<Value> = message
                        .tool_results()
                        .into_iter()
                        .map(|result| {
                            json!({
                                "type": "tool_result",
                                "tool_use_id": result.tool_call_id,
                                "content": result.content_string(),
                                "is_error": result.is_error,
                            })
                        })
                        .collect();
                    push_merged(&mut messages, "user", blocks);
                }
            }
        }

        let mut system = system_parts.join("\n\n");
        match &request.response_format {
            Some(ResponseFormat::Json) => {
                system.push_str("\n\nRespond with a single valid JSON object and nothing else.");
            }
            Some(ResponseFormat::JsonSchema { schema }) => {
                system.push_str(&format!(
                    "\n\nRespond with a single JSON object conforming to this schema and nothing else:\n{}",
                    schema
                ));
            }
            None => {}
        }

        let mut max_tokens = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        if self.force_streaming {
            max_tokens = max_tokens.max(FORCED_STREAM_MIN_TOKENS);
        }

        let mut body = json!({
            "model": normalize_model_id(&request.model),
            "max_tokens": max_tokens,
            "messages": messages,
            "stream": stream,
        });
        let obj = body.as_object_mut().unwrap();

        if !system.is_empty() {
            obj.insert("system".into(), Value::String(system));
        }
        // `ToolChoice::None` omits the toolset entirely.
        let tools_disabled = request.tool_choice == Some(ToolChoice::None);
        if !request.tools.is_empty() && !tools_disabled {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.function.name,
                        "description": tool.function.description,
                        "input_schema": tool.function.parameters,
                    })
                })
                .collect();
            obj.insert("tools".into(), Value::Array(tools));
            match &request.tool_choice {
                Some(ToolChoice::Auto) | None => {
                    obj.insert("tool_choice".into(), json!({"type": "auto"}));
                }
                Some(ToolChoice::Any) => {
                    obj.insert("tool_choice".into(), json!({"type": "any"}));
                }
                Some(ToolChoice::Tool(name)) => {
                    obj.insert("tool_choice".into(), json!({"type": "tool", "name": name}));
                }
                Some(ToolChoice::None) => unreachable!(),
            }
        }
        if let Some(temperature) = request.temperature {
            obj.insert("temperature".into(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            obj.insert("top_p".into(), json!(top_p));
        }
        if !request.stop_sequences.is_empty() {
            obj.insert("stop_sequences".into(), json!(request.stop_sequences));
        }

        let mut beta_headers = Vec::new();
        if let Some(Value::Object(options)) = request.options_for(&self.provider) {
            for (key, value) in options {
                match key.as_str() {
                    // Consumed, never forwarded.
                    "auto_cache" => {}
                    "beta_headers" => {
                        if let Value::Array(list) = value {
                            beta_headers.extend(
                                list.iter().filter_map(Value::as_str).map(str::to_string),
                            );
                        }
                    }
                    _ => {
                        obj.insert(key.clone(), value.clone());
                    }
                }
            }
        }

        if self.auto_cache_enabled(request) {
            apply_auto_cache(obj);
            beta_headers.push(PROMPT_CACHING_BETA.to_string());
        }

        Ok((body, beta_headers))
    }

    fn user_blocks(&self, message: &ChatMessage) -> Result<Vec<Value>, LLMError> {
        let mut blocks = Vec::new();
        for part in &message.content {
            match part {
                ContentPart::Text { text } => {
                    blocks.push(json!({"type": "text", "text": text}));
                }
                ContentPart::Image { source } => blocks.push(self.image_block(source)?),
                ContentPart::Audio { .. } | ContentPart::Document { .. } => {
                    return Err(LLMError::configuration(
                        &self.provider,
                        "audio/document content is not supported by the messages adapter",
                    ));
                }
                ContentPart::ToolCall { .. }
                | ContentPart::ToolResult { .. }
                | ContentPart::Thinking { .. } => {}
            }
        }
        Ok(blocks)
    }

    fn image_block(&self, source: &ImageSource) -> Result<Value, LLMError> {
        Ok(match source {
            ImageSource::Url(url) => {
                json!({"type": "image", "source": {"type": "url", "url": url}})
            }
            ImageSource::Path(path) => {
                let (media_type, data) = providers::read_local_image(&self.provider, path)?;
                json!({"type": "image", "source": {
                    "type": "base64",
                    "media_type": media_type,
                    "data": providers::base64_encode(&data),
                }})
            }
            ImageSource::Inline { data, media_type } => {
                json!({"type": "image", "source": {
                    "type": "base64",
                    "media_type": media_type,
                    "data": providers::base64_encode(data),
                }})
            }
        })
    }
}

fn assistant_blocks(message: &ChatMessage) -> Vec<Value> {
    let mut blocks = Vec::new();
    for part in &message.content {
        match part {
            ContentPart::Text { text } => {
                blocks.push(json!({"type": "text", "text": text}));
            }
            ContentPart::Thinking { thinking } => {
                if thinking.redacted {
                    blocks.push(json!({"type": "redacted_thinking", "data": thinking.text}));
                } else {
                    blocks.push(json!({
                        "type": "thinking",
                        "thinking": thinking.text,
                        "signature": thinking.signature.clone().unwrap_or_default(),
                    }));
                }
            }
            ContentPart::ToolCall { call } => {
                let input: Value =
                    serde_json::from_str(&call.function.arguments).unwrap_or(json!({}));
                blocks.push(json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.function.name,
                    "input": input,
                }));
            }
            _ => {}
        }
    }
    blocks
}

/// Consecutive same-role wire messages merge their content lists.
fn push_merged(messages: &mut Vec<Value>, role: &str, blocks: Vec<Value>) {
    if blocks.is_empty() {
        return;
    }
    if let Some(last) = messages.last_mut() {
        if last.get("role").and_then(Value::as_str) == Some(role) {
            if let Some(content) = last.get_mut("content").and_then(Value::as_array_mut) {
                content.extend(blocks);
                return;
            }
        }
    }
    messages.push(json!({"role": role, "content": blocks}));
}

/// Version dots between digits become dashes: `claude-sonnet-4.5` →
/// `claude-sonnet-4-5`. Everything else is untouched.
pub fn normalize_model_id(model: &str) -> String {
    let chars: Vec<char> = model.chars().collect();
    let mut out = String::with_capacity(model.len());
    for (i, &c) in chars.iter().enumerate() {
        let between_digits = c == '.'
            && i > 0
            && chars[i - 1].is_ascii_digit()
            && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit());
        out.push(if between_digits { '-' } else { c });
    }
    out
}

fn cache_control() -> Value {
    json!({"type": "ephemeral"})
}

/// Place the prompt-caching breakpoints: system block, last tool, and the
/// content block of the message immediately preceding the last user
/// message. At most three are placed here, under the API's limit of four.
fn apply_auto_cache(body: &mut Map<String, Value>) {
    if let Some(Value::String(system)) = body.get("system").cloned() {
        body.insert(
            "system".into(),
            json!([{"type": "text", "text": system, "cache_control": cache_control()}]),
        );
    }

    if let Some(tools) = body.get_mut("tools").and_then(Value::as_array_mut) {
        if let Some(last) = tools.last_mut().and_then(Value::as_object_mut) {
            last.insert("cache_control".into(), cache_control());
        }
    }

    if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
        let last_user = messages
            .iter()
            .rposition(|m| m.get("role").and_then(Value::as_str) == Some("user"));
        let target = match last_user {
            Some(idx) if idx > 0 => idx - 1,
            _ => return,
        };
        // Only block-array content takes a breakpoint; plain-string
        // content is left untouched.
        let Some(content) = messages[target].get_mut("content").and_then(Value::as_array_mut)
        else {
            return;
        };
        let block_idx = content
            .iter()
            .rposition(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .or_else(|| content.len().checked_sub(1));
        let block = block_idx.and_then(|idx| content.get_mut(idx));
        if let Some(block) = block.and_then(Value::as_object_mut) {
            block.insert("cache_control".into(), cache_control());
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagesReply {
    id: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<Block>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Block {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    Thinking {
        thinking: String,
        #[serde(default)]
        signature: Option<String>,
    },
    RedactedThinking {
        data: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize, Default)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
}

impl MessagesUsage {
    /// Left un-normalized: streaming reports arrive split across
    /// `message_start` and `message_delta` and are merged before the total
    /// is derived.
    fn into_usage(self) -> Usage {
        Usage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_tokens: 0,
            reasoning_tokens: None,
            cache_read_tokens: self.cache_read_input_tokens,
            cache_write_tokens: self.cache_creation_input_tokens,
        }
    }
}

fn map_stop_reason(stop_reason: Option<&str>, saw_tool_use: bool) -> FinishReason {
    if saw_tool_use {
        return FinishReason::ToolCalls;
    }
    match stop_reason {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        Some("refusal") => FinishReason::ContentFilter,
        Some(_) => FinishReason::Other,
        None => FinishReason::Stop,
    }
}

fn decode_reply(provider: &str, model: &str, raw: Value) -> Result<ChatResponse, LLMError> {
    let reply: MessagesReply = serde_json::from_value(raw.clone()).map_err(|err| {
        LLMError::stream(provider, format!("cannot decode messages payload: {}", err))
    })?;

    let mut content = Vec::new();
    let mut saw_tool_use = false;
    for block in reply.content {
        match block {
            Block::Text { text } => content.push(ContentPart::Text { text }),
            Block::ToolUse { id, name, input } => {
                saw_tool_use = true;
                content.push(ContentPart::ToolCall {
                    call: ToolCall::function(id, name, input.to_string()),
                });
            }
            Block::Thinking { thinking, signature } => content.push(ContentPart::Thinking {
                thinking: Thinking { text: thinking, signature, redacted: false },
            }),
            Block::RedactedThinking { data } => content.push(ContentPart::Thinking {
                thinking: Thinking { text: data, signature: None, redacted: true },
            }),
            Block::Other => {}
        }
    }

    Ok(ChatResponse {
        id: reply.id,
        provider: provider.to_string(),
        model: reply.model.unwrap_or_else(|| model.to_string()),
        message: ChatMessage { role: ChatRole::Assistant, content },
        finish_reason: map_stop_reason(reply.stop_reason.as_deref(), saw_tool_use),
        finish_reason_raw: reply.stop_reason,
        usage: reply.usage.unwrap_or_default().into_usage().normalized(),
        raw: Some(raw),
    })
}

#[async_trait]
impl ChatProvider for AnthropicMessages {
    fn name(&self) -> &str {
        &self.provider
    }

    async fn complete(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
    ) -> Result<ChatResponse, LLMError> {
        if self.force_streaming {
            debug!("{} forces streaming; reducing stream for unary call", self.provider);
            let mut stream = self.stream(cancel, request).await?;
            let mut accumulator = StreamAccumulator::new(&self.provider, &request.model);
            while let Some(item) = stream.next().await {
                accumulator.absorb(&item?);
            }
            return Ok(accumulator.into_response());
        }

        let (body, beta_headers) = self.build_body(request, false)?;
        let response =
            providers::execute(&self.provider, cancel, self.request(&body, &beta_headers)).await?;
        let response = providers::check_status(&self.provider, response).await?;
        let raw: Value = response.json().await.map_err(|err| {
            LLMError::stream(&self.provider, format!("bad response body: {}", err))
        })?;
        decode_reply(&self.provider, &request.model, raw)
    }

    async fn stream(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
    ) -> Result<ChatStream, LLMError> {
        let (body, beta_headers) = self.build_body(request, true)?;
        let response =
            providers::execute(&self.provider, cancel, self.request(&body, &beta_headers)).await?;
        let response = providers::check_status(&self.provider, response).await?;

        let (tx, stream) = ChatStream::channel(cancel.child_token());
        let decoder = MessagesDecoder::new(self.provider.clone(), request.model.clone());
        let provider = self.provider.clone();
        tokio::spawn(async move {
            tx.send(StreamEvent::StreamStart).await;
            providers::drive_sse(&provider, response, tx, decoder).await;
        });
        Ok(stream)
    }
}

#[derive(Debug)]
enum BlockState {
    Text {
        id: String,
        buf: String,
    },
    ToolUse {
        call_id: String,
        name: String,
        buf: String,
        /// `content_block_start` carried a non-empty input value.
        had_start_input: bool,
        saw_delta: bool,
    },
    Thinking {
        id: String,
        buf: String,
        signature: Option<String>,
    },
    Redacted {
        data: String,
    },
}

/// Streaming decoder for Messages SSE events. Blocks are indexed by the
/// provider's integer index; assembly order follows those indexes.
struct MessagesDecoder {
    provider: String,
    model: String,
    response_id: String,
    blocks: BTreeMap<u64, BlockState>,
    usage: Usage,
    stop_reason: Option<String>,
    finished: bool,
}

impl MessagesDecoder {
    fn new(provider: String, model: String) -> Self {
        Self {
            provider,
            model,
            response_id: String::new(),
            blocks: BTreeMap::new(),
            usage: Usage::default(),
            stop_reason: None,
            finished: false,
        }
    }

    async fn handle(&mut self, data: Value, tx: &StreamSender) -> ControlFlow<()> {
        let kind = data.get("type").and_then(Value::as_str).unwrap_or_default();
        match kind {
            "message_start" => {
                if let Some(message) = data.get("message") {
                    if let Some(id) = message.get("id").and_then(Value::as_str) {
                        self.response_id = id.to_string();
                    }
                    if let Some(usage) = message.get("usage") {
                        if let Ok(initial) =
                            serde_json::from_value::<MessagesUsage>(usage.clone())
                        {
                            self.usage.merge(&initial.into_usage());
                        }
                    }
                }
            }
            "content_block_start" => {
                let index = data.get("index").and_then(Value::as_u64).unwrap_or(0);
                let block = data.get("content_block").cloned().unwrap_or_default();
                match block.get("type").and_then(Value::as_str).unwrap_or_default() {
                    "text" => {
                        let id = format!("text_{}", index);
                        tx.send(StreamEvent::TextStart { id: id.clone() }).await;
                        self.blocks.insert(index, BlockState::Text { id, buf: String::new() });
                    }
                    "thinking" => {
                        let id = format!("reasoning_{}", index);
                        tx.send(StreamEvent::ReasoningStart { id: id.clone() }).await;
                        self.blocks.insert(
                            index,
                            BlockState::Thinking { id, buf: String::new(), signature: None },
                        );
                    }
                    "redacted_thinking" => {
                        let data_payload = block
                            .get("data")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        self.blocks.insert(index, BlockState::Redacted { data: data_payload });
                    }
                    "tool_use" => {
                        let call_id = block
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        let name = block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        // The start block may already carry the input
                        // value; an empty object means "none yet".
                        let input = block.get("input");
                        let had_start_input = input.is_some_and(|v| match v {
                            Value::Null => false,
                            Value::Object(map) => !map.is_empty(),
                            _ => true,
                        });
                        let buf = if had_start_input {
                            input.map(|v| v.to_string()).unwrap_or_default()
                        } else {
                            String::new()
                        };
                        tx.send(StreamEvent::ToolCallStart {
                            id: call_id.clone(),
                            name: name.clone(),
                            call_type: "function".into(),
                        })
                        .await;
                        self.blocks.insert(
                            index,
                            BlockState::ToolUse {
                                call_id,
                                name,
                                buf,
                                had_start_input,
                                saw_delta: false,
                            },
                        );
                    }
                    _ => {
                        tx.send_passthrough(data);
                    }
                }
            }
            "content_block_delta" => {
                let index = data.get("index").and_then(Value::as_u64).unwrap_or(0);
                let delta = data.get("delta").cloned().unwrap_or_default();
                let Some(state) = self.blocks.get_mut(&index) else {
                    return ControlFlow::Continue(());
                };
                match delta.get("type").and_then(Value::as_str).unwrap_or_default() {
                    "text_delta" => {
                        let text = delta.get("text").and_then(Value::as_str).unwrap_or_default();
                        if let BlockState::Text { id, buf } = state {
                            buf.push_str(text);
                            let id = id.clone();
                            tx.send(StreamEvent::TextDelta { id, delta: text.to_string() }).await;
                        }
                    }
                    "thinking_delta" => {
                        let text =
                            delta.get("thinking").and_then(Value::as_str).unwrap_or_default();
                        if let BlockState::Thinking { id, buf, .. } = state {
                            buf.push_str(text);
                            let id = id.clone();
                            tx.send(StreamEvent::ReasoningDelta { id, delta: text.to_string() })
                                .await;
                        }
                    }
                    "signature_delta" => {
                        let sig =
                            delta.get("signature").and_then(Value::as_str).unwrap_or_default();
                        if let BlockState::Thinking { signature, .. } = state {
                            *signature = Some(sig.to_string());
                        }
                    }
                    "input_json_delta" => {
                        let partial = delta
                            .get("partial_json")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        if let BlockState::ToolUse {
                            call_id,
                            name,
                            buf,
                            had_start_input,
                            saw_delta,
                        } = state
                        {
                            // Tie-break: a start-block input followed by
                            // deltas would concatenate two top-level JSON
                            // values; the first delta replaces it instead.
                            if *had_start_input && !*saw_delta {
                                buf.clear();
                            }
                            *saw_delta = true;
                            buf.push_str(partial);
                            let (id, name, args) = (call_id.clone(), name.clone(), buf.clone());
                            tx.send(StreamEvent::ToolCallDelta { id, name, arguments: args })
                                .await;
                        }
                    }
                    _ => {
                        tx.send_passthrough(data);
                    }
                }
            }
            "content_block_stop" => {
                let index = data.get("index").and_then(Value::as_u64).unwrap_or(0);
                match self.blocks.get(&index) {
                    Some(BlockState::Text { id, .. }) => {
                        tx.send(StreamEvent::TextEnd { id: id.clone() }).await;
                    }
                    Some(BlockState::Thinking { id, .. }) => {
                        tx.send(StreamEvent::ReasoningEnd { id: id.clone() }).await;
                    }
                    Some(BlockState::ToolUse { call_id, name, buf, .. }) => {
                        tx.send(StreamEvent::ToolCallEnd {
                            id: call_id.clone(),
                            name: name.clone(),
                            arguments: buf.clone(),
                        })
                        .await;
                    }
                    Some(BlockState::Redacted { .. }) | None => {}
                }
            }
            "message_delta" => {
                if let Some(stop) = data
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str)
                {
                    self.stop_reason = Some(stop.to_string());
                }
                if let Some(usage) = data.get("usage") {
                    if let Ok(update) = serde_json::from_value::<MessagesUsage>(usage.clone()) {
                        self.usage.merge(&update.into_usage());
                    }
                }
            }
            "message_stop" => {
                let response = self.assemble();
                self.finished = true;
                tx.send(StreamEvent::StepFinish { finish_reason: response.finish_reason }).await;
                tx.send(StreamEvent::Finish {
                    finish_reason: response.finish_reason,
                    usage: response.usage.clone(),
                    response: Box::new(response),
                })
                .await;
                return ControlFlow::Break(());
            }
            "error" => {
                let message = data
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("provider reported a stream failure");
                tx.send_err(LLMError::stream(&self.provider, message)).await;
                return ControlFlow::Break(());
            }
            // ping and friends
            _ => {
                tx.send_passthrough(data);
            }
        }
        ControlFlow::Continue(())
    }

    fn assemble(&mut self) -> ChatResponse {
        let mut content = Vec::new();
        let mut saw_tool_use = false;
        for (_, state) in std::mem::take(&mut self.blocks) {
            match state {
                BlockState::Text { buf, .. } => {
                    if !buf.is_empty() {
                        content.push(ContentPart::Text { text: buf });
                    }
                }
                BlockState::Thinking { buf, signature, .. } => {
                    content.push(ContentPart::Thinking {
                        thinking: Thinking { text: buf, signature, redacted: false },
                    });
                }
                BlockState::Redacted { data } => {
                    content.push(ContentPart::Thinking {
                        thinking: Thinking { text: data, signature: None, redacted: true },
                    });
                }
                BlockState::ToolUse { call_id, name, buf, .. } => {
                    saw_tool_use = true;
                    content.push(ContentPart::ToolCall {
                        call: ToolCall::function(call_id, name, buf),
                    });
                }
            }
        }

        ChatResponse {
            id: std::mem::take(&mut self.response_id),
            provider: self.provider.clone(),
            model: self.model.clone(),
            message: ChatMessage { role: ChatRole::Assistant, content },
            finish_reason: map_stop_reason(self.stop_reason.as_deref(), saw_tool_use),
            finish_reason_raw: self.stop_reason.take(),
            usage: std::mem::take(&mut self.usage).normalized(),
            raw: None,
        }
    }
}

#[async_trait]
impl SseDecoder for MessagesDecoder {
    async fn on_event(&mut self, event: SseEvent, tx: &StreamSender) -> ControlFlow<()> {
        if event.is_done() {
            return ControlFlow::Break(());
        }
        match serde_json::from_str::<Value>(&event.data) {
            Ok(data) => self.handle(data, tx).await,
            Err(err) => {
                tx.send_err(LLMError::stream(
                    &self.provider,
                    format!("bad stream payload: {}", err),
                ))
                .await;
                ControlFlow::Break(())
            }
        }
    }

    async fn on_eof(&mut self, tx: &StreamSender) {
        if !self.finished {
            let _ = tx
                .send_err(LLMError::stream(&self.provider, "stream ended before message_stop"))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Tool;

    fn adapter() -> AnthropicMessages {
        AnthropicMessages::new(AnthropicConfig { api_key: "key".into(), base_url: None })
    }

    #[test]
    fn model_id_normalization_only_touches_digit_dot_digit() {
        assert_eq!(normalize_model_id("claude-sonnet-4.5"), "claude-sonnet-4-5");
        assert_eq!(normalize_model_id("claude-3.5-haiku"), "claude-3-5-haiku");
        assert_eq!(
            normalize_model_id("claude-sonnet-4-5-20250929"),
            "claude-sonnet-4-5-20250929"
        );
        assert_eq!(normalize_model_id("gpt.x"), "gpt.x");
        assert_eq!(normalize_model_id("v1.2.3"), "v1-2-3");
    }

    #[test]
    fn system_is_hoisted_and_tool_results_become_user_blocks() {
        let request = ChatRequest::new(
            "claude-sonnet-4.5",
            vec![
                ChatMessage::system().text("be terse").build(),
                ChatMessage::user().text("list files").build(),
                ChatMessage::assistant()
                    .tool_call(ToolCall::function("toolu_1", "glob", "{\"pattern\":\"*\"}"))
                    .build(),
                ChatMessage::tool_result_named("toolu_1", "glob", "a.rs\nb.rs", false),
                ChatMessage::user().text("thanks").build(),
            ],
        );
        let (body, _) = adapter().build_body(&request, false).unwrap();

        assert_eq!(body["model"], "claude-sonnet-4-5");
        let messages = body["messages"].as_array().unwrap();
        // tool_result user message merges with the following user text
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["content"][0]["type"], "tool_use");
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"][0]["type"], "tool_result");
        assert_eq!(messages[2]["content"][0]["tool_use_id"], "toolu_1");
        assert_eq!(messages[2]["content"][1]["type"], "text");
    }

    #[test]
    fn max_tokens_defaults_and_tool_choice_none_omits_tools() {
        let mut request = ChatRequest::new(
            "claude-sonnet-4-5",
            vec![ChatMessage::user().text("x").build()],
        );
        request.tools.push(Tool::function("glob", "", json!({"type": "object"})));
        request.tool_choice = Some(ToolChoice::None);
        let (body, _) = adapter().build_body(&request, false).unwrap();
        assert_eq!(body["max_tokens"], 4096);
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn auto_cache_places_breakpoints_and_beta_header() {
        let mut request = ChatRequest::new(
            "claude-sonnet-4-5",
            vec![
                ChatMessage::system().text("sys").build(),
                ChatMessage::user().text("first").build(),
                ChatMessage::assistant().text("reply").build(),
                ChatMessage::user().text("second").build(),
            ],
        );
        request.tools.push(Tool::function("glob", "", json!({"type": "object"})));
        request.tools.push(Tool::function("grep", "", json!({"type": "object"})));
        let (body, beta) = adapter().build_body(&request, false).unwrap();

        assert!(beta.contains(&PROMPT_CACHING_BETA.to_string()));
        assert_eq!(body["system"][0]["cache_control"]["type"], "ephemeral");
        assert!(body["tools"][0].get("cache_control").is_none());
        assert_eq!(body["tools"][1]["cache_control"]["type"], "ephemeral");
        // Last user message is index 2 on the wire; the breakpoint lands on
        // the assistant message before it, on its text block.
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["content"][0]["cache_control"]["type"], "ephemeral");
        assert!(messages[2]["content"][0].get("cache_control").is_none());
    }

    #[test]
    fn auto_cache_can_be_disabled_and_is_off_for_kimi_by_default() {
        let mut request = ChatRequest::new(
            "claude-sonnet-4-5",
            vec![ChatMessage::system().text("sys").build(), ChatMessage::user().text("x").build()],
        );
        request
            .provider_options
            .insert("anthropic".into(), json!({"auto_cache": false}));
        let (body, beta) = adapter().build_body(&request, false).unwrap();
        assert!(beta.is_empty());
        assert!(body["system"].is_string());

        let kimi = AnthropicMessages::kimi(AnthropicConfig { api_key: "k".into(), base_url: None });
        let request = ChatRequest::new("kimi-k2", vec![ChatMessage::user().text("x").build()]);
        let (_, beta) = kimi.build_body(&request, true).unwrap();
        assert!(beta.is_empty());
    }

    #[test]
    fn kimi_forces_max_tokens_floor() {
        let kimi = AnthropicMessages::kimi(AnthropicConfig { api_key: "k".into(), base_url: None });
        let request = ChatRequest::new("kimi-k2", vec![ChatMessage::user().text("x").build()]);
        let (body, _) = kimi.build_body(&request, true).unwrap();
        assert_eq!(body["max_tokens"], 16000);

        let mut request = ChatRequest::new("kimi-k2", vec![ChatMessage::user().text("x").build()]);
        request.max_tokens = Some(32000);
        let (body, _) = kimi.build_body(&request, true).unwrap();
        assert_eq!(body["max_tokens"], 32000);
    }

    #[test]
    fn unary_reply_decodes_blocks() {
        let raw = json!({
            "id": "msg_1",
            "model": "claude-sonnet-4-5",
            "content": [
                {"type": "thinking", "thinking": "planning", "signature": "sig"},
                {"type": "text", "text": "on it"},
                {"type": "tool_use", "id": "toolu_9", "name": "shell", "input": {"cmd": "ls"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 7, "cache_read_input_tokens": 4}
        });
        let response = decode_reply("anthropic", "claude-sonnet-4-5", raw).unwrap();
        assert_eq!(response.thinking(), "planning");
        assert_eq!(response.text(), "on it");
        assert_eq!(response.tool_calls()[0].function.arguments, "{\"cmd\":\"ls\"}");
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_eq!(response.usage.cache_read_tokens, Some(4));
    }

    async fn run_decoder(events: Vec<Value>) -> Vec<StreamEvent> {
        use futures::StreamExt;
        let cancel = CancellationToken::new();
        let (tx, stream) = ChatStream::channel(cancel);
        let mut decoder = MessagesDecoder::new("anthropic".into(), "claude-sonnet-4-5".into());
        let producer = tokio::spawn(async move {
            for data in events {
                if decoder.handle(data, &tx).await.is_break() {
                    break;
                }
            }
        });
        let collected: Vec<StreamEvent> = stream.map(Result::unwrap).collect().await;
        producer.await.unwrap();
        collected
    }

    #[tokio::test]
    async fn delta_replaces_start_input_on_tie_break() {
        let events = vec![
            json!({"type": "message_start", "message": {"id": "msg_1", "usage": {"input_tokens": 5}}}),
            json!({"type": "content_block_start", "index": 0,
                   "content_block": {"type": "tool_use", "id": "toolu_1", "name": "glob", "input": {"n": 1}}}),
            json!({"type": "content_block_delta", "index": 0,
                   "delta": {"type": "input_json_delta", "partial_json": "{\"n\":2}"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 3}}),
            json!({"type": "message_stop"}),
        ];
        let collected = run_decoder(events).await;
        let end = collected
            .iter()
            .find_map(|e| match e {
                StreamEvent::ToolCallEnd { arguments, .. } => Some(arguments.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(end, "{\"n\":2}");

        match collected.last().unwrap() {
            StreamEvent::Finish { response, usage, .. } => {
                assert_eq!(response.tool_calls()[0].function.arguments, "{\"n\":2}");
                assert_eq!(usage.input_tokens, 5);
                assert_eq!(usage.output_tokens, 3);
            }
            other => panic!("expected finish, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn continuation_deltas_concatenate_without_start_input() {
        let events = vec![
            json!({"type": "message_start", "message": {"id": "msg_2", "usage": {"input_tokens": 1}}}),
            json!({"type": "content_block_start", "index": 0,
                   "content_block": {"type": "tool_use", "id": "toolu_2", "name": "glob", "input": {}}}),
            json!({"type": "content_block_delta", "index": 0,
                   "delta": {"type": "input_json_delta", "partial_json": "{\"pattern\":"}}),
            json!({"type": "content_block_delta", "index": 0,
                   "delta": {"type": "input_json_delta", "partial_json": "\"*.go\"}"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "message_stop"}),
        ];
        let collected = run_decoder(events).await;
        let end = collected
            .iter()
            .find_map(|e| match e {
                StreamEvent::ToolCallEnd { arguments, .. } => Some(arguments.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(end, "{\"pattern\":\"*.go\"}");
    }

    #[tokio::test]
    async fn text_and_thinking_blocks_round_trip() {
        let events = vec![
            json!({"type": "message_start", "message": {"id": "msg_3", "usage": {"input_tokens": 2}}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "thinking"}}),
            json!({"type": "content_block_delta", "index": 0,
                   "delta": {"type": "thinking_delta", "thinking": "let me think"}}),
            json!({"type": "content_block_delta", "index": 0,
                   "delta": {"type": "signature_delta", "signature": "sig_abc"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "content_block_start", "index": 1, "content_block": {"type": "text"}}),
            json!({"type": "content_block_delta", "index": 1,
                   "delta": {"type": "text_delta", "text": "hello"}}),
            json!({"type": "content_block_stop", "index": 1}),
            json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 9}}),
            json!({"type": "message_stop"}),
        ];
        let collected = run_decoder(events).await;
        match collected.last().unwrap() {
            StreamEvent::Finish { finish_reason, response, .. } => {
                assert_eq!(*finish_reason, FinishReason::Stop);
                assert_eq!(response.thinking(), "let me think");
                assert_eq!(response.text(), "hello");
                match &response.message.content[0] {
                    ContentPart::Thinking { thinking } => {
                        assert_eq!(thinking.signature.as_deref(), Some("sig_abc"));
                    }
                    other => panic!("expected thinking first, got {:?}", other),
                }
            }
            other => panic!("expected finish, got {:?}", other),
        }
    }
}
