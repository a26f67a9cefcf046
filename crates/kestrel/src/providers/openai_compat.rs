//! OpenAI-compatible Chat Completions adapter.
//!
//! The workhorse dialect for Kimi, ZAI, DeepSeek, Cerebras and most
//! aggregators. Tool-call deltas are keyed by `index`, falling back to
//! `id`, falling back to arrival position; both `reasoning_content`
//! (DeepSeek) and `reasoning` (Cerebras) channels are accepted.

use std::collections::HashMap;
use std::ops::ControlFlow;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::chat::{
    ChatMessage, ChatProvider, ChatRequest, ChatResponse, ChatRole, ContentPart, FinishReason,
    ResponseFormat, StreamEvent, Thinking, ToolChoice,
};
use crate::error::LLMError;
use crate::providers::{self, SseDecoder};
use crate::sse::SseEvent;
use crate::stream::{ChatStream, StreamSender};
use crate::{ToolCall, Usage};

/// Configuration for an OpenAI-compatible adapter.
#[derive(Debug, Clone)]
pub struct OpenAICompatConfig {
    /// Canonical provider key, e.g. `"deepseek"`.
    pub provider: String,
    pub api_key: String,
    /// e.g. `https://api.deepseek.com/v1`; trailing slashes stripped.
    pub base_url: String,
}

/// Client for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAICompat {
    provider: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAICompat {
    pub fn new(config: OpenAICompatConfig) -> Self {
        Self {
            provider: config.provider,
            api_key: config.api_key,
            base_url: providers::normalize_base_url(&config.base_url),
            client: reqwest::Client::new(),
        }
    }

    pub fn deepseek(api_key: impl Into<String>) -> Self {
        Self::known("deepseek", api_key, "https://api.deepseek.com/v1")
    }

    pub fn zai(api_key: impl Into<String>) -> Self {
        Self::known("zai", api_key, "https://api.z.ai/api/paas/v4")
    }

    pub fn cerebras(api_key: impl Into<String>) -> Self {
        Self::known("cerebras", api_key, "https://api.cerebras.ai/v1")
    }

    /// Kimi over the chat-completions dialect; the Messages-dialect
    /// profile with its execution policy lives in the anthropic adapter.
    pub fn kimi(api_key: impl Into<String>) -> Self {
        Self::known("kimi", api_key, "https://api.moonshot.ai/v1")
    }

    fn known(provider: &str, api_key: impl Into<String>, base_url: &str) -> Self {
        Self::new(OpenAICompatConfig {
            provider: provider.to_string(),
            api_key: api_key.into(),
            base_url: base_url.to_string(),
        })
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> Result<Value, LLMError> {
        let mut messages = Vec::new();
        for message in &request.messages {
            match message.role {
                ChatRole::System | ChatRole::Developer => {
                    messages.push(json!({"role": "system", "content": message.text()}));
                }
                ChatRole::User => {
                    if message
                        .content
                        .iter()
                        .any(|p| !matches!(p, ContentPart::Text { .. }))
                    {
                        return Err(LLMError::configuration(
                            &self.provider,
                            "only text content is supported by the chat-completions adapter",
                        ));
                    }
                    messages.push(json!({"role": "user", "content": message.text()}));
                }
                ChatRole::Assistant => {
                    let mut wire = json!({"role": "assistant"});
                    let obj = wire.as_object_mut().unwrap();
                    let text = message.text();
                    obj.insert(
                        "content".into(),
                        if text.is_empty() { Value::Null } else { Value::String(text) },
                    );
                    let calls: Vec<Value> = message
                        .tool_calls()
                        .into_iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": call.call_type,
                                "function": {
                                    "name": call.function.name,
                                    "arguments": call.function.arguments,
                                },
                            })
                        })
                        .collect();
                    if !calls.is_empty() {
                        obj.insert("tool_calls".into(), Value::Array(calls));
                    }
                    messages.push(wire);
                }
                ChatRole::Tool => {
                    for result in message.tool_results() {
                        messages.push(json!({
                            "role": "tool",
                            "tool_call_id": result.tool_call_id,
                            "content": result.content_string(),
                        }));
                    }
                }
            }
        }

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": stream,
        });
        let obj = body.as_object_mut().unwrap();

        if stream {
            obj.insert("stream_options".into(), json!({"include_usage": true}));
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.function.name,
                            "description": tool.function.description,
                            "parameters": tool.function.parameters,
                        },
                    })
                })
                .collect();
            obj.insert("tools".into(), Value::Array(tools));
        }
        if let Some(choice) = &request.tool_choice {
            obj.insert(
                "tool_choice".into(),
                match choice {
                    ToolChoice::Auto => json!("auto"),
                    ToolChoice::None => json!("none"),
                    ToolChoice::Any => json!("required"),
                    ToolChoice::Tool(name) => json!({"type": "function", "function": {"name": name}}),
                },
            );
        }
        if let Some(temperature) = request.temperature {
            obj.insert("temperature".into(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            obj.insert("top_p".into(), json!(top_p));
        }
        if let Some(max_tokens) = request.max_tokens {
            obj.insert("max_tokens".into(), json!(max_tokens));
        }
        if !request.stop_sequences.is_empty() {
            obj.insert("stop".into(), json!(request.stop_sequences));
        }
        if let Some(effort) = request.reasoning_effort {
            obj.insert("reasoning_effort".into(), json!(effort.to_string()));
        }
        match &request.response_format {
            Some(ResponseFormat::Json) => {
                obj.insert("response_format".into(), json!({"type": "json_object"}));
            }
            Some(ResponseFormat::JsonSchema { schema }) => {
                obj.insert(
                    "response_format".into(),
                    json!({"type": "json_schema", "json_schema": {"name": "response", "schema": schema}}),
                );
            }
            None => {}
        }
        // Passthrough options are merged verbatim; serde_json keeps u64/i64
        // integers intact rather than coercing to float.
        if let Some(Value::Object(options)) = request.options_for(&self.provider) {
            for (key, value) in options {
                obj.insert(key.clone(), value.clone());
            }
        }

        Ok(body)
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionReply {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ReplyChoice>,
    #[serde(default)]
    usage: Option<CompatUsage>,
}

#[derive(Debug, Deserialize)]
struct ReplyChoice {
    message: ReplyMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ReplyMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize, Clone)]
struct WireToolCall {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "type")]
    call_type: Option<String>,
    function: WireFunction,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct WireFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize, Default)]
struct CompatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
    #[serde(default)]
    completion_tokens_details: Option<CompletionDetails>,
    #[serde(default)]
    prompt_tokens_details: Option<PromptDetails>,
}

#[derive(Debug, Deserialize, Default)]
struct CompletionDetails {
    #[serde(default)]
    reasoning_tokens: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PromptDetails {
    #[serde(default)]
    cached_tokens: Option<u64>,
}

impl CompatUsage {
    fn into_usage(self) -> Usage {
        Usage {
            input_tokens: self.prompt_tokens,
            output_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
            reasoning_tokens: self.completion_tokens_details.and_then(|d| d.reasoning_tokens),
            cache_read_tokens: self.prompt_tokens_details.and_then(|d| d.cached_tokens),
            cache_write_tokens: None,
        }
        .normalized()
    }
}

fn map_finish_reason(reason: Option<&str>, saw_tool_calls: bool) -> FinishReason {
    if saw_tool_calls {
        return FinishReason::ToolCalls;
    }
    match reason {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("tool_calls") => FinishReason::ToolCalls,
        Some("content_filter") => FinishReason::ContentFilter,
        Some(_) => FinishReason::Other,
        None => FinishReason::Stop,
    }
}

fn decode_reply(provider: &str, model: &str, raw: Value) -> Result<ChatResponse, LLMError> {
    let reply: ChatCompletionReply = serde_json::from_value(raw.clone()).map_err(|err| {
        LLMError::stream(provider, format!("cannot decode chat completion: {}", err))
    })?;
    let choice = reply.choices.into_iter().next().ok_or_else(|| {
        LLMError::stream(provider, "chat completion carried no choices")
    })?;

    let mut content = Vec::new();
    // Either reasoning spelling is prepended as a thinking part.
    let reasoning = choice
        .message
        .reasoning_content
        .or(choice.message.reasoning)
        .filter(|text| !text.is_empty());
    if let Some(text) = reasoning {
        content.push(ContentPart::Thinking { thinking: Thinking { text, ..Default::default() } });
    }
    if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
        content.push(ContentPart::Text { text });
    }
    let saw_tool_calls = !choice.message.tool_calls.is_empty();
    for call in choice.message.tool_calls {
        content.push(ContentPart::ToolCall {
            call: ToolCall {
                id: call.id.unwrap_or_default(),
                call_type: call.call_type.unwrap_or_else(|| "function".to_string()),
                function: crate::FunctionCall {
                    name: call.function.name.unwrap_or_default(),
                    arguments: call.function.arguments,
                },
            },
        });
    }

    Ok(ChatResponse {
        id: reply.id,
        provider: provider.to_string(),
        model: reply.model.unwrap_or_else(|| model.to_string()),
        message: ChatMessage { role: ChatRole::Assistant, content },
        finish_reason: map_finish_reason(choice.finish_reason.as_deref(), saw_tool_calls),
        finish_reason_raw: choice.finish_reason,
        usage: reply.usage.unwrap_or_default().into_usage(),
        raw: Some(raw),
    })
}

#[async_trait]
impl ChatProvider for OpenAICompat {
    fn name(&self) -> &str {
        &self.provider
    }

    async fn complete(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
    ) -> Result<ChatResponse, LLMError> {
        let body = self.build_body(request, false)?;
        let response = providers::execute(&self.provider, cancel, self.request(&body)).await?;
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
        let body = self.build_body(request, true)?;
        let response = providers::execute(&self.provider, cancel, self.request(&body)).await?;
        let response = providers::check_status(&self.provider, response).await?;

        let (tx, stream) = ChatStream::channel(cancel.child_token());
        let decoder = ChunkDecoder::new(self.provider.clone(), request.model.clone());
        let provider = self.provider.clone();
        tokio::spawn(async move {
            tx.send(StreamEvent::StreamStart).await;
            providers::drive_sse(&provider, response, tx, decoder).await;
        });
        Ok(stream)
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<CompatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChunkToolCall>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: Option<u64>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "type")]
    call_type: Option<String>,
    #[serde(default)]
    function: WireFunction,
}

/// Accumulation key for one tool call across deltas: `index` field first,
/// then `id`, then ordinal arrival position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CallKey {
    Index(u64),
    Id(String),
    Ordinal(usize),
}

#[derive(Debug, Default)]
struct CallState {
    id: String,
    name: String,
    call_type: String,
    buf: String,
    started: bool,
    ended: bool,
}

/// Streaming decoder for Chat Completions chunks.
struct ChunkDecoder {
    provider: String,
    model: String,
    response_id: String,
    calls: HashMap<CallKey, CallState>,
    call_order: Vec<CallKey>,
    text_buf: String,
    text_open: bool,
    reasoning_buf: String,
    reasoning_open: bool,
    usage: Option<Usage>,
    finish_raw: Option<String>,
    finished: bool,
}

impl ChunkDecoder {
    fn new(provider: String, model: String) -> Self {
        Self {
            provider,
            model,
            response_id: String::new(),
            calls: HashMap::new(),
            call_order: Vec::new(),
            text_buf: String::new(),
            text_open: false,
            reasoning_buf: String::new(),
            reasoning_open: false,
            usage: None,
            finish_raw: None,
            finished: false,
        }
    }

    async fn handle(&mut self, chunk: StreamChunk, tx: &StreamSender) {
        if let Some(id) = chunk.id {
            if self.response_id.is_empty() {
                self.response_id = id;
            }
        }
        // A final usage-only chunk (no choices) after finish_reason must
        // still land on the finish event.
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage.into_usage());
        }

        for choice in chunk.choices {
            let reasoning_delta = choice
                .delta
                .reasoning_content
                .as_deref()
                .or(choice.delta.reasoning.as_deref())
                .unwrap_or_default();
            if !reasoning_delta.is_empty() {
                if !self.reasoning_open {
                    self.reasoning_open = true;
                    tx.send(StreamEvent::ReasoningStart { id: "reasoning_0".into() }).await;
                }
                self.reasoning_buf.push_str(reasoning_delta);
                tx.send(StreamEvent::ReasoningDelta {
                    id: "reasoning_0".into(),
                    delta: reasoning_delta.to_string(),
                })
                .await;
            }

            if let Some(text) = choice.delta.content.as_deref() {
                if !text.is_empty() {
                    if self.reasoning_open {
                        self.reasoning_open = false;
                        tx.send(StreamEvent::ReasoningEnd { id: "reasoning_0".into() }).await;
                    }
                    if !self.text_open {
                        self.text_open = true;
                        tx.send(StreamEvent::TextStart { id: "text_0".into() }).await;
                    }
                    self.text_buf.push_str(text);
                    tx.send(StreamEvent::TextDelta {
                        id: "text_0".into(),
                        delta: text.to_string(),
                    })
                    .await;
                }
            }

            for (position, call) in choice.delta.tool_calls.into_iter().enumerate() {
                self.absorb_call_delta(position, call, tx).await;
            }

            if let Some(reason) = choice.finish_reason {
                self.finish_raw = Some(reason);
            }
        }
    }

    async fn absorb_call_delta(&mut self, position: usize, call: ChunkToolCall, tx: &StreamSender) {
        let key = match (call.index, &call.id) {
            (Some(index), _) => CallKey::Index(index),
            (None, Some(id)) => CallKey::Id(id.clone()),
            (None, None) => CallKey::Ordinal(position),
        };
        if !self.calls.contains_key(&key) {
            self.call_order.push(key.clone());
        }
        let state = self.calls.entry(key).or_default();

        if let Some(id) = call.id {
            if !id.is_empty() {
                state.id = id;
            }
        }
        if let Some(call_type) = call.call_type {
            if !call_type.is_empty() {
                state.call_type = call_type;
            }
        }
        if let Some(name) = call.function.name {
            if !name.is_empty() {
                state.name = name;
            }
        }

        if !state.started {
            state.started = true;
            tx.send(StreamEvent::ToolCallStart {
                id: state.id.clone(),
                name: state.name.clone(),
                call_type: if state.call_type.is_empty() {
                    "function".into()
                } else {
                    state.call_type.clone()
                },
            })
            .await;
        }

        if !call.function.arguments.is_empty() {
            state.buf.push_str(&call.function.arguments);
            tx.send(StreamEvent::ToolCallDelta {
                id: state.id.clone(),
                name: state.name.clone(),
                arguments: state.buf.clone(),
            })
            .await;
        }
    }

    /// Close open segments and emit the finish event with the assembled
    /// response.
    async fn finalize(&mut self, tx: &StreamSender) {
        if self.finished {
            return;
        }
        self.finished = true;

        if self.reasoning_open {
            self.reasoning_open = false;
            tx.send(StreamEvent::ReasoningEnd { id: "reasoning_0".into() }).await;
        }
        if self.text_open {
            self.text_open = false;
            tx.send(StreamEvent::TextEnd { id: "text_0".into() }).await;
        }
        for key in &self.call_order {
            if let Some(state) = self.calls.get_mut(key) {
                if !state.ended {
                    state.ended = true;
                    tx.send(StreamEvent::ToolCallEnd {
                        id: state.id.clone(),
                        name: state.name.clone(),
                        arguments: state.buf.clone(),
                    })
                    .await;
                }
            }
        }

        let mut content = Vec::new();
        if !self.reasoning_buf.is_empty() {
            content.push(ContentPart::Thinking {
                thinking: Thinking { text: std::mem::take(&mut self.reasoning_buf), ..Default::default() },
            });
        }
        if !self.text_buf.is_empty() {
            content.push(ContentPart::Text { text: std::mem::take(&mut self.text_buf) });
        }
        let mut saw_tool_calls = false;
        for key in std::mem::take(&mut self.call_order) {
            if let Some(state) = self.calls.remove(&key) {
                saw_tool_calls = true;
                content.push(ContentPart::ToolCall {
                    call: ToolCall {
                        id: state.id,
                        call_type: if state.call_type.is_empty() {
                            "function".into()
                        } else {
                            state.call_type
                        },
                        function: crate::FunctionCall { name: state.name, arguments: state.buf },
                    },
                });
            }
        }

        let finish_reason = map_finish_reason(self.finish_raw.as_deref(), saw_tool_calls);
        let usage = self.usage.take().unwrap_or_default().normalized();
        let response = ChatResponse {
            id: std::mem::take(&mut self.response_id),
            provider: self.provider.clone(),
            model: self.model.clone(),
            message: ChatMessage { role: ChatRole::Assistant, content },
            finish_reason,
            finish_reason_raw: self.finish_raw.take(),
            usage: usage.clone(),
            raw: None,
        };
        tx.send(StreamEvent::StepFinish { finish_reason }).await;
        tx.send(StreamEvent::Finish { finish_reason, usage, response: Box::new(response) }).await;
    }
}

#[async_trait]
impl SseDecoder for ChunkDecoder {
    async fn on_event(&mut self, event: SseEvent, tx: &StreamSender) -> ControlFlow<()> {
        if event.is_done() {
            self.finalize(tx).await;
            return ControlFlow::Break(());
        }
        match serde_json::from_str::<StreamChunk>(&event.data) {
            Ok(chunk) => {
                self.handle(chunk, tx).await;
                ControlFlow::Continue(())
            }
            Err(err) => {
                tx.send_err(LLMError::stream(
                    &self.provider,
                    format!("bad stream chunk: {}", err),
                ))
                .await;
                ControlFlow::Break(())
            }
        }
    }

    async fn on_eof(&mut self, tx: &StreamSender) {
        // Some servers close the connection instead of sending [DONE].
        self.finalize(tx).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Tool;

    fn adapter() -> OpenAICompat {
        OpenAICompat::new(OpenAICompatConfig {
            provider: "deepseek".into(),
            api_key: "key".into(),
            base_url: "https://api.deepseek.com/v1/".into(),
        })
    }

    #[test]
    fn known_providers_carry_their_base_urls() {
        assert_eq!(OpenAICompat::deepseek("k").base_url, "https://api.deepseek.com/v1");
        assert_eq!(OpenAICompat::deepseek("k").provider, "deepseek");
        assert_eq!(OpenAICompat::cerebras("k").provider, "cerebras");
        assert_eq!(OpenAICompat::kimi("k").base_url, "https://api.moonshot.ai/v1");
        assert_eq!(OpenAICompat::zai("k").provider, "zai");
    }

    #[test]
    fn body_maps_roles_and_tool_results() {
        let request = ChatRequest::new(
            "deepseek-chat",
            vec![
                ChatMessage::system().text("be terse").build(),
                ChatMessage::user().text("list files").build(),
                ChatMessage::assistant()
                    .tool_call(ToolCall::function("call_1", "glob", "{\"pattern\":\"*\"}"))
                    .build(),
                ChatMessage::tool_result_named("call_1", "glob", "a.rs", false),
            ],
        );
        let body = adapter().build_body(&request, false).unwrap();
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["tool_calls"][0]["function"]["name"], "glob");
        assert_eq!(messages[2]["content"], Value::Null);
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call_1");
    }

    #[test]
    fn provider_options_preserve_large_integers() {
        let mut request = ChatRequest::new("m", vec![ChatMessage::user().text("x").build()]);
        let big: u64 = 9_007_199_254_740_993; // not representable as f64
        request
            .provider_options
            .insert("deepseek".into(), json!({"seed": big}));
        let body = adapter().build_body(&request, false).unwrap();
        assert_eq!(body["seed"].as_u64(), Some(big));
    }

    #[test]
    fn streaming_body_asks_for_usage() {
        let request = ChatRequest::new("m", vec![ChatMessage::user().text("x").build()]);
        let body = adapter().build_body(&request, true).unwrap();
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["stream_options"]["include_usage"], json!(true));
    }

    #[test]
    fn unary_reply_prepends_reasoning_as_thinking() {
        let raw = json!({
            "id": "cmpl_1",
            "model": "deepseek-reasoner",
            "choices": [{
                "message": {
                    "reasoning_content": "step by step",
                    "content": "the answer",
                },
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 4, "completion_tokens": 6, "total_tokens": 10,
                      "completion_tokens_details": {"reasoning_tokens": 3}}
        });
        let response = decode_reply("deepseek", "deepseek-reasoner", raw).unwrap();
        assert!(matches!(response.message.content[0], ContentPart::Thinking { .. }));
        assert_eq!(response.thinking(), "step by step");
        assert_eq!(response.text(), "the answer");
        assert_eq!(response.usage.reasoning_tokens, Some(3));
    }

    #[test]
    fn cerebras_reasoning_spelling_is_accepted() {
        let raw = json!({
            "id": "cmpl_2",
            "choices": [{
                "message": {"reasoning": "fast thoughts", "content": "done"},
                "finish_reason": "stop"
            }]
        });
        let response = decode_reply("cerebras", "m", raw).unwrap();
        assert_eq!(response.thinking(), "fast thoughts");
    }

    async fn run_decoder(payloads: Vec<String>) -> Vec<StreamEvent> {
        use futures::StreamExt;
        let cancel = CancellationToken::new();
        let (tx, stream) = ChatStream::channel(cancel);
        let mut decoder = ChunkDecoder::new("kimi".into(), "kimi-k2".into());
        let producer = tokio::spawn(async move {
            for data in payloads {
                let event = SseEvent { event: None, data };
                if decoder.on_event(event, &tx).await.is_break() {
                    break;
                }
            }
            decoder.on_eof(&tx).await;
        });
        let collected: Vec<StreamEvent> = stream.map(Result::unwrap).collect().await;
        producer.await.unwrap();
        collected
    }

    fn chunk(delta: Value, finish: Option<&str>) -> String {
        json!({
            "id": "cmpl_s",
            "choices": [{"delta": delta, "finish_reason": finish}],
        })
        .to_string()
    }

    #[tokio::test]
    async fn split_arguments_accumulate_identically() {
        let payloads = vec![
            chunk(
                json!({"tool_calls": [{"index": 0, "id": "call_1", "type": "function",
                       "function": {"name": "glob", "arguments": "{\"pat"}}]}),
                None,
            ),
            chunk(
                json!({"tool_calls": [{"index": 0, "function": {"arguments": "tern\":\"*.rs\"}"}}]}),
                None,
            ),
            chunk(json!({}), Some("tool_calls")),
            "[DONE]".to_string(),
        ];
        let collected = run_decoder(payloads).await;

        let deltas: Vec<&str> = collected
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCallDelta { arguments, .. } => Some(arguments.as_str()),
                _ => None,
            })
            .collect();
        // Each delta carries the accumulated buffer.
        assert_eq!(deltas, vec!["{\"pat", "{\"pattern\":\"*.rs\"}"]);

        match collected.last().unwrap() {
            StreamEvent::Finish { finish_reason, response, .. } => {
                assert_eq!(*finish_reason, FinishReason::ToolCalls);
                assert_eq!(
                    response.tool_calls()[0].function.arguments,
                    "{\"pattern\":\"*.rs\"}"
                );
            }
            other => panic!("expected finish, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn id_and_ordinal_keying_work_without_index() {
        // id-keyed deltas
        let payloads = vec![
            chunk(
                json!({"tool_calls": [{"id": "call_a", "function": {"name": "grep", "arguments": "{\"q\":"}}]}),
                None,
            ),
            chunk(
                json!({"tool_calls": [{"id": "call_a", "function": {"arguments": "\"x\"}"}}]}),
                None,
            ),
            chunk(json!({}), Some("tool_calls")),
            "[DONE]".to_string(),
        ];
        let collected = run_decoder(payloads).await;
        match collected.last().unwrap() {
            StreamEvent::Finish { response, .. } => {
                assert_eq!(response.tool_calls()[0].function.arguments, "{\"q\":\"x\"}");
            }
            other => panic!("expected finish, got {:?}", other),
        }

        // ordinal fallback: neither index nor id, two calls in one chunk
        let payloads = vec![
            chunk(
                json!({"tool_calls": [
                    {"function": {"name": "glob", "arguments": "{}"}},
                    {"function": {"name": "grep", "arguments": "{}"}}
                ]}),
                Some("tool_calls"),
            ),
            "[DONE]".to_string(),
        ];
        let collected = run_decoder(payloads).await;
        match collected.last().unwrap() {
            StreamEvent::Finish { response, .. } => {
                let names: Vec<&str> = response
                    .tool_calls()
                    .iter()
                    .map(|c| c.function.name.as_str())
                    .collect();
                assert_eq!(names, vec!["glob", "grep"]);
            }
            other => panic!("expected finish, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn usage_only_final_chunk_updates_finish_usage() {
        let payloads = vec![
            chunk(json!({"content": "hi"}), None),
            chunk(json!({}), Some("stop")),
            json!({"id": "cmpl_s", "choices": [],
                   "usage": {"prompt_tokens": 11, "completion_tokens": 2, "total_tokens": 13}})
                .to_string(),
            "[DONE]".to_string(),
        ];
        let collected = run_decoder(payloads).await;
        match collected.last().unwrap() {
            StreamEvent::Finish { usage, .. } => {
                assert_eq!(usage.input_tokens, 11);
                assert_eq!(usage.total_tokens, 13);
            }
            other => panic!("expected finish, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn reasoning_channel_brackets_and_survives_to_response() {
        let payloads = vec![
            chunk(json!({"reasoning_content": "think"}), None),
            chunk(json!({"content": "answer"}), None),
            chunk(json!({}), Some("stop")),
            "[DONE]".to_string(),
        ];
        let collected = run_decoder(payloads).await;

        let kinds: Vec<&str> = collected
            .iter()
            .map(|e| match e {
                StreamEvent::ReasoningStart { .. } => "rs",
                StreamEvent::ReasoningDelta { .. } => "rd",
                StreamEvent::ReasoningEnd { .. } => "re",
                StreamEvent::TextStart { .. } => "ts",
                StreamEvent::TextDelta { .. } => "td",
                StreamEvent::TextEnd { .. } => "te",
                StreamEvent::StepFinish { .. } => "sf",
                StreamEvent::Finish { .. } => "f",
                _ => "o",
            })
            .collect();
        assert_eq!(kinds, vec!["rs", "rd", "re", "ts", "td", "te", "sf", "f"]);

        match collected.last().unwrap() {
            StreamEvent::Finish { response, .. } => {
                assert_eq!(response.thinking(), "think");
                assert_eq!(response.text(), "answer");
            }
            other => panic!("expected finish, got {:?}", other),
        }
    }
}
