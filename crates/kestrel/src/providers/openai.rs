//! OpenAI Responses API adapter.
//!
//! Requests separate `instructions` (system + developer text) from an
//! ordered `input` item list; tool schemas are strictified because the
//! Responses API runs tools in strict mode.

use std::collections::HashMap;
use std::ops::ControlFlow;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::chat::{
    ChatMessage, ChatProvider, ChatRequest, ChatResponse, ChatRole, ContentPart, FinishReason,
    ImageSource, ResponseFormat, StreamEvent, ToolChoice,
};
use crate::error::LLMError;
use crate::providers::{self, SseDecoder};
use crate::sse::SseEvent;
use crate::stream::{ChatStream, StreamSender};
use crate::{ToolCall, Usage};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Configuration for the Responses adapter.
#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    /// Overrides `https://api.openai.com/v1`; trailing slashes stripped.
    pub base_url: Option<String>,
}

/// Client for the OpenAI Responses API.
pub struct OpenAIResponses {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIResponses {
    pub fn new(config: OpenAIConfig) -> Self {
        Self {
            api_key: config.api_key,
            base_url: providers::normalize_base_url(
                config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL),
            ),
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/responses", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> Result<Value, LLMError> {
        let mut instructions = Vec::new();
        let mut input = Vec::new();

        for message in &request.messages {
            match message.role {
                ChatRole::System | ChatRole::Developer => {
                    let text = message.text();
                    if !text.is_empty() {
                        instructions.push(text);
                    }
                }
                ChatRole::User => input.push(self.user_item(message)?),
                ChatRole::Assistant => self.assistant_items(message, &mut input),
                ChatRole::Tool => {
                    for result in message.tool_results() {
                        input.push(json!({
                            "type": "function_call_output",
                            "call_id": result.tool_call_id,
                            "output": result.content_string(),
                        }));
                    }
                }
            }
        }

        let mut body = json!({
            "model": request.model,
            "input": input,
            "stream": stream,
        });
        let obj = body.as_object_mut().unwrap();

        if !instructions.is_empty() {
            obj.insert("instructions".into(), Value::String(instructions.join("\n\n")));
        }
        if !request.tools.is_empty() && request.tool_choice != Some(ToolChoice::None) {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|tool| {
                    let mut parameters = tool.function.parameters.clone();
                    strictify_schema(&mut parameters);
                    json!({
                        "type": "function",
                        "name": tool.function.name,
                        "description": tool.function.description,
                        "parameters": parameters,
                        "strict": true,
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
            obj.insert("max_output_tokens".into(), json!(max_tokens));
        }
        if let Some(effort) = request.reasoning_effort {
            obj.insert("reasoning".into(), json!({"effort": effort.to_string()}));
        }
        match &request.response_format {
            Some(ResponseFormat::Json) => {
                obj.insert("text".into(), json!({"format": {"type": "json_object"}}));
            }
            Some(ResponseFormat::JsonSchema { schema }) => {
                obj.insert(
                    "text".into(),
                    json!({"format": {
                        "type": "json_schema",
                        "name": "response",
                        "schema": schema,
                        "strict": true,
                    }}),
                );
            }
            None => {}
        }
        if let Some(Value::Object(options)) = request.options_for(self.name()) {
            for (key, value) in options {
                obj.insert(key.clone(), value.clone());
            }
        }

        Ok(body)
    }

    fn user_item(&self, message: &ChatMessage) -> Result<Value, LLMError> {
        let mut content = Vec::new();
        for part in &message.content {
            match part {
                ContentPart::Text { text } => {
                    content.push(json!({"type": "input_text", "text": text}));
                }
                ContentPart::Image { source } => {
                    let image_url = match source {
                        ImageSource::Url(url) => url.clone(),
                        ImageSource::Path(path) => {
                            let (media_type, data) = providers::read_local_image(self.name(), path)?;
                            providers::data_url(&media_type, &data)
                        }
                        ImageSource::Inline { data, media_type } => {
                            providers::data_url(media_type, data)
                        }
                    };
                    content.push(json!({"type": "input_image", "image_url": image_url}));
                }
                ContentPart::Audio { .. } => {
                    return Err(LLMError::configuration(
                        self.name(),
                        "audio content is not supported by the responses adapter",
                    ));
                }
                ContentPart::Document { .. } => {
                    return Err(LLMError::configuration(
                        self.name(),
                        "document content is not supported by the responses adapter",
                    ));
                }
                // Tool plumbing is carried by dedicated items.
                ContentPart::ToolCall { .. }
                | ContentPart::ToolResult { .. }
                | ContentPart::Thinking { .. } => {}
            }
        }
        Ok(json!({"type": "message", "role": "user", "content": content}))
    }

    fn assistant_items(&self, message: &ChatMessage, input: &mut Vec<Value>) {
        let text = message.text();
        if !text.is_empty() {
            input.push(json!({
                "type": "message",
                "role": "assistant",
                "content": [{"type": "output_text", "text": text}],
            }));
        }
        for call in message.tool_calls() {
            input.push(json!({
                "type": "function_call",
                "call_id": call.id,
                "name": call.function.name,
                "arguments": call.function.arguments,
            }));
        }
    }
}

/// Recursively force strict mode onto an object schema: closed objects,
/// every property required (sorted), nested objects/arrays/combinators
/// included. Idempotent.
pub fn strictify_schema(schema: &mut Value) {
    let Some(obj) = schema.as_object_mut() else {
        return;
    };

    let is_object_schema = obj.get("type").and_then(Value::as_str) == Some("object")
        || obj.contains_key("properties");
    if is_object_schema {
        obj.insert("additionalProperties".into(), Value::Bool(false));
        let mut keys: Vec<String> = obj
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        obj.insert(
            "required".into(),
            Value::Array(keys.into_iter().map(Value::String).collect()),
        );
    }

    if let Some(props) = obj.get_mut("properties").and_then(Value::as_object_mut) {
        for value in props.values_mut() {
            strictify_schema(value);
        }
    }
    if let Some(items) = obj.get_mut("items") {
        match items {
            Value::Array(list) => list.iter_mut().for_each(strictify_schema),
            other => strictify_schema(other),
        }
    }
    for combinator in ["anyOf", "oneOf", "allOf"] {
        if let Some(Value::Array(list)) = obj.get_mut(combinator) {
            list.iter_mut().for_each(strictify_schema);
        }
    }
    for defs in ["$defs", "definitions"] {
        if let Some(defs) = obj.get_mut(defs).and_then(Value::as_object_mut) {
            for value in defs.values_mut() {
                strictify_schema(value);
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResponsesReply {
    id: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    output: Vec<OutputItem>,
    #[serde(default)]
    usage: Option<ResponsesUsage>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputItem {
    Message {
        #[serde(default)]
        content: Vec<OutputContent>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputContent {
    OutputText {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize, Default)]
struct ResponsesUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
    #[serde(default)]
    output_tokens_details: Option<TokenDetails>,
    #[serde(default)]
    input_tokens_details: Option<TokenDetails>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenDetails {
    #[serde(default)]
    reasoning_tokens: Option<u64>,
    #[serde(default)]
    cached_tokens: Option<u64>,
}

impl ResponsesUsage {
    fn into_usage(self) -> Usage {
        Usage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_tokens: self.total_tokens,
            reasoning_tokens: self.output_tokens_details.and_then(|d| d.reasoning_tokens),
            cache_read_tokens: self.input_tokens_details.and_then(|d| d.cached_tokens),
            cache_write_tokens: None,
        }
        .normalized()
    }
}

fn decode_reply(provider: &str, model: &str, raw: Value) -> Result<ChatResponse, LLMError> {
    let reply: ResponsesReply = serde_json::from_value(raw.clone()).map_err(|err| {
        LLMError::stream(provider, format!("cannot decode responses payload: {}", err))
    })?;

    let mut content = Vec::new();
    let mut saw_call = false;
    for item in reply.output {
        match item {
            OutputItem::Message { content: parts } => {
                for part in parts {
                    if let OutputContent::OutputText { text } = part {
                        content.push(ContentPart::Text { text });
                    }
                }
            }
            OutputItem::FunctionCall { call_id, name, arguments } => {
                saw_call = true;
                content.push(ContentPart::ToolCall {
                    call: ToolCall::function(call_id, name, arguments),
                });
            }
            OutputItem::Other => {}
        }
    }

    Ok(ChatResponse {
        id: reply.id,
        provider: provider.to_string(),
        model: reply.model.unwrap_or_else(|| model.to_string()),
        message: ChatMessage { role: ChatRole::Assistant, content },
        finish_reason: if saw_call { FinishReason::ToolCalls } else { FinishReason::Stop },
        finish_reason_raw: reply.status,
        usage: reply.usage.unwrap_or_default().into_usage(),
        raw: Some(raw),
    })
}

#[async_trait]
impl ChatProvider for OpenAIResponses {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
    ) -> Result<ChatResponse, LLMError> {
        let body = self.build_body(request, false)?;
        let response = providers::execute(self.name(), cancel, self.request(&body)).await?;
        let response = providers::check_status(self.name(), response).await?;
        let raw: Value = response
            .json()
            .await
            .map_err(|err| LLMError::stream(self.name(), format!("bad response body: {}", err)))?;
        decode_reply(self.name(), &request.model, raw)
    }

    async fn stream(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
    ) -> Result<ChatStream, LLMError> {
        let body = self.build_body(request, true)?;
        let response = providers::execute(self.name(), cancel, self.request(&body)).await?;
        let response = providers::check_status(self.name(), response).await?;

        let (tx, stream) = ChatStream::channel(cancel.child_token());
        let decoder = ResponsesDecoder::new(self.name().to_string(), request.model.clone());
        let provider = self.name().to_string();
        tokio::spawn(async move {
            tx.send(StreamEvent::StreamStart).await;
            providers::drive_sse(&provider, response, tx, decoder).await;
        });
        Ok(stream)
    }
}

#[derive(Debug, Default)]
struct CallState {
    call_id: String,
    name: String,
    buf: String,
    ended: bool,
}

/// Streaming decoder for Responses SSE events. Tool-call deltas are keyed
/// by `call_id` with the emitting item id as lookup key.
struct ResponsesDecoder {
    provider: String,
    model: String,
    open_texts: Vec<String>,
    calls: HashMap<String, CallState>,
    finished: bool,
}

impl ResponsesDecoder {
    fn new(provider: String, model: String) -> Self {
        Self {
            provider,
            model,
            open_texts: Vec::new(),
            calls: HashMap::new(),
            finished: false,
        }
    }

    async fn close_open_texts(&mut self, tx: &StreamSender) {
        for id in std::mem::take(&mut self.open_texts) {
            tx.send(StreamEvent::TextEnd { id }).await;
        }
    }

    async fn handle(&mut self, data: Value, tx: &StreamSender) -> ControlFlow<()> {
        let kind = data.get("type").and_then(Value::as_str).unwrap_or_default();
        match kind {
            "response.output_item.added" => {
                let item = data.get("item").cloned().unwrap_or_default();
                if item.get("type").and_then(Value::as_str) == Some("function_call") {
                    let item_id = item
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let call_id = item
                        .get("call_id")
                        .and_then(Value::as_str)
                        .unwrap_or(&item_id)
                        .to_string();
                    let name = item
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    tx.send(StreamEvent::ToolCallStart {
                        id: call_id.clone(),
                        name: name.clone(),
                        call_type: "function".into(),
                    })
                    .await;
                    self.calls
                        .insert(item_id, CallState { call_id, name, ..Default::default() });
                } else {
                    tx.send_passthrough(data);
                }
            }
            "response.output_text.delta" => {
                let item_id = data
                    .get("item_id")
                    .and_then(Value::as_str)
                    .unwrap_or("output_text")
                    .to_string();
                let delta = data
                    .get("delta")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if !self.open_texts.contains(&item_id) {
                    self.open_texts.push(item_id.clone());
                    tx.send(StreamEvent::TextStart { id: item_id.clone() }).await;
                }
                tx.send(StreamEvent::TextDelta { id: item_id, delta }).await;
            }
            "response.output_text.done" => {
                let item_id = data
                    .get("item_id")
                    .and_then(Value::as_str)
                    .unwrap_or("output_text")
                    .to_string();
                if let Some(pos) = self.open_texts.iter().position(|id| id == &item_id) {
                    self.open_texts.remove(pos);
                    tx.send(StreamEvent::TextEnd { id: item_id }).await;
                }
            }
            "response.function_call_arguments.delta" => {
                let item_id = data.get("item_id").and_then(Value::as_str).unwrap_or_default();
                let delta = data.get("delta").and_then(Value::as_str).unwrap_or_default();
                if let Some(state) = self.calls.get_mut(item_id) {
                    state.buf.push_str(delta);
                    tx.send(StreamEvent::ToolCallDelta {
                        id: state.call_id.clone(),
                        name: state.name.clone(),
                        arguments: state.buf.clone(),
                    })
                    .await;
                }
            }
            "response.output_item.done" => {
                let item = data.get("item").cloned().unwrap_or_default();
                if item.get("type").and_then(Value::as_str) == Some("function_call") {
                    let item_id = item.get("id").and_then(Value::as_str).unwrap_or_default();
                    let final_args = item
                        .get("arguments")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    if let Some(state) = self.calls.get_mut(item_id) {
                        if let Some(args) = final_args {
                            state.buf = args;
                        }
                        state.ended = true;
                        tx.send(StreamEvent::ToolCallEnd {
                            id: state.call_id.clone(),
                            name: state.name.clone(),
                            arguments: state.buf.clone(),
                        })
                        .await;
                    }
                } else {
                    tx.send_passthrough(data);
                }
            }
            "response.completed" => {
                self.close_open_texts(tx).await;
                for state in self.calls.values_mut() {
                    if !state.ended {
                        state.ended = true;
                        tx.send(StreamEvent::ToolCallEnd {
                            id: state.call_id.clone(),
                            name: state.name.clone(),
                            arguments: state.buf.clone(),
                        })
                        .await;
                    }
                }
                let nested = data.get("response").cloned().unwrap_or_default();
                match decode_reply(&self.provider, &self.model, nested) {
                    Ok(response) => {
                        self.finished = true;
                        tx.send(StreamEvent::StepFinish { finish_reason: response.finish_reason })
                            .await;
                        tx.send(StreamEvent::Finish {
                            finish_reason: response.finish_reason,
                            usage: response.usage.clone(),
                            response: Box::new(response),
                        })
                        .await;
                        return ControlFlow::Break(());
                    }
                    Err(err) => {
                        tx.send_err(err).await;
                        return ControlFlow::Break(());
                    }
                }
            }
            "response.failed" | "error" => {
                let message = data
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("provider reported a stream failure");
                tx.send_err(LLMError::stream(&self.provider, message)).await;
                return ControlFlow::Break(());
            }
            _ => {
                tx.send_passthrough(data);
            }
        }
        ControlFlow::Continue(())
    }
}

#[async_trait]
impl SseDecoder for ResponsesDecoder {
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
                .send_err(LLMError::stream(
                    &self.provider,
                    "stream ended before response.completed",
                ))
                .await;
        }
    }
}
