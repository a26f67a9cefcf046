//! Reduces a semantic event stream back into a [`ChatResponse`].
//!
//! Adapters use this for providers that must be driven in streaming mode
//! even for unary calls, and tests use it to pin the stream/unary
//! equivalence property.

use crate::chat::{
    ChatMessage, ChatResponse, ChatRole, ContentPart, FinishReason, StreamEvent, Thinking,
};
use crate::{ToolCall, Usage};

#[derive(Debug)]
enum Segment {
    Text { id: String, buf: String },
    Reasoning { id: String, buf: String },
    ToolCall { id: String, name: String, arguments: String },
}

/// Folds [`StreamEvent`]s in arrival order into final response state.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    provider: String,
    model: String,
    id: String,
    segments: Vec<Segment>,
    finish_reason: Option<FinishReason>,
    finish_reason_raw: Option<String>,
    usage: Usage,
    final_response: Option<ChatResponse>,
}

impl StreamAccumulator {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn set_response_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    pub fn set_finish(&mut self, reason: FinishReason, raw: Option<String>) {
        self.finish_reason = Some(reason);
        self.finish_reason_raw = raw;
    }

    pub fn merge_usage(&mut self, usage: &Usage) {
        self.usage.merge(usage);
    }

    /// Fold one event into the accumulated state.
    pub fn absorb(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::TextStart { id } => {
                self.segments.push(Segment::Text { id: id.clone(), buf: String::new() });
            }
            StreamEvent::TextDelta { id, delta } => {
                if let Some(buf) = self.text_buf(id) {
                    buf.push_str(delta);
                } else {
                    // Tolerate providers that skip the start bracket.
                    self.segments.push(Segment::Text { id: id.clone(), buf: delta.clone() });
                }
            }
            StreamEvent::ReasoningStart { id } => {
                self.segments.push(Segment::Reasoning { id: id.clone(), buf: String::new() });
            }
            StreamEvent::ReasoningDelta { id, delta } => {
                if let Some(buf) = self.reasoning_buf(id) {
                    buf.push_str(delta);
                } else {
                    self.segments.push(Segment::Reasoning { id: id.clone(), buf: delta.clone() });
                }
            }
            StreamEvent::ToolCallStart { id, name, .. } => {
                self.segments.push(Segment::ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: String::new(),
                });
            }
            // Deltas carry the accumulated buffer, so assignment (not
            // append) keeps us in sync.
            StreamEvent::ToolCallDelta { id, name, arguments }
            | StreamEvent::ToolCallEnd { id, name, arguments } => {
                match self.tool_call_mut(id) {
                    Some((seg_name, args)) => {
                        if !name.is_empty() {
                            *seg_name = name.clone();
                        }
                        *args = arguments.clone();
                    }
                    None => self.segments.push(Segment::ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: arguments.clone(),
                    }),
                }
            }
            StreamEvent::StepFinish { finish_reason } => {
                self.finish_reason = Some(*finish_reason);
            }
            StreamEvent::Finish { finish_reason, usage, response } => {
                self.finish_reason = Some(*finish_reason);
                self.usage.merge(usage);
                self.final_response = Some((**response).clone());
            }
            StreamEvent::TextEnd { .. }
            | StreamEvent::ReasoningEnd { .. }
            | StreamEvent::StreamStart
            | StreamEvent::ProviderEvent { .. } => {}
        }
    }

    fn text_buf(&mut self, id: &str) -> Option<&mut String> {
        self.segments.iter_mut().rev().find_map(|seg| match seg {
            Segment::Text { id: seg_id, buf } if seg_id == id => Some(buf),
            _ => None,
        })
    }

    fn reasoning_buf(&mut self, id: &str) -> Option<&mut String> {
        self.segments.iter_mut().rev().find_map(|seg| match seg {
            Segment::Reasoning { id: seg_id, buf } if seg_id == id => Some(buf),
            _ => None,
        })
    }

    fn tool_call_mut(&mut self, id: &str) -> Option<(&mut String, &mut String)> {
        self.segments.iter_mut().rev().find_map(|seg| match seg {
            Segment::ToolCall { id: seg_id, name, arguments } if seg_id == id => {
                Some((name, arguments))
            }
            _ => None,
        })
    }

    /// Whether a `Finish` event already delivered the provider-built
    /// response.
    pub fn has_final_response(&self) -> bool {
        self.final_response.is_some()
    }

    /// Produce the final response: the one delivered by `Finish` when
    /// present, otherwise assembled from accumulated segments.
    pub fn into_response(self) -> ChatResponse {
        if let Some(response) = self.final_response {
            return response;
        }

        let mut content = Vec::new();
        let mut saw_tool_call = false;
        for segment in self.segments {
            match segment {
                Segment::Reasoning { buf, .. } => {
                    if !buf.is_empty() {
                        content.push(ContentPart::Thinking {
                            thinking: Thinking { text: buf, ..Default::default() },
                        });
                    }
                }
                Segment::Text { buf, .. } => {
                    if !buf.is_empty() {
                        content.push(ContentPart::Text { text: buf });
                    }
                }
                Segment::ToolCall { id, name, arguments } => {
                    saw_tool_call = true;
                    content.push(ContentPart::ToolCall {
                        call: ToolCall::function(id, name, arguments),
                    });
                }
            }
        }

        let finish_reason = self.finish_reason.unwrap_or(if saw_tool_call {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        });

        ChatResponse {
            id: self.id,
            provider: self.provider,
            model: self.model,
            message: ChatMessage { role: ChatRole::Assistant, content },
            finish_reason,
            finish_reason_raw: self.finish_reason_raw,
            usage: self.usage.normalized(),
            raw: None,
        }
    }
}
