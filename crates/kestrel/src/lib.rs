//! Kestrel is a unified transport for driving Large Language Model providers.
//!
//! # Overview
//! This crate normalizes three wire protocols (OpenAI Responses, Anthropic
//! Messages, OpenAI-compatible Chat Completions) into one canonical
//! request/response and streaming model. It supports:
//!
//! - Chat-based interactions with tool calling
//! - A single semantic event stream across providers
//! - Typed errors carrying retryability
//! - Retry with exponential backoff and Retry-After honoring
//!
//! # Architecture
//! The crate is organized into modules that handle different aspects of LLM
//! interactions: the canonical model lives in [`chat`], providers under
//! [`providers`], and the client with its middleware chain in [`client`].

use serde::{Deserialize, Serialize};

/// Chat-based interactions with language models and the canonical data model
pub mod chat;

/// Provider routing and the middleware onion
pub mod client;

/// Error types and handling
pub mod error;

/// Middleware traits wrapping complete and stream
pub mod middleware;

/// Wire-protocol adapters
pub mod providers;

/// Retry with exponential backoff for unary calls
pub mod retry;

/// Line-oriented server-sent-event parsing
pub mod sse;

/// The fan-out event stream primitive
pub mod stream;

pub use chat::ChatProvider;
pub use client::LLMClient;
pub use error::LLMError;

/// Represents a tool call requested by the model.
#[derive(Debug, Deserialize, Serialize, Clone, Eq, PartialEq)]
pub struct ToolCall {
    /// The ID of the tool call.
    pub id: String,
    /// The type of the tool call (usually "function").
    #[serde(rename = "type")]
    pub call_type: String,
    /// The function to call.
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// FunctionCall contains details about which function to call and with what arguments.
///
/// Arguments are kept as the raw JSON string the provider produced; only the
/// tool registry ever parses them.
#[derive(Debug, Deserialize, Serialize, Clone, Eq, PartialEq)]
pub struct FunctionCall {
    /// The name of the function to call.
    pub name: String,
    /// The arguments to pass to the function, serialized as a JSON string.
    pub arguments: String,
}

/// Token usage reported by a provider, supporting multiple JSON spellings.
#[derive(Debug, Serialize, Deserialize, Clone, Eq, PartialEq, Default)]
pub struct Usage {
    /// Number of input tokens.
    #[serde(
        alias = "prompt_tokens", // OpenAI-compatible
        alias = "input_tokens"   // Anthropic, OpenAI Responses
    )]
    pub input_tokens: u64,
    /// Number of output tokens.
    #[serde(
        alias = "completion_tokens", // OpenAI-compatible
        alias = "output_tokens"      // Anthropic, OpenAI Responses
    )]
    pub output_tokens: u64,
    /// Total tokens; derived from input + output when the provider omits it.
    #[serde(default)]
    pub total_tokens: u64,
    /// Tokens spent on reasoning/thinking, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
    /// Tokens read from the prompt cache, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
    /// Tokens written to the prompt cache, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<u64>,
}

impl Usage {
    /// Fill in `total_tokens` when the provider did not report it.
    pub fn normalized(mut self) -> Self {
        if self.total_tokens == 0 {
            self.total_tokens = self.input_tokens + self.output_tokens;
        }
        self
    }

    /// Merge a later usage report into this one, keeping the larger counts.
    pub fn merge(&mut self, other: &Usage) {
        self.input_tokens = self.input_tokens.max(other.input_tokens);
        self.output_tokens = self.output_tokens.max(other.output_tokens);
        self.total_tokens = self.total_tokens.max(other.total_tokens);
        if other.reasoning_tokens.is_some() {
            self.reasoning_tokens = other.reasoning_tokens;
        }
        if other.cache_read_tokens.is_some() {
            self.cache_read_tokens = other.cache_read_tokens;
        }
        if other.cache_write_tokens.is_some() {
            self.cache_write_tokens = other.cache_write_tokens;
        }
    }
}
