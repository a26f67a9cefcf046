//! Wire-protocol adapters.
//!
//! Each adapter maps the canonical model onto one dialect and back, for
//! both unary and streaming calls. The shared plumbing here handles
//! authenticated HTTP with cancellation, HTTP error classification, and
//! the SSE read loop.

use std::ops::ControlFlow;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::LLMError;
use crate::sse::{SseEvent, SseLineSplitter, SseParser};
use crate::stream::StreamSender;

pub mod anthropic;
pub mod openai;
pub mod openai_compat;

pub use anthropic::AnthropicMessages;
pub use openai::OpenAIResponses;
pub use openai_compat::OpenAICompat;

/// Normalize a configured base URL: trailing slashes stripped.
pub(crate) fn normalize_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

/// Execute an HTTP request, racing it against cancellation.
pub(crate) async fn execute(
    provider: &str,
    cancel: &CancellationToken,
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response, LLMError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(LLMError::cancelled(provider)),
        result = request.send() => result.map_err(|err| annotate(provider, err.into())),
    }
}

/// Map a non-success response to the error taxonomy, consuming the body.
pub(crate) async fn check_status(
    provider: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, LLMError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await.unwrap_or_default();
    let raw: Option<Value> = serde_json::from_str(&body).ok();
    let message = extract_error_message(raw.as_ref(), &body);
    Err(LLMError::from_http_status(
        provider,
        status.as_u16(),
        message,
        retry_after.as_deref(),
        raw,
    ))
}

/// Pull the human-readable message out of the common provider error shapes:
/// `{"error": {"message": ...}}`, `{"error": "..."}` and `{"message": ...}`.
fn extract_error_message(raw: Option<&Value>, body: &str) -> String {
    if let Some(raw) = raw {
        if let Some(msg) = raw
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
        {
            return msg.to_string();
        }
        if let Some(msg) = raw.get("error").and_then(Value::as_str) {
            return msg.to_string();
        }
        if let Some(msg) = raw.get("message").and_then(Value::as_str) {
            return msg.to_string();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "no error body".to_string()
    } else {
        trimmed.chars().take(512).collect()
    }
}

fn annotate(provider: &str, err: LLMError) -> LLMError {
    match err {
        LLMError::Stream(mut d) => {
            d.provider = provider.to_string();
            LLMError::Stream(d)
        }
        LLMError::RequestTimeout(mut d) => {
            d.provider = provider.to_string();
            LLMError::RequestTimeout(d)
        }
        other => other,
    }
}

/// Media type from a file extension; adapters inline local images as
/// `data:` URLs.
pub(crate) fn infer_media_type(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or_default().to_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

pub(crate) fn data_url(media_type: &str, data: &[u8]) -> String {
    use base64::Engine as _;
    format!(
        "data:{};base64,{}",
        media_type,
        base64::engine::general_purpose::STANDARD.encode(data)
    )
}

pub(crate) fn base64_encode(data: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Read a local image referenced by path for inlining.
pub(crate) fn read_local_image(provider: &str, path: &str) -> Result<(String, Vec<u8>), LLMError> {
    let data = std::fs::read(path).map_err(|err| {
        LLMError::configuration(provider, format!("cannot read image {:?}: {}", path, err))
    })?;
    Ok((infer_media_type(path).to_string(), data))
}

/// Adapter-specific interpretation of a dispatched SSE event.
#[async_trait]
pub(crate) trait SseDecoder: Send {
    /// Handle one event; `Break` ends the read loop (terminal event seen).
    async fn on_event(&mut self, event: SseEvent, tx: &StreamSender) -> ControlFlow<()>;

    /// The server closed the connection without a terminal event.
    async fn on_eof(&mut self, tx: &StreamSender);
}

/// Read an SSE response body to completion, feeding dispatched events to
/// the decoder. Stops on cancellation, decoder break, transport error, or
/// EOF.
pub(crate) async fn drive_sse<D: SseDecoder>(
    provider: &str,
    response: reqwest::Response,
    tx: StreamSender,
    mut decoder: D,
) {
    let mut splitter = SseLineSplitter::new();
    let mut parser = SseParser::new();
    let mut body = response.bytes_stream();

    loop {
        let chunk = tokio::select! {
            _ = tx.cancellation().cancelled() => {
                let _ = tx.send_err(LLMError::cancelled(provider)).await;
                return;
            }
            chunk = body.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                for line in splitter.push(&bytes) {
                    if let Some(event) = parser.push_line(&line) {
                        if decoder.on_event(event, &tx).await.is_break() {
                            return;
                        }
                    }
                }
            }
            Some(Err(err)) => {
                let _ = tx
                    .send_err(LLMError::stream(provider, format!("stream read failed: {}", err)))
                    .await;
                return;
            }
            None => {
                // Flush a trailing unterminated line, then let the decoder
                // settle open state.
                if let Some(line) = splitter.finish() {
                    if let Some(event) = parser.push_line(&line) {
                        if decoder.on_event(event, &tx).await.is_break() {
                            return;
                        }
                    }
                }
                if let Some(event) = parser.push_line("") {
                    if decoder.on_event(event, &tx).await.is_break() {
                        return;
                    }
                }
                decoder.on_eof(&tx).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_normalization() {
        assert_eq!(normalize_base_url("https://api.openai.com/v1/"), "https://api.openai.com/v1");
        assert_eq!(normalize_base_url("https://api.openai.com/v1"), "https://api.openai.com/v1");
    }

    #[test]
    fn error_message_extraction() {
        let nested: Value = serde_json::json!({"error": {"message": "bad model"}});
        assert_eq!(extract_error_message(Some(&nested), ""), "bad model");

        let flat: Value = serde_json::json!({"error": "overloaded"});
        assert_eq!(extract_error_message(Some(&flat), ""), "overloaded");

        let top: Value = serde_json::json!({"message": "nope"});
        assert_eq!(extract_error_message(Some(&top), ""), "nope");

        assert_eq!(extract_error_message(None, "  plain text  "), "plain text");
        assert_eq!(extract_error_message(None, ""), "no error body");
    }

    #[test]
    fn media_types() {
        assert_eq!(infer_media_type("a/b/cat.PNG"), "image/png");
        assert_eq!(infer_media_type("x.jpeg"), "image/jpeg");
        assert_eq!(infer_media_type("noext"), "application/octet-stream");
    }
}
