use std::fmt;
use std::time::{Duration, SystemTime};

use serde_json::Value;

/// Detail shared by every [`LLMError`] variant.
#[derive(Debug, Clone, Default)]
pub struct ErrorDetails {
    /// Canonical provider key the error originated from.
    pub provider: String,
    /// HTTP status code, when the error came off the wire.
    pub status_code: Option<u16>,
    /// Human-readable message, usually the provider's own.
    pub message: String,
    /// Whether the retry engine may re-attempt the request.
    pub retryable: bool,
    /// Provider-mandated wait before retrying, from `Retry-After`.
    pub retry_after: Option<Duration>,
    /// Raw error payload, when one was decodable.
    pub raw: Option<Value>,
}

impl ErrorDetails {
    fn new(provider: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            provider: provider.into(),
            message: message.into(),
            retryable,
            ..Default::default()
        }
    }
}

/// Error types that can occur when interacting with LLM providers.
///
/// The set is closed: adapters classify everything they see into one of
/// these variants, and the retry engine keys off [`ErrorDetails::retryable`].
#[derive(Debug, Clone)]
pub enum LLMError {
    /// Local misconfiguration (bad base URL, unsupported content part, ...)
    Configuration(ErrorDetails),
    /// The provider rejected the request shape (400/422)
    InvalidRequest(ErrorDetails),
    /// Authentication failure (401, or key-related 400s)
    Authentication(ErrorDetails),
    /// Authenticated but not allowed (403)
    AccessDenied(ErrorDetails),
    /// Model or endpoint not found (404)
    NotFound(ErrorDetails),
    /// The provider timed out the request (408), or a deadline elapsed
    RequestTimeout(ErrorDetails),
    /// The request exceeded the model's context window (413, or 400 hints)
    ContextLength(ErrorDetails),
    /// The provider's safety system blocked the request
    ContentFilter(ErrorDetails),
    /// Out of quota or billing problem
    QuotaExceeded(ErrorDetails),
    /// Rate limited (429)
    RateLimit(ErrorDetails),
    /// Provider-side failure (5xx)
    Server(ErrorDetails),
    /// Any HTTP status without a dedicated variant
    UnknownHttp(ErrorDetails),
    /// Transport or mid-stream failure (connection drop, bad SSE payload,
    /// cancellation)
    Stream(ErrorDetails),
}

impl LLMError {
    /// The shared detail carried by every variant.
    pub fn details(&self) -> &ErrorDetails {
        match self {
            LLMError::Configuration(d)
            | LLMError::InvalidRequest(d)
            | LLMError::Authentication(d)
            | LLMError::AccessDenied(d)
            | LLMError::NotFound(d)
            | LLMError::RequestTimeout(d)
            | LLMError::ContextLength(d)
            | LLMError::ContentFilter(d)
            | LLMError::QuotaExceeded(d)
            | LLMError::RateLimit(d)
            | LLMError::Server(d)
            | LLMError::UnknownHttp(d)
            | LLMError::Stream(d) => d,
        }
    }

    /// Stable lower-snake name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            LLMError::Configuration(_) => "configuration",
            LLMError::InvalidRequest(_) => "invalid_request",
            LLMError::Authentication(_) => "authentication",
            LLMError::AccessDenied(_) => "access_denied",
            LLMError::NotFound(_) => "not_found",
            LLMError::RequestTimeout(_) => "request_timeout",
            LLMError::ContextLength(_) => "context_length",
            LLMError::ContentFilter(_) => "content_filter",
            LLMError::QuotaExceeded(_) => "quota_exceeded",
            LLMError::RateLimit(_) => "rate_limit",
            LLMError::Server(_) => "server",
            LLMError::UnknownHttp(_) => "unknown_http",
            LLMError::Stream(_) => "stream",
        }
    }

    pub fn retryable(&self) -> bool {
        self.details().retryable
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.details().retry_after
    }

    pub fn provider(&self) -> &str {
        &self.details().provider
    }

    pub fn status_code(&self) -> Option<u16> {
        self.details().status_code
    }

    /// Local configuration problem; never retryable.
    pub fn configuration(provider: impl Into<String>, message: impl Into<String>) -> Self {
        LLMError::Configuration(ErrorDetails::new(provider, message, false))
    }

    /// Transport or mid-stream failure. Retryable at the caller's
    /// discretion; streaming calls never retry automatically.
    pub fn stream(provider: impl Into<String>, message: impl Into<String>) -> Self {
        LLMError::Stream(ErrorDetails::new(provider, message, true))
    }

    /// Caller-initiated cancellation surfaced through the error channel.
    pub fn cancelled(provider: impl Into<String>) -> Self {
        LLMError::Stream(ErrorDetails::new(provider, "operation cancelled", false))
    }

    /// A deadline elapsed while talking to the provider.
    pub fn deadline(provider: impl Into<String>) -> Self {
        LLMError::RequestTimeout(ErrorDetails::new(provider, "request deadline exceeded", true))
    }

    /// True when this error is the cancellation sentinel from
    /// [`LLMError::cancelled`].
    pub fn is_cancellation(&self) -> bool {
        matches!(self, LLMError::Stream(d) if d.message == "operation cancelled")
    }

    /// Classify an HTTP error response into the taxonomy.
    ///
    /// `retry_after` is the raw `Retry-After` header value, parsed as
    /// integer seconds or an HTTP-date (past dates yield zero).
    pub fn from_http_status(
        provider: impl Into<String>,
        status: u16,
        message: impl Into<String>,
        retry_after: Option<&str>,
        raw: Option<Value>,
    ) -> Self {
        let provider = provider.into();
        let message = message.into();
        let retry_after = retry_after.and_then(|v| parse_retry_after(v, SystemTime::now()));
        let details = |retryable: bool| ErrorDetails {
            provider: provider.clone(),
            status_code: Some(status),
            message: message.clone(),
            retryable,
            retry_after,
            raw: raw.clone(),
        };

        match status {
            400 | 422 => {
                let lower = message.to_lowercase();
                if lower.contains("content filter") || lower.contains("safety") {
                    LLMError::ContentFilter(details(false))
                } else if lower.contains("context length") || lower.contains("too many tokens") {
                    LLMError::ContextLength(details(false))
                } else if lower.contains("quota") || lower.contains("billing") {
                    LLMError::QuotaExceeded(details(false))
                } else if lower.contains("not found") || lower.contains("does not exist") {
                    LLMError::NotFound(details(false))
                } else if lower.contains("unauthorized") || lower.contains("invalid key") {
                    LLMError::Authentication(details(false))
                } else {
                    LLMError::InvalidRequest(details(false))
                }
            }
            401 => LLMError::Authentication(details(false)),
            403 => LLMError::AccessDenied(details(false)),
            404 => LLMError::NotFound(details(false)),
            408 => LLMError::RequestTimeout(details(true)),
            413 => LLMError::ContextLength(details(false)),
            429 => LLMError::RateLimit(details(true)),
            500 | 502 | 503 | 504 => LLMError::Server(details(true)),
            _ => LLMError::UnknownHttp(details(true)),
        }
    }
}

/// Parse a `Retry-After` header value: integer seconds, or an HTTP-date.
/// A date in the past yields a zero duration.
pub fn parse_retry_after(value: &str, now: SystemTime) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = httpdate::parse_http_date(value).ok()?;
    Some(when.duration_since(now).unwrap_or(Duration::ZERO))
}

impl fmt::Display for LLMError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.details();
        match d.status_code {
            Some(code) => write!(
                f,
                "{} error from {} (HTTP {}): {}",
                self.kind(),
                d.provider,
                code,
                d.message
            ),
            None => write!(f, "{} error from {}: {}", self.kind(), d.provider, d.message),
        }
    }
}

impl std::error::Error for LLMError {}

impl From<reqwest::Error> for LLMError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LLMError::RequestTimeout(ErrorDetails::new("", err.to_string(), true))
        } else {
            LLMError::Stream(ErrorDetails::new("", err.to_string(), true))
        }
    }
}

impl From<url::ParseError> for LLMError {
    fn from(err: url::ParseError) -> Self {
        LLMError::configuration("", format!("error parsing provided url: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(status: u16, message: &str) -> LLMError {
        LLMError::from_http_status("openai", status, message, None, None)
    }

    #[test]
    fn status_table_maps_variants_and_retryability() {
        let cases: &[(u16, &'static str, bool)] = &[
            (400, "invalid_request", false),
            (401, "authentication", false),
            (403, "access_denied", false),
            (404, "not_found", false),
            (408, "request_timeout", true),
            (413, "context_length", false),
            (422, "invalid_request", false),
            (429, "rate_limit", true),
            (500, "server", true),
            (502, "server", true),
            (503, "server", true),
            (504, "server", true),
            (418, "unknown_http", true),
        ];
        for (status, kind, retryable) in cases {
            let err = classify(*status, "boom");
            assert_eq!(err.kind(), *kind, "status {}", status);
            assert_eq!(err.retryable(), *retryable, "status {}", status);
            assert_eq!(err.status_code(), Some(*status));
        }
    }

    #[test]
    fn message_refinement_applies_to_400_and_422() {
        for status in [400u16, 422] {
            assert_eq!(classify(status, "blocked by content filter").kind(), "content_filter");
            assert_eq!(classify(status, "Safety system refused").kind(), "content_filter");
            assert_eq!(classify(status, "maximum context length exceeded").kind(), "context_length");
            assert_eq!(classify(status, "too many tokens requested").kind(), "context_length");
            assert_eq!(classify(status, "monthly quota exhausted").kind(), "quota_exceeded");
            assert_eq!(classify(status, "billing hard limit").kind(), "quota_exceeded");
            assert_eq!(classify(status, "model not found").kind(), "not_found");
            assert_eq!(classify(status, "deployment does not exist").kind(), "not_found");
            assert_eq!(classify(status, "unauthorized for model").kind(), "authentication");
            assert_eq!(classify(status, "invalid key provided").kind(), "authentication");
            assert_eq!(classify(status, "missing field model").kind(), "invalid_request");
        }
        // Refinement is limited to 400/422.
        assert_eq!(classify(500, "blocked by content filter").kind(), "server");
    }

    #[test]
    fn retry_after_seconds_and_http_date() {
        let now = SystemTime::now();
        assert_eq!(parse_retry_after("17", now), Some(Duration::from_secs(17)));

        let future = now + Duration::from_secs(120);
        let value = httpdate::fmt_http_date(future);
        let parsed = parse_retry_after(&value, now).unwrap();
        // fmt_http_date has one-second resolution
        assert!(parsed >= Duration::from_secs(118) && parsed <= Duration::from_secs(121));

        let past = now - Duration::from_secs(3600);
        let value = httpdate::fmt_http_date(past);
        assert_eq!(parse_retry_after(&value, now), Some(Duration::ZERO));

        assert_eq!(parse_retry_after("not a date", now), None);
    }

    #[test]
    fn retry_after_header_lands_on_classified_error() {
        let err = LLMError::from_http_status("zai", 429, "slow down", Some("5"), None);
        assert_eq!(err.kind(), "rate_limit");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));
        assert!(err.retryable());
    }

    #[test]
    fn cancellation_sentinel() {
        let err = LLMError::cancelled("anthropic");
        assert!(err.is_cancellation());
        assert!(!err.retryable());
        assert!(!LLMError::stream("anthropic", "connection reset").is_cancellation());
    }
}
