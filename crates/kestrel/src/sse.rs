//! Line-oriented server-sent-event parsing.
//!
//! The parser is deliberately dumb: it understands `data:` accumulation,
//! `event:` names, comment lines, and blank-line dispatch. `data: [DONE]`
//! is dispatched like any other event; interpreting it is the adapter's job.

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the last `event:` line seen before dispatch, if any.
    pub event: Option<String>,
    /// All `data:` payloads joined with `\n`.
    pub data: String,
}

impl SseEvent {
    /// True for the OpenAI-style `[DONE]` terminator.
    pub fn is_done(&self) -> bool {
        self.data == "[DONE]"
    }
}

/// Accumulates SSE field lines until a blank line dispatches an event.
#[derive(Debug, Default)]
pub struct SseParser {
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without its trailing newline). Returns a dispatched
    /// event when `line` is the blank separator and fields were accumulated.
    pub fn push_line(&mut self, line: &str) -> Option<SseEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            if self.data.is_empty() && self.event.is_none() {
                return None;
            }
            let event = SseEvent {
                event: self.event.take(),
                data: self.data.join("\n"),
            };
            self.data.clear();
            return Some(event);
        }

        if let Some(rest) = line.strip_prefix("data:") {
            // A single leading space is field syntax, not payload.
            self.data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        } else if let Some(rest) = line.strip_prefix("event:") {
            self.event = Some(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        } else if line.starts_with(':') {
            // comment / keep-alive
        }
        // Unknown fields (id:, retry:, ...) are ignored.
        None
    }
}

/// Reassembles network chunks into complete lines for [`SseParser`].
#[derive(Debug, Default)]
pub struct SseLineSplitter {
    buf: Vec<u8>,
}

impl SseLineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a byte chunk; returns every complete line it terminated.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            lines.push(String::from_utf8_lossy(line).into_owned());
        }
        lines
    }

    /// Flush a trailing unterminated line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(line)
    }
}
