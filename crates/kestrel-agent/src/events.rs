use serde::{Deserialize, Serialize};

/// One observable session event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Unix timestamp (UTC seconds).
    pub timestamp: i64,
    pub session_id: String,
    #[serde(flatten)]
    pub kind: SessionEventKind,
}

impl SessionEvent {
    pub fn new(session_id: impl Into<String>, kind: SessionEventKind) -> Self {
        Self {
            timestamp: time::OffsetDateTime::now_utc().unix_timestamp(),
            session_id: session_id.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEventKind {
    SessionStart,
    SessionEnd,
    UserInput {
        text: String,
    },
    AssistantTextStart,
    AssistantTextDelta {
        text: String,
    },
    AssistantTextEnd {
        text: String,
    },
    ToolCallStart {
        tool_name: String,
        call_id: String,
        arguments: String,
    },
    /// 4000-byte chunks of the full, untruncated output.
    ToolCallOutputDelta {
        tool_name: String,
        call_id: String,
        chunk: String,
    },
    ToolCallEnd {
        tool_name: String,
        call_id: String,
        is_error: bool,
        full_output: String,
    },
    SteeringInjected {
        text: String,
    },
    LoopDetection {
        fingerprint: String,
        repeats: u32,
    },
    TurnLimit {
        turns: u64,
        max_turns: u64,
    },
    Warning {
        message: String,
    },
    Error {
        message: String,
    },
}

impl SessionEventKind {
    /// Stable lower-snake name, mirroring the serde tag.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEventKind::SessionStart => "session_start",
            SessionEventKind::SessionEnd => "session_end",
            SessionEventKind::UserInput { .. } => "user_input",
            SessionEventKind::AssistantTextStart => "assistant_text_start",
            SessionEventKind::AssistantTextDelta { .. } => "assistant_text_delta",
            SessionEventKind::AssistantTextEnd { .. } => "assistant_text_end",
            SessionEventKind::ToolCallStart { .. } => "tool_call_start",
            SessionEventKind::ToolCallOutputDelta { .. } => "tool_call_output_delta",
            SessionEventKind::ToolCallEnd { .. } => "tool_call_end",
            SessionEventKind::SteeringInjected { .. } => "steering_injected",
            SessionEventKind::LoopDetection { .. } => "loop_detection",
            SessionEventKind::TurnLimit { .. } => "turn_limit",
            SessionEventKind::Warning { .. } => "warning",
            SessionEventKind::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = SessionEvent::new(
            "sess_1",
            SessionEventKind::ToolCallStart {
                tool_name: "glob".into(),
                call_id: "call_1".into(),
                arguments: "{}".into(),
            },
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "tool_call_start");
        assert_eq!(value["session_id"], "sess_1");
        assert_eq!(value["tool_name"], "glob");
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }
}
