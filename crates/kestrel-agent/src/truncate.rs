//! Tool output truncation: chars first, then lines.
//!
//! Markers are literal and stable; the malformed-call guard and external
//! consumers match on their exact wording.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationStrategy {
    /// Keep the end of the output.
    Tail,
    /// Keep both ends, drop the middle.
    HeadTail,
}

/// Effective limits for one tool's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputLimit {
    pub max_chars: usize,
    /// 0 disables line limiting.
    pub max_lines: usize,
    pub strategy: TruncationStrategy,
}

/// Partial override from session config; only positive values and present
/// strategies take effect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitOverride {
    #[serde(default)]
    pub max_chars: usize,
    #[serde(default)]
    pub max_lines: usize,
    #[serde(default)]
    pub strategy: Option<TruncationStrategy>,
}

impl OutputLimit {
    pub fn apply(mut self, over: &LimitOverride) -> Self {
        if over.max_chars > 0 {
            self.max_chars = over.max_chars;
        }
        if over.max_lines > 0 {
            self.max_lines = over.max_lines;
        }
        if let Some(strategy) = over.strategy {
            self.strategy = strategy;
        }
        self
    }
}

/// Built-in per-tool defaults; unknown tools get the catch-all.
pub fn default_limit_for(tool: &str) -> OutputLimit {
    use TruncationStrategy::*;
    let (max_chars, max_lines, strategy) = match tool {
        "read_file" => (50_000, 0, HeadTail),
        "shell" => (30_000, 256, HeadTail),
        "grep" => (20_000, 200, Tail),
        "glob" => (20_000, 500, Tail),
        "edit_file" => (10_000, 0, Tail),
        "apply_patch" => (10_000, 0, Tail),
        "write_file" => (1_000, 0, Tail),
        "spawn_agent" => (20_000, 0, HeadTail),
        _ => (20_000, 0, HeadTail),
    };
    OutputLimit { max_chars, max_lines, strategy }
}

/// Truncate `output` to the limit: character budget first, then the line
/// budget on the result.
pub fn truncate(output: &str, limit: &OutputLimit) -> String {
    let truncated = truncate_chars(output, limit.max_chars, limit.strategy);
    truncate_lines(&truncated, limit.max_lines)
}

fn truncate_chars(output: &str, max_chars: usize, strategy: TruncationStrategy) -> String {
    if max_chars == 0 || output.chars().count() <= max_chars {
        return output.to_string();
    }
    let total = output.chars().count();
    match strategy {
        TruncationStrategy::Tail => {
            let removed = total - max_chars;
            let tail: String = output.chars().skip(removed).collect();
            format!(
                "[WARNING: Tool output was truncated. First {} characters were removed. The full output is available in the event stream.]{}",
                removed, tail
            )
        }
        TruncationStrategy::HeadTail => {
            let head_len = max_chars / 2;
            let tail_len = max_chars - head_len;
            let removed = total - max_chars;
            let head: String = output.chars().take(head_len).collect();
            let tail: String = output.chars().skip(total - tail_len).collect();
            format!(
                "{}\n[WARNING: Tool output was truncated. {} characters were removed from the middle. The full output is available in the event stream.]\n{}",
                head, removed, tail
            )
        }
    }
}

fn truncate_lines(output: &str, max_lines: usize) -> String {
    if max_lines == 0 {
        return output.to_string();
    }
    let lines: Vec<&str> = output.lines().collect();
    if lines.len() <= max_lines {
        return output.to_string();
    }
    let head_count = max_lines / 2;
    let tail_count = max_lines - head_count;
    let omitted = lines.len() - max_lines;
    let head = lines[..head_count].join("\n");
    let tail = lines[lines.len() - tail_count..].join("\n");
    format!("{}\n[... {} lines omitted ...]\n{}", head, omitted, tail)
}
