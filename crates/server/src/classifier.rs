//! Line classification for raw agent output.
//!
//! The agent's output format is not a contract, so classification sits behind
//! the `LineClassifier` trait. `HeuristicClassifier` is the default.

use serde_json::Value;

use specstream_protocol::MessageType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedLine {
    pub message_type: MessageType,
    pub content: String,
}

impl ClassifiedLine {
    fn new(message_type: MessageType, content: impl Into<String>) -> Self {
        Self {
            message_type,
            content: content.into(),
        }
    }
}

/// Maps one raw stdout line to a message type.
///
/// Returning `None` skips the line. Implementations must only produce
/// `thinking`, `execution` or `error`; `system` and `complete` belong to the
/// runner.
pub trait LineClassifier: Send + Sync {
    fn classify(&self, line: &str) -> Option<ClassifiedLine>;
}

const THINKING_TAGS: &[&str] = &["<thinking>", "[thinking]", "thinking:", "reasoning:"];
const ERROR_PREFIXES: &[&str] = &["error:", "fatal:", "panic:", "traceback"];

/// Structural heuristics over tagged, prefixed and JSON-formatted lines
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicClassifier;

impl LineClassifier for HeuristicClassifier {
    fn classify(&self, line: &str) -> Option<ClassifiedLine> {
        let cleaned = strip_ansi(line);
        let trimmed = cleaned.trim();
        if trimmed.is_empty() {
            return None;
        }

        if trimmed.starts_with('{') {
            if let Some(classified) = classify_json(trimmed) {
                return Some(classified);
            }
        }

        let lower = trimmed.to_ascii_lowercase();
        if let Some(tag) = THINKING_TAGS.iter().find(|tag| lower.starts_with(*tag)) {
            let body = trimmed[tag.len()..]
                .trim_end_matches("</thinking>")
                .trim();
            return Some(ClassifiedLine::new(MessageType::Thinking, body));
        }
        if ERROR_PREFIXES.iter().any(|prefix| lower.starts_with(prefix)) {
            return Some(ClassifiedLine::new(MessageType::Error, trimmed));
        }
        // Tool markers, command echoes and document text
        Some(ClassifiedLine::new(MessageType::Execution, trimmed))
    }
}

/// Stream-json style objects, dispatched on their `type` field
fn classify_json(line: &str) -> Option<ClassifiedLine> {
    let parsed: Value = serde_json::from_str(line).ok()?;
    let kind = parsed.get("type")?.as_str()?;
    let content = ["content", "text", "message", "result"]
        .iter()
        .find_map(|key| parsed.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| line.to_string());

    let message_type = match kind {
        "thinking" | "reasoning" => MessageType::Thinking,
        "error" => MessageType::Error,
        _ => MessageType::Execution,
    };
    Some(ClassifiedLine::new(message_type, content))
}

/// Remove CSI escape sequences (colors, cursor movement).
pub fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            if chars.peek() == Some(&'[') {
                chars.next();
                // Parameters and intermediates run until a final byte in @..~
                for next in chars.by_ref() {
                    if ('@'..='~').contains(&next) {
                        break;
                    }
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}
