//! Parses the newline-delimited JSON stream produced by the `claude`
//! subprocess and extracts inline markers from assistant text.
//!
//! One JSON object per line. Marker extraction only ever looks at
//! assistant text blocks — tool-use and result records are never
//! scanned, per the no-buffering-across-lines design.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::store::EventLevel;

#[derive(Debug, Clone)]
pub enum ParsedRecord {
    System,
    AssistantText(String),
    ToolUse { name: String, args: serde_json::Value },
    Result { cost_usd: f64, turns: i64, result_text: Option<String> },
    Error(String),
}

#[derive(Debug, Deserialize)]
struct RawLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    num_turns: Option<u64>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: Vec<RawBlock>,
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<serde_json::Value>,
}

/// Parses a single NDJSON line into zero or more records — a single
/// "assistant" line can carry several content blocks, each of which
/// becomes its own `ParsedRecord`.
pub fn parse_line(line: &str) -> Vec<ParsedRecord> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }

    let raw: RawLine = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(_) => return Vec::new(),
    };

    match raw.kind.as_str() {
        "system" => vec![ParsedRecord::System],
        "assistant" => raw
            .message
            .map(|m| {
                m.content
                    .into_iter()
                    .filter_map(|block| match block.kind.as_str() {
                        "text" => block.text.map(ParsedRecord::AssistantText),
                        "tool_use" => Some(ParsedRecord::ToolUse {
                            name: block.name.unwrap_or_else(|| "?".to_string()),
                            args: block.input.unwrap_or(serde_json::Value::Null),
                        }),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default(),
        "result" => vec![ParsedRecord::Result {
            cost_usd: raw.total_cost_usd.unwrap_or(0.0),
            turns: raw.num_turns.unwrap_or(0) as i64,
            result_text: raw.result,
        }],
        "error" => vec![ParsedRecord::Error(raw.error.unwrap_or_else(|| "unknown error".to_string()))],
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Marker {
    Event {
        level: EventLevel,
        service: Option<String>,
        message: String,
    },
    Memory {
        category: String,
        service: Option<String>,
        observation: String,
    },
    Cooldown {
        action_type: String,
        service: String,
        success: bool,
        message: String,
    },
}

static EVENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\[EVENT:(info|warning|critical)(?::([^\]]+))?\]\s+(.+)$").unwrap());
static MEMORY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\[MEMORY:([^:\]]+)(?::([^\]]+))?\]\s+(.+)$").unwrap());
static COOLDOWN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\[COOLDOWN:([^:\]]+):([^\]]+)\]\s+(success|failure)\s*(?:—|-)\s*(.+)$").unwrap()
});

/// Scans a single assistant text block for marker lines. Each line is
/// checked independently; malformed markers are simply not matched and
/// the text is left as free-form prose (no error surfaced).
pub fn scan_markers(text: &str) -> Vec<Marker> {
    let mut markers = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if let Some(caps) = EVENT_RE.captures(line) {
            let level = EventLevel::parse(&caps[1]).unwrap_or(EventLevel::Info);
            markers.push(Marker::Event {
                level,
                service: caps.get(2).map(|m| m.as_str().to_string()),
                message: caps[3].trim().to_string(),
            });
        } else if let Some(caps) = MEMORY_RE.captures(line) {
            markers.push(Marker::Memory {
                category: caps[1].trim().to_string(),
                service: caps.get(2).map(|m| m.as_str().to_string()),
                observation: caps[3].trim().to_string(),
            });
        } else if let Some(caps) = COOLDOWN_RE.captures(line) {
            markers.push(Marker::Cooldown {
                action_type: caps[1].trim().to_string(),
                service: caps[2].trim().to_string(),
                success: &caps[3] == "success",
                message: caps[4].trim().to_string(),
            });
        }
    }
    markers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assistant_text_block() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hello"}]}}"#;
        let records = parse_line(line);
        assert!(matches!(&records[0], ParsedRecord::AssistantText(t) if t == "hello"));
    }

    #[test]
    fn parses_tool_use_block() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"cmd":"ls"}}]}}"#;
        let records = parse_line(line);
        assert!(matches!(&records[0], ParsedRecord::ToolUse { name, .. } if name == "Bash"));
    }

    #[test]
    fn parses_result_record() {
        let line = r#"{"type":"result","total_cost_usd":0.42,"num_turns":3,"result":"done"}"#;
        let records = parse_line(line);
        match &records[0] {
            ParsedRecord::Result { cost_usd, turns, result_text } => {
                assert_eq!(*cost_usd, 0.42);
                assert_eq!(*turns, 3);
                assert_eq!(result_text.as_deref(), Some("done"));
            }
            _ => panic!("expected result record"),
        }
    }

    #[test]
    fn malformed_json_yields_no_records() {
        assert!(parse_line("not json").is_empty());
        assert!(parse_line("").is_empty());
    }

    #[test]
    fn event_marker_with_service() {
        let markers = scan_markers("[EVENT:critical:payments] checkout down");
        assert_eq!(
            markers[0],
            Marker::Event {
                level: EventLevel::Critical,
                service: Some("payments".to_string()),
                message: "checkout down".to_string(),
            }
        );
    }

    #[test]
    fn event_marker_without_message_is_ignored() {
        assert!(scan_markers("[EVENT:info]").is_empty());
    }

    #[test]
    fn memory_marker_without_service() {
        let markers = scan_markers("[MEMORY:latency] p99 elevated since deploy");
        assert_eq!(
            markers[0],
            Marker::Memory {
                category: "latency".to_string(),
                service: None,
                observation: "p99 elevated since deploy".to_string(),
            }
        );
    }

    #[test]
    fn cooldown_marker_parses_success_flag() {
        let markers = scan_markers("[COOLDOWN:restart:web] success — pod cycled cleanly");
        assert_eq!(
            markers[0],
            Marker::Cooldown {
                action_type: "restart".to_string(),
                service: "web".to_string(),
                success: true,
                message: "pod cycled cleanly".to_string(),
            }
        );
    }

    #[test]
    fn markers_only_scanned_per_line_not_across_blocks() {
        let text = "some prose\n[EVENT:warning] disk at 80%\nmore prose";
        let markers = scan_markers(text);
        assert_eq!(markers.len(), 1);
    }
}
