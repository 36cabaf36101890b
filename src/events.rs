//! Stream events emitted by the agent driver.
//!
//! A streaming entry point yields a sequence of these events and always
//! ends with exactly one terminal event (`done` or `error`). `ping`
//! heartbeats keep idle connections alive. Encoded as NDJSON: one JSON
//! object per line, tagged by `type`.

use serde::Serialize;

use crate::models::SearchResult;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    Start {
        model: String,
    },
    /// Retrieved context, quick-answer mode only.
    Sources {
        sources: Vec<SearchResult>,
    },
    TextDelta {
        text: String,
    },
    ToolCall {
        step: u32,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        step: u32,
        name: String,
        output: serde_json::Value,
    },
    Done {
        model: String,
    },
    Error {
        message: String,
    },
    Ping,
}

impl StreamEvent {
    /// Whether this event ends the stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// Encode as one NDJSON line (trailing newline included).
    pub fn to_ndjson(&self) -> crate::error::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_kebab_case() {
        let event = StreamEvent::TextDelta {
            text: "hi".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "text-delta");

        let event = StreamEvent::ToolCall {
            step: 1,
            name: "search".to_string(),
            input: serde_json::json!({ "query": "x" }),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool-call");
        assert_eq!(json["step"], 1);

        let json = serde_json::to_value(StreamEvent::Ping).unwrap();
        assert_eq!(json["type"], "ping");
    }

    #[test]
    fn terminal_detection() {
        assert!(StreamEvent::Done {
            model: "m".to_string()
        }
        .is_terminal());
        assert!(StreamEvent::Error {
            message: "boom".to_string()
        }
        .is_terminal());
        assert!(!StreamEvent::Ping.is_terminal());
    }

    #[test]
    fn ndjson_is_line_delimited() {
        let line = StreamEvent::Ping.to_ndjson().unwrap();
        assert_eq!(line, "{\"type\":\"ping\"}\n");
    }
}
