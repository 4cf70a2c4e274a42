use serde::{Deserialize, Serialize};

// ─── stream-json lines ────────────────────────────────────────────────────

/// One line of `--output-format stream-json` output. Only the parts the
/// loop needs are typed; everything else lands in `Other`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamLine {
    Assistant(AssistantMessage),
    Result(ResultLine),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantMessage {
    pub message: AssistantContent,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantContent {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

/// `type = "result"`, the terminal line of a stream-json run.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ResultLine {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl StreamLine {
    /// Parse one output line. Lines that are not JSON objects yield `None`;
    /// they are plain text from `--print` mode.
    pub fn parse(line: &str) -> Option<Result<Self, serde_json::Error>> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        Some(serde_json::from_str(trimmed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_result_line() {
        let line = r#"{"type":"result","subtype":"success","result":"done","is_error":false,"num_turns":3,"total_cost_usd":0.01,"session_id":"s"}"#;
        let Some(Ok(StreamLine::Result(r))) = StreamLine::parse(line) else {
            panic!("expected result line")
        };
        assert_eq!(r.result.as_deref(), Some("done"));
        assert_eq!(r.num_turns, 3);
        assert!(!r.is_error);
    }

    #[test]
    fn parse_assistant_text_blocks() {
        let line = r#"{"type":"assistant","message":{"id":"m","content":[{"type":"text","text":"hi"},{"type":"tool_use","id":"t","name":"Bash","input":{}}]}}"#;
        let Some(Ok(StreamLine::Assistant(a))) = StreamLine::parse(line) else {
            panic!("expected assistant line")
        };
        assert_eq!(a.message.content.len(), 2);
        assert!(matches!(&a.message.content[0], ContentBlock::Text { text } if text == "hi"));
        assert!(matches!(a.message.content[1], ContentBlock::Other));
    }

    #[test]
    fn unknown_types_are_other() {
        let line = r#"{"type":"rate_limit_event","retry_after":3}"#;
        assert!(matches!(StreamLine::parse(line), Some(Ok(StreamLine::Other))));
    }

    #[test]
    fn plain_text_is_not_a_stream_line() {
        assert!(StreamLine::parse("<story-complete>1.1.1</story-complete>").is_none());
    }
}
