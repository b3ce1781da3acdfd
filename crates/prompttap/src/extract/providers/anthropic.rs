use serde_json::Value;

use super::{ExtractedContent, LlmProvider, SseEvent, last_user_message, parse_sse_events};

pub struct AnthropicProvider;

impl AnthropicProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AnthropicProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmProvider for AnthropicProvider {
    fn extract_user_query(&self, request_body: &Value) -> Option<String> {
        last_user_message(request_body)
    }

    fn parse_sse_content(&self, raw_sse: &str) -> ExtractedContent {
        parse_anthropic_sse(raw_sse)
    }

    fn parse_response_content(&self, response_body: &Value) -> Option<String> {
        let content = response_body.get("content")?;
        if let Some(text) = content.as_str() {
            return Some(text.to_string());
        }

        let text: String = content
            .as_array()?
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect();

        (!text.is_empty()).then_some(text)
    }
}

/// Concatenate `text_delta` blocks of a Messages stream
///
/// The `event:` lines are redundant with each payload's `type`, so only the
/// data payloads are inspected. Thinking and tool-input deltas are skipped.
pub fn parse_anthropic_sse(raw: &str) -> ExtractedContent {
    let events = parse_sse_events(raw);
    let mut content = String::new();
    let mut is_complete = false;

    for event in &events {
        let SseEvent::Data(data) = event else {
            continue;
        };
        let Ok(json) = serde_json::from_str::<Value>(data) else {
            continue;
        };

        match json.get("type").and_then(Value::as_str) {
            Some("content_block_delta") => {
                let delta = json.get("delta");
                let is_text = delta
                    .and_then(|d| d.get("type"))
                    .and_then(Value::as_str)
                    == Some("text_delta");
                if let Some(text) = delta.filter(|_| is_text).and_then(|d| d.get("text")).and_then(Value::as_str) {
                    content.push_str(text);
                }
            }
            Some("message_stop") => is_complete = true,
            _ => {}
        }
    }

    ExtractedContent {
        content,
        is_complete,
        event_count: events.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_anthropic_full_stream() {
        let raw = r#"event: message_start
data: {"type":"message_start","message":{"id":"msg_1","type":"message","role":"assistant","content":[]}}

event: content_block_start
data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}

event: ping
data: {"type":"ping"}

event: content_block_delta
data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}

event: content_block_delta
data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":" World"}}

event: content_block_stop
data: {"type":"content_block_stop","index":0}

event: message_stop
data: {"type":"message_stop"}

"#;
        let result = parse_anthropic_sse(raw);
        assert_eq!(result.content, "Hello World");
        assert!(result.is_complete);
        assert_eq!(result.event_count, 7);
    }

    #[test]
    fn test_anthropic_skips_non_text_deltas() {
        let raw = r#"event: content_block_delta
data: {"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"Let me think..."}}

event: content_block_delta
data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"loc"}}

event: content_block_delta
data: {"type":"content_block_delta","index":2,"delta":{"type":"text_delta","text":"Answer"}}

"#;
        let result = parse_anthropic_sse(raw);
        assert_eq!(result.content, "Answer");
        assert!(!result.is_complete);
    }

    #[test]
    fn test_anthropic_parse_response_blocks() {
        let provider = AnthropicProvider::new();
        let response = serde_json::json!({
            "content": [
                {"type": "tool_use", "id": "toolu_123", "name": "get_weather"},
                {"type": "text", "text": "Hello"},
                {"type": "text", "text": " World"}
            ]
        });

        assert_eq!(
            provider.parse_response_content(&response),
            Some("Hello World".to_string())
        );
    }

    #[test]
    fn test_anthropic_parse_response_string_content() {
        let provider = AnthropicProvider::new();
        let response = serde_json::json!({"content": "plain"});
        assert_eq!(provider.parse_response_content(&response), Some("plain".to_string()));
        assert_eq!(provider.parse_response_content(&serde_json::json!({"content": []})), None);
    }

    #[test]
    fn test_anthropic_extract_query_array_content() {
        let provider = AnthropicProvider::new();
        let request = serde_json::json!({
            "system": "be brief",
            "messages": [{"role": "user", "content": [
                {"type": "image", "source": {"type": "base64", "data": "..."}},
                {"type": "text", "text": "What is in this image?"}
            ]}]
        });

        assert_eq!(
            provider.extract_user_query(&request),
            Some("What is in this image?".to_string())
        );
    }
}
