use serde_json::Value;

use super::{ExtractedContent, LlmProvider, SseEvent, last_user_message, parse_sse_events};

pub struct OpenAiProvider;

impl OpenAiProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OpenAiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmProvider for OpenAiProvider {
    fn extract_user_query(&self, request_body: &Value) -> Option<String> {
        last_user_message(request_body)
    }

    fn parse_sse_content(&self, raw_sse: &str) -> ExtractedContent {
        parse_openai_sse(raw_sse)
    }

    fn parse_response_content(&self, response_body: &Value) -> Option<String> {
        response_body
            .get("choices")?
            .get(0)?
            .get("message")?
            .get("content")?
            .as_str()
            .map(|s| s.to_string())
    }
}

/// Concatenate `choices[0].delta.content` across chunks
///
/// OpenAI chunks look like:
/// ```json
/// {"id":"chatcmpl-123","choices":[{"index":0,"delta":{"content":"Hello"}}]}
/// ```
pub fn parse_openai_sse(raw: &str) -> ExtractedContent {
    let events = parse_sse_events(raw);
    let mut content = String::new();

    for event in &events {
        if let SseEvent::Data(data) = event {
            if let Some(delta) = parse_delta(data) {
                content.push_str(&delta);
            }
        }
    }

    ExtractedContent {
        content,
        is_complete: events.iter().any(|e| matches!(e, SseEvent::Done)),
        event_count: events.len(),
    }
}

fn parse_delta(data: &str) -> Option<String> {
    let json: Value = serde_json::from_str(data).ok()?;
    json.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}
