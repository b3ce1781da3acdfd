//! Cloud LLM provider decoding
//!
//! Handles the differences between provider request and response formats.
//! Detection tries the host first, then headers, then the body shape.

mod anthropic;
mod openai;

pub use anthropic::{AnthropicProvider, parse_anthropic_sse};
pub use openai::{OpenAiProvider, parse_openai_sse};

use serde_json::Value;

use super::Source;
use super::metadata::MetadataTree;
use crate::reassembly::MessageHead;

/// Provider-specific request and response parsing
pub trait LlmProvider: Send + Sync {
    /// Text of the last user message in the request
    fn extract_user_query(&self, request_body: &Value) -> Option<String>;

    /// Concatenated text deltas of a streamed response
    fn parse_sse_content(&self, raw_sse: &str) -> ExtractedContent;

    /// Assistant text of a non-streaming JSON response
    fn parse_response_content(&self, response_body: &Value) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Anthropic,
    Generic,
}

static OPENAI: OpenAiProvider = OpenAiProvider;
static ANTHROPIC: AnthropicProvider = AnthropicProvider;
static GENERIC: GenericProvider = GenericProvider;

impl Provider {
    pub fn detect(host: &str, head: &MessageHead, body: &Value) -> Self {
        Self::detect_from_host(host)
            .or_else(|| Self::detect_from_headers(head))
            .or_else(|| Self::detect_from_body(body))
            .unwrap_or(Provider::Generic)
    }

    fn detect_from_host(host: &str) -> Option<Self> {
        let host = host.to_lowercase();
        if host.ends_with("openai.com") {
            return Some(Provider::OpenAI);
        }
        if host.ends_with("anthropic.com") {
            return Some(Provider::Anthropic);
        }
        None
    }

    fn detect_from_headers(head: &MessageHead) -> Option<Self> {
        if head.header("x-api-key").is_some() || head.header("anthropic-version").is_some() {
            return Some(Provider::Anthropic);
        }
        let auth = head.header("authorization")?;
        auth.to_lowercase()
            .starts_with("bearer")
            .then_some(Provider::OpenAI)
    }

    fn detect_from_body(body: &Value) -> Option<Self> {
        if body.get("system").is_some() {
            return Some(Provider::Anthropic);
        }
        if body.get("messages").is_some() {
            return Some(Provider::OpenAI);
        }
        None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAI => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Generic => "generic",
        }
    }

    pub fn decoder(&self) -> &'static dyn LlmProvider {
        match self {
            Provider::OpenAI => &OPENAI,
            Provider::Anthropic => &ANTHROPIC,
            Provider::Generic => &GENERIC,
        }
    }

    /// Detected provider first, then the others
    fn fallback_order(&self) -> [&'static dyn LlmProvider; 3] {
        match self {
            Provider::OpenAI => [&OPENAI, &ANTHROPIC, &GENERIC],
            Provider::Anthropic => [&ANTHROPIC, &OPENAI, &GENERIC],
            Provider::Generic => [&GENERIC, &OPENAI, &ANTHROPIC],
        }
    }
}

/// Parsed SSE event
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    /// Data event containing the payload
    Data(String),
    /// Terminal [DONE] marker
    Done,
}

/// Extracted content from an SSE stream
#[derive(Debug, Clone, Default)]
pub struct ExtractedContent {
    /// The concatenated content from all delta chunks
    pub content: String,
    /// Whether the stream carried its end marker
    pub is_complete: bool,
    /// Number of events parsed
    pub event_count: usize,
}

/// Split a raw SSE body into data events
pub fn parse_sse_events(raw: &str) -> Vec<SseEvent> {
    let mut events = Vec::new();
    let mut current_data = String::new();

    for line in raw.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.strip_prefix(' ').unwrap_or(data);
            if data == "[DONE]" {
                events.push(SseEvent::Done);
            } else if !current_data.is_empty() {
                current_data.push('\n');
                current_data.push_str(data);
            } else {
                current_data = data.to_string();
            }
        } else if line.is_empty() && !current_data.is_empty() {
            events.push(SseEvent::Data(std::mem::take(&mut current_data)));
        }
    }

    if !current_data.is_empty() {
        events.push(SseEvent::Data(current_data));
    }

    events
}

/// Text of the last `user` message: string content or joined text parts
pub fn last_user_message(request_body: &Value) -> Option<String> {
    let messages = request_body.get("messages")?.as_array()?;
    let message = messages
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))?;
    let content = message.get("content")?;

    if let Some(text) = content.as_str() {
        return Some(text.to_string());
    }

    let parts: Vec<&str> = content
        .as_array()?
        .iter()
        .filter(|part| {
            part.get("type")
                .and_then(Value::as_str)
                .is_none_or(|t| t == "text" || t == "input_text")
        })
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();

    (!parts.is_empty()).then(|| parts.join("\n"))
}

/// Prompt-ish fields of non-chat request bodies
pub struct GenericProvider;

impl LlmProvider for GenericProvider {
    fn extract_user_query(&self, request_body: &Value) -> Option<String> {
        ["prompt", "query", "text"]
            .iter()
            .find_map(|key| request_body.get(*key).and_then(Value::as_str))
            .map(str::to_string)
    }

    fn parse_sse_content(&self, raw_sse: &str) -> ExtractedContent {
        let events = parse_sse_events(raw_sse);
        let mut content = String::new();
        for event in &events {
            let SseEvent::Data(data) = event else {
                continue;
            };
            if let Ok(json) = serde_json::from_str::<Value>(data) {
                if let Some(text) = json.get("response").and_then(Value::as_str) {
                    content.push_str(text);
                }
            }
        }
        ExtractedContent {
            content,
            is_complete: events.iter().any(|e| matches!(e, SseEvent::Done)),
            event_count: events.len(),
        }
    }

    fn parse_response_content(&self, response_body: &Value) -> Option<String> {
        match response_body.get("response")? {
            Value::String(text) => Some(text.clone()),
            _ => None,
        }
    }
}

/// Prompt candidate of a provider request
pub fn request_prompt(provider: Provider, body: &Value) -> Option<String> {
    provider
        .decoder()
        .extract_user_query(body)
        .or_else(|| last_user_message(body))
        .or_else(|| GENERIC.extract_user_query(body))
}

/// Assistant text of a provider response, streamed or not
pub fn response_text(provider: Provider, head: &MessageHead, body: &[u8]) -> Option<String> {
    let raw = std::str::from_utf8(body).ok()?;
    let streamed = head.content_type().as_deref() == Some("text/event-stream")
        || raw.starts_with("data:")
        || raw.starts_with("event:");

    if streamed {
        return provider
            .fallback_order()
            .iter()
            .map(|decoder| decoder.parse_sse_content(raw).content)
            .find(|content| !content.is_empty());
    }

    let json: Value = serde_json::from_str(raw).ok()?;
    provider
        .fallback_order()
        .iter()
        .find_map(|decoder| decoder.parse_response_content(&json))
        .filter(|text| !text.is_empty())
}

/// Request metadata recorded alongside provider prompts
pub fn request_metadata(provider: Provider, head: &MessageHead, body: &Value, request_size: usize) -> MetadataTree {
    let mut metadata = MetadataTree::new();
    metadata.insert("provider", provider.as_str());
    metadata.insert(
        "model",
        body.get("model").and_then(Value::as_str).unwrap_or_default(),
    );
    metadata.insert_opt("temperature", body.get("temperature").cloned());
    metadata.insert_opt(
        "max_tokens",
        body.get("max_tokens")
            .or_else(|| body.get("max_completion_tokens"))
            .cloned(),
    );
    metadata.insert(
        "stream",
        body.get("stream").and_then(Value::as_bool).unwrap_or(false),
    );
    metadata.insert("content_type", head.header("content-type").unwrap_or_default());
    metadata.insert(
        "authorization_present",
        head.header("authorization").is_some() || head.header("x-api-key").is_some(),
    );
    metadata.insert("request_size", request_size);
    metadata.insert_opt("target", head.target());
    metadata
}

/// Source application from the User-Agent and host
pub fn detect_source(user_agent: Option<&str>, host: &str) -> Source {
    let agent = user_agent.unwrap_or_default().to_lowercase();
    let host = host.to_lowercase();

    if agent.contains("windsurf") || host.contains("windsurf") || host.contains("codeium") {
        Source::Windsurf
    } else if agent.contains("cursor") {
        Source::Cursor
    } else if agent.contains("vscode") {
        Source::Vscode
    } else if agent.contains("copilot") {
        Source::GithubCopilot
    } else if agent.contains("electron") {
        Source::ElectronApp
    } else {
        Source::Unknown
    }
}
