//! Protocol classification and extraction
//!
//! Each connection gets its own [`Extractor`]. Requests are classified and
//! decoded into prompt candidates, responses are paired with them in FIFO
//! order, and every outcome is returned as an [`Extraction`] value.

pub mod classifier;
pub mod fingerprint;
pub mod metadata;
pub mod providers;
pub mod rpc;

pub use classifier::{Channel, Classifier};
pub use fingerprint::{ContentDigest, Fingerprint, FingerprintKey};
pub use metadata::MetadataTree;
pub use rpc::{CascadeJsonDecoder, DecoderRegistry, RpcDecoder};

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::capture::{ConnectionId, Direction, TransportPath};
use crate::config::ExtractConfig;
use crate::reassembly::{MessageHead, ReassembledMessage};
use providers::Provider;

/// Pending exchanges kept per connection before the oldest are given up
const MAX_PENDING: usize = 256;

/// Application that issued the captured request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    Windsurf,
    Cursor,
    Vscode,
    GithubCopilot,
    ElectronApp,
    Unknown,
}

impl Source {
    pub const ALL: [Source; 6] = [
        Source::Windsurf,
        Source::Cursor,
        Source::Vscode,
        Source::GithubCopilot,
        Source::ElectronApp,
        Source::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Windsurf => "windsurf",
            Source::Cursor => "cursor",
            Source::Vscode => "vscode",
            Source::GithubCopilot => "github-copilot",
            Source::ElectronApp => "electron-app",
            Source::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A body that should have decoded but did not
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeFault {
    #[error("invalid JSON body: {0}")]
    InvalidJson(String),

    #[error("body is not UTF-8")]
    NotUtf8,

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
}

impl From<serde_json::Error> for DecodeFault {
    fn from(err: serde_json::Error) -> Self {
        DecodeFault::InvalidJson(err.to_string())
    }
}

/// Why a message produced no event. Not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    /// Not a request we know how to read
    Irrelevant,
    /// RPC method with no registered decoder
    NoDecoder(String),
    /// Request carried no prompt field
    NoPrompt,
    /// Request method never carries a prompt body
    BodylessMethod(String),
    /// Prompt was empty after trimming
    EmptyPrompt,
    /// Response with no request waiting for it
    UnpairedResponse,
    /// Response arrived after its request was emitted on timeout
    LateResponse,
    /// Message never completed
    Incomplete,
}

#[derive(Debug)]
pub enum Extraction {
    Event(Box<ExtractedEvent>),
    Discard(DiscardReason),
    Fault(DecodeFault),
}

/// Fields decoded from a request before pairing
#[derive(Debug, Clone)]
pub struct DecodedRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub cascade_id: Option<String>,
    pub planner_mode: Option<String>,
    pub brain_enabled: bool,
    pub ide_name: Option<String>,
    pub ide_version: Option<String>,
    pub extension_version: Option<String>,
    pub source: Source,
    pub metadata: MetadataTree,
}

/// Pure functions of the text and timestamp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedFields {
    pub prompt_length: usize,
    pub word_count: usize,
    pub hour_of_day: u32,
    pub day_of_week: String,
    pub date: String,
}

impl DerivedFields {
    pub fn compute(text: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            prompt_length: text.chars().count(),
            word_count: text.split_whitespace().count(),
            hour_of_day: timestamp.hour(),
            day_of_week: timestamp.format("%A").to_string(),
            date: timestamp.format("%Y-%m-%d").to_string(),
        }
    }
}

/// A prompt, optionally paired with its response
#[derive(Debug, Clone)]
pub struct ExtractedEvent {
    pub prompt: Option<String>,
    pub response: Option<String>,
    pub model: Option<String>,
    pub cascade_id: Option<String>,
    pub planner_mode: Option<String>,
    pub ide_name: Option<String>,
    pub ide_version: Option<String>,
    pub extension_version: Option<String>,
    pub brain_enabled: bool,
    pub source: Source,
    pub path: TransportPath,
    pub connection: ConnectionId,
    pub timestamp: DateTime<Utc>,
    pub metadata: MetadataTree,
    pub derived: DerivedFields,
    pub fingerprint: Fingerprint,
    pub fingerprint_key: FingerprintKey,
}

impl ExtractedEvent {
    pub fn new(
        request: DecodedRequest,
        response: Option<String>,
        path: TransportPath,
        connection: ConnectionId,
        timestamp: DateTime<Utc>,
        bucket_secs: u64,
    ) -> Self {
        let text = if request.prompt.is_empty() {
            response.clone().unwrap_or_default()
        } else {
            request.prompt.clone()
        };
        let fingerprint_key =
            FingerprintKey::new(&text, request.cascade_id.as_deref(), timestamp, bucket_secs);

        Self {
            derived: DerivedFields::compute(&text, timestamp),
            fingerprint: fingerprint_key.fingerprint(),
            fingerprint_key,
            prompt: Some(request.prompt).filter(|p| !p.is_empty()),
            response,
            model: request.model,
            cascade_id: request.cascade_id,
            planner_mode: request.planner_mode,
            ide_name: request.ide_name,
            ide_version: request.ide_version,
            extension_version: request.extension_version,
            brain_enabled: request.brain_enabled,
            source: request.source,
            path,
            connection,
            timestamp,
            metadata: request.metadata,
        }
    }

    /// Prompt, or the response when there is no prompt
    pub fn text(&self) -> &str {
        self.prompt
            .as_deref()
            .or(self.response.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractSettings {
    pub pair_timeout: Duration,
    pub bucket_secs: u64,
}

impl From<&ExtractConfig> for ExtractSettings {
    fn from(config: &ExtractConfig) -> Self {
        Self {
            pair_timeout: Duration::from_secs(config.pair_timeout_secs),
            bucket_secs: config.fingerprint_bucket_secs,
        }
    }
}

#[derive(Debug, Clone)]
enum ResponseDecoder {
    Provider(Provider),
    /// Registered RPC decoder, by name
    Rpc(&'static str),
}

#[derive(Debug)]
struct Candidate {
    request: DecodedRequest,
    response_decoder: ResponseDecoder,
    path: TransportPath,
    timestamp: DateTime<Utc>,
}

#[derive(Debug)]
enum Slot {
    /// Request produced no candidate; its response is ignored
    Skip,
    Waiting(Box<Candidate>),
    /// Candidate already emitted without a response
    Expired,
}

#[derive(Debug)]
struct Exchange {
    slot: Slot,
    queued_at: Instant,
}

/// Per-connection extraction state
pub struct Extractor {
    connection: ConnectionId,
    classifier: Arc<Classifier>,
    registry: Arc<DecoderRegistry>,
    settings: ExtractSettings,
    pending: VecDeque<Exchange>,
}

impl Extractor {
    pub fn new(
        connection: ConnectionId,
        classifier: Arc<Classifier>,
        registry: Arc<DecoderRegistry>,
        settings: ExtractSettings,
    ) -> Self {
        Self {
            connection,
            classifier,
            registry,
            settings,
            pending: VecDeque::new(),
        }
    }

    /// Requests waiting for a response
    pub fn pending(&self) -> usize {
        self.pending
            .iter()
            .filter(|e| matches!(e.slot, Slot::Waiting(_)))
            .count()
    }

    pub fn on_message(&mut self, message: ReassembledMessage) -> Vec<Extraction> {
        if !message.is_complete() {
            return vec![Extraction::Discard(DiscardReason::Incomplete)];
        }
        match message.direction {
            Direction::Request => self.on_request(message),
            Direction::Response => self.on_response(message),
        }
    }

    fn on_request(&mut self, message: ReassembledMessage) -> Vec<Extraction> {
        let mut out = Vec::new();
        let queued_at = message.started_at.monotonic;

        let slot = match self.decode_request(&message) {
            Ok(candidate) => Slot::Waiting(Box::new(candidate)),
            Err(outcome) => {
                out.push(outcome);
                Slot::Skip
            }
        };
        self.pending.push_back(Exchange { slot, queued_at });

        if self.pending.len() > MAX_PENDING {
            if let Some(oldest) = self.pending.pop_front() {
                out.extend(self.expire(oldest.slot));
            }
        }
        out
    }

    fn decode_request(&self, message: &ReassembledMessage) -> Result<Candidate, Extraction> {
        let host = message.endpoint.host.as_str();
        let head = &message.head;

        let (request, response_decoder) = match self.classifier.classify(message.path, host, head) {
            Channel::Irrelevant => return Err(Extraction::Discard(DiscardReason::Irrelevant)),
            Channel::Rpc { method } => {
                let decoder = self
                    .registry
                    .find(&method)
                    .ok_or_else(|| Extraction::Discard(DiscardReason::NoDecoder(method.clone())))?;
                let request = decoder
                    .decode_request(head, &message.payload)
                    .map_err(Extraction::Fault)?;
                (request, ResponseDecoder::Rpc(decoder.name()))
            }
            Channel::Provider { host } => {
                if let Some(method) = head.method().filter(|m| !carries_body(m)) {
                    return Err(Extraction::Discard(DiscardReason::BodylessMethod(
                        method.to_string(),
                    )));
                }
                let body = json_body(&message.payload)?;
                // Cascade envelopes keep their cascade id whichever path they took
                match self.registry.recognize(&body) {
                    Some(decoder) => {
                        let request = decoder
                            .decode_request(head, &message.payload)
                            .map_err(Extraction::Fault)?;
                        (request, ResponseDecoder::Rpc(decoder.name()))
                    }
                    None => {
                        let (request, provider) =
                            decode_provider_request(&host, head, &body, message.payload.len())?;
                        (request, ResponseDecoder::Provider(provider))
                    }
                }
            }
        };

        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Err(Extraction::Discard(DiscardReason::EmptyPrompt));
        }

        tracing::debug!(
            connection = %self.connection,
            source = %request.source,
            cascade_id = request.cascade_id.as_deref().unwrap_or(""),
            "Prompt candidate queued"
        );

        Ok(Candidate {
            request,
            response_decoder,
            path: message.path,
            timestamp: message.started_at.wall,
        })
    }

    fn on_response(&mut self, message: ReassembledMessage) -> Vec<Extraction> {
        if message.head.status().is_some_and(|s| (100..200).contains(&s)) {
            return Vec::new();
        }

        let Some(exchange) = self.pending.pop_front() else {
            return vec![Extraction::Discard(DiscardReason::UnpairedResponse)];
        };

        match exchange.slot {
            Slot::Skip => Vec::new(),
            Slot::Expired => vec![Extraction::Discard(DiscardReason::LateResponse)],
            Slot::Waiting(candidate) => {
                let response = self.decode_response(&candidate.response_decoder, &message);
                vec![self.emit(*candidate, response)]
            }
        }
    }

    fn decode_response(&self, decoder: &ResponseDecoder, message: &ReassembledMessage) -> Option<String> {
        match decoder {
            ResponseDecoder::Provider(provider) => {
                providers::response_text(*provider, &message.head, &message.payload)
            }
            ResponseDecoder::Rpc(name) => self
                .registry
                .named(name)
                .and_then(|d| d.decode_response(&message.head, &message.payload)),
        }
    }

    /// Emit candidates whose response is overdue; their slot stays so a
    /// late response still pairs with it
    pub fn tick(&mut self, now: Instant) -> Vec<Extraction> {
        let mut out = Vec::new();
        for exchange in self.pending.iter_mut() {
            let overdue = matches!(exchange.slot, Slot::Waiting(_))
                && now.duration_since(exchange.queued_at) >= self.settings.pair_timeout;
            if !overdue {
                continue;
            }
            if let Slot::Waiting(candidate) = std::mem::replace(&mut exchange.slot, Slot::Expired) {
                tracing::debug!(connection = %self.connection, "Response overdue, emitting prompt alone");
                out.push(Extraction::Event(Box::new(ExtractedEvent::new(
                    candidate.request,
                    None,
                    candidate.path,
                    self.connection,
                    candidate.timestamp,
                    self.settings.bucket_secs,
                ))));
            }
        }
        out
    }

    /// Connection ended: emit every waiting candidate prompt-only
    pub fn close(&mut self) -> Vec<Extraction> {
        let drained: Vec<_> = self.pending.drain(..).collect();
        drained
            .into_iter()
            .flat_map(|exchange| self.expire(exchange.slot))
            .collect()
    }

    fn expire(&self, slot: Slot) -> Option<Extraction> {
        match slot {
            Slot::Waiting(candidate) => Some(self.emit(*candidate, None)),
            Slot::Skip | Slot::Expired => None,
        }
    }

    fn emit(&self, candidate: Candidate, response: Option<String>) -> Extraction {
        Extraction::Event(Box::new(ExtractedEvent::new(
            candidate.request,
            response,
            candidate.path,
            self.connection,
            candidate.timestamp,
            self.settings.bucket_secs,
        )))
    }
}

fn carries_body(method: &str) -> bool {
    matches!(method.to_ascii_uppercase().as_str(), "POST" | "PUT" | "PATCH")
}

fn json_body(payload: &[u8]) -> Result<Value, Extraction> {
    if payload.is_empty() {
        return Err(Extraction::Discard(DiscardReason::NoPrompt));
    }
    let text = std::str::from_utf8(payload).map_err(|_| Extraction::Fault(DecodeFault::NotUtf8))?;
    serde_json::from_str(text).map_err(|e| Extraction::Fault(e.into()))
}

fn decode_provider_request(
    host: &str,
    head: &MessageHead,
    body: &Value,
    request_size: usize,
) -> Result<(DecodedRequest, Provider), Extraction> {
    let provider = Provider::detect(host, head, body);
    let prompt = providers::request_prompt(provider, body)
        .ok_or(Extraction::Discard(DiscardReason::NoPrompt))?;
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(str::to_string);
    let source = providers::detect_source(head.header("user-agent"), host);

    Ok((
        DecodedRequest {
            prompt,
            model,
            cascade_id: None,
            planner_mode: None,
            brain_enabled: false,
            ide_name: None,
            ide_version: None,
            extension_version: None,
            source,
            metadata: providers::request_metadata(provider, head, body, request_size),
        },
        provider,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureTimestamp, ConnectionIds, Endpoint};
    use crate::reassembly::CompletionReason;
    use crate::reassembly::http::parse_head;
    use bytes::Bytes;
    use chrono::TimeZone;

    fn extractor(path: TransportPath, pair_timeout: Duration) -> Extractor {
        Extractor::new(
            ConnectionIds::new(path).next(),
            Arc::new(Classifier::new(
                vec!["api.openai.com".into()],
                vec!["SendUserCascadeMessage".into()],
            )),
            Arc::new(DecoderRegistry::with_defaults(&["SendUserCascadeMessage".into()])),
            ExtractSettings {
                pair_timeout,
                bucket_secs: 30,
            },
        )
    }

    fn message(ex: &Extractor, path: TransportPath, host: &str, direction: Direction, head: &str, body: &str) -> ReassembledMessage {
        let mut message = ReassembledMessage::new(
            ex.connection,
            Endpoint::new(host, 443),
            direction,
            parse_head(head.as_bytes()).unwrap(),
            CaptureTimestamp::now(),
        );
        message.path = path;
        message.payload = Bytes::copy_from_slice(body.as_bytes());
        message.mark_complete(CompletionReason::Framed).unwrap();
        message
    }

    fn events(out: Vec<Extraction>) -> Vec<ExtractedEvent> {
        out.into_iter()
            .filter_map(|e| match e {
                Extraction::Event(event) => Some(*event),
                _ => None,
            })
            .collect()
    }

    const CHAT_REQUEST: &str = "POST /v1/chat/completions HTTP/1.1\r\nContent-Type: application/json\r\nUser-Agent: Cursor/0.42\r\n\r\n";
    const JSON_RESPONSE: &str = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n";

    #[test]
    fn test_derived_fields() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 14, 15, 9, 26).unwrap();
        let derived = DerivedFields::compute("Refactor this function", ts);
        assert_eq!(derived.prompt_length, 22);
        assert_eq!(derived.word_count, 3);
        assert_eq!(derived.hour_of_day, 15);
        assert_eq!(derived.day_of_week, "Friday");
        assert_eq!(derived.date, "2025-03-14");
    }

    #[test]
    fn test_request_response_pairing() {
        let mut ex = extractor(TransportPath::Mitm, Duration::from_secs(120));
        let request = message(&ex, TransportPath::Mitm, "api.openai.com", Direction::Request, CHAT_REQUEST,
            r#"{"model":"gpt-4o","messages":[{"role":"user","content":"Refactor this function"}]}"#);
        assert!(ex.on_message(request).is_empty());
        assert_eq!(ex.pending(), 1);

        let response = message(&ex, TransportPath::Mitm, "api.openai.com", Direction::Response, JSON_RESPONSE,
            r#"{"choices":[{"message":{"content":"Here's the refactored..."}}]}"#);
        let out = events(ex.on_message(response));

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].prompt.as_deref(), Some("Refactor this function"));
        assert_eq!(out[0].response.as_deref(), Some("Here's the refactored..."));
        assert_eq!(out[0].model.as_deref(), Some("gpt-4o"));
        assert_eq!(out[0].source, Source::Cursor);
        assert_eq!(out[0].derived.word_count, 3);
        assert_eq!(ex.pending(), 0);
    }

    #[test]
    fn test_empty_prompt_is_discarded() {
        let mut ex = extractor(TransportPath::Mitm, Duration::from_secs(120));
        let request = message(&ex, TransportPath::Mitm, "api.openai.com", Direction::Request, CHAT_REQUEST,
            r#"{"messages":[{"role":"user","content":"   "}]}"#);
        let out = ex.on_message(request);
        assert!(matches!(out.as_slice(), [Extraction::Discard(DiscardReason::EmptyPrompt)]));

        // The placeholder absorbs the matching response
        let response = message(&ex, TransportPath::Mitm, "api.openai.com", Direction::Response, JSON_RESPONSE, "{}");
        assert!(ex.on_message(response).is_empty());
    }

    #[test]
    fn test_invalid_json_is_fault() {
        let mut ex = extractor(TransportPath::Mitm, Duration::from_secs(120));
        let request = message(&ex, TransportPath::Mitm, "api.openai.com", Direction::Request, CHAT_REQUEST, "{oops");
        assert!(matches!(ex.on_message(request).as_slice(), [Extraction::Fault(DecodeFault::InvalidJson(_))]));
    }

    #[test]
    fn test_unpaired_response_is_discarded() {
        let mut ex = extractor(TransportPath::Mitm, Duration::from_secs(120));
        let response = message(&ex, TransportPath::Mitm, "api.openai.com", Direction::Response, JSON_RESPONSE, "{}");
        assert!(matches!(
            ex.on_message(response).as_slice(),
            [Extraction::Discard(DiscardReason::UnpairedResponse)]
        ));
    }

    #[test]
    fn test_loopback_cascade_emitted_on_close() {
        let mut ex = extractor(TransportPath::Loopback, Duration::from_secs(120));
        let request = message(
            &ex,
            TransportPath::Loopback,
            "127.0.0.1",
            Direction::Request,
            "POST /exa.language_server_pb.LanguageServerService/SendUserCascadeMessage HTTP/1.1\r\nContent-Type: application/json\r\n\r\n",
            r#"{"cascadeId":"abc-123","items":[{"text":"hello"}],"cascadeConfig":{"plannerConfig":{"requestedModelUid":"MODEL_X"}}}"#,
        );
        assert!(ex.on_message(request).is_empty());

        let out = events(ex.close());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].cascade_id.as_deref(), Some("abc-123"));
        assert_eq!(out[0].model.as_deref(), Some("MODEL_X"));
        assert_eq!(out[0].path, TransportPath::Loopback);
        assert_eq!(out[0].derived.prompt_length, 5);
        assert_eq!(out[0].derived.word_count, 1);
        assert!(out[0].response.is_none());
    }

    #[test]
    fn test_overdue_candidate_emitted_once_and_late_response_discarded() {
        let mut ex = extractor(TransportPath::Mitm, Duration::from_secs(1));
        let request = message(&ex, TransportPath::Mitm, "api.openai.com", Direction::Request, CHAT_REQUEST,
            r#"{"prompt":"slow one"}"#);
        ex.on_message(request);

        assert!(ex.tick(Instant::now()).is_empty());
        let later = Instant::now() + Duration::from_secs(2);
        assert_eq!(events(ex.tick(later)).len(), 1);
        assert!(ex.tick(later).is_empty());

        let response = message(&ex, TransportPath::Mitm, "api.openai.com", Direction::Response, JSON_RESPONSE, "{}");
        assert!(matches!(
            ex.on_message(response).as_slice(),
            [Extraction::Discard(DiscardReason::LateResponse)]
        ));
        assert!(ex.close().is_empty());
    }

    #[test]
    fn test_get_to_intercept_host_is_bodyless_discard() {
        let mut ex = extractor(TransportPath::Mitm, Duration::from_secs(120));
        let request = message(&ex, TransportPath::Mitm, "api.openai.com", Direction::Request,
            "GET /v1/models HTTP/1.1\r\n\r\n", "");
        assert!(matches!(
            ex.on_message(request).as_slice(),
            [Extraction::Discard(DiscardReason::BodylessMethod(m))] if m == "GET"
        ));

        let response = message(&ex, TransportPath::Mitm, "api.openai.com", Direction::Response, JSON_RESPONSE,
            r#"{"data":[]}"#);
        assert!(ex.on_message(response).is_empty());
    }

    #[test]
    fn test_cascade_body_on_other_cloud_path_keeps_cascade_id() {
        let mut ex = extractor(TransportPath::Mitm, Duration::from_secs(120));
        let request = message(
            &ex,
            TransportPath::Mitm,
            "api.openai.com",
            Direction::Request,
            "POST /exa.api_server_pb.ApiServerService/GetChatMessage HTTP/1.1\r\nContent-Type: application/json\r\n\r\n",
            r#"{"cascadeId":"abc-123","items":[{"text":"hello"}],"cascadeConfig":{"plannerConfig":{"requestedModelUid":"MODEL_X"}}}"#,
        );
        assert!(ex.on_message(request).is_empty());

        let response = message(&ex, TransportPath::Mitm, "api.openai.com", Direction::Response, JSON_RESPONSE, "{}");
        let out = events(ex.on_message(response));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].prompt.as_deref(), Some("hello"));
        assert_eq!(out[0].cascade_id.as_deref(), Some("abc-123"));
        assert_eq!(out[0].model.as_deref(), Some("MODEL_X"));
        assert_eq!(out[0].source, Source::Windsurf);
        assert_eq!(out[0].path, TransportPath::Mitm);
        assert!(out[0].response.is_none());
    }

    #[test]
    fn test_partial_message_never_extracted() {
        let mut ex = extractor(TransportPath::Mitm, Duration::from_secs(120));
        let mut request = message(&ex, TransportPath::Mitm, "api.openai.com", Direction::Request, CHAT_REQUEST,
            r#"{"prompt":"x"}"#);
        request = ReassembledMessage::new(request.connection, request.endpoint, request.direction, request.head, request.started_at);
        assert!(matches!(
            ex.on_message(request).as_slice(),
            [Extraction::Discard(DiscardReason::Incomplete)]
        ));
        assert_eq!(ex.pending(), 0);
    }
}
