//! Stream reassembly
//!
//! Turns the ordered chunk stream of one connection into complete HTTP/1.1
//! messages. Each connection's buffers are owned by that connection's worker
//! and dropped when the connection closes.

pub mod fragment;
pub mod http;

pub use fragment::{FragmentAssembler, StreamKind};
pub use http::{BodyFraming, ChunkedDecoder, MessageHead, StartLine};

use bytes::{Bytes, BytesMut};
use flate2::read::{GzDecoder, ZlibDecoder};
use std::collections::VecDeque;
use std::io::Read;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::capture::{
    CaptureTimestamp, CapturedEvent, ConnectionId, Direction, Endpoint, TransportPath,
};
use crate::config::ReassemblyConfig;
use http::StartCheck;

/// Framing faults. Each one discards the affected message only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("malformed message head: {0}")]
    MalformedHead(String),

    #[error("message head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("message body exceeds {0} bytes")]
    MessageTooLarge(usize),

    #[error("invalid content-length: {0}")]
    InvalidContentLength(String),

    #[error("invalid chunked encoding: {0}")]
    InvalidChunk(String),

    #[error("connection closed mid-message: {0}")]
    Truncated(String),

    #[error("skipped {0} bytes to find a message boundary")]
    Desynchronized(usize),

    #[error("failed to decode body: {0}")]
    Decompression(String),

    #[error("message already complete")]
    AlreadyComplete,
}

/// Why a message was considered complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// Length or chunked framing satisfied
    Framed,
    /// Explicit end-of-stream marker observed
    EndMarker,
    /// Connection closed while streaming
    ConnectionClosed,
    /// No bytes for the idle timeout while streaming
    IdleTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Partial,
    Complete(CompletionReason),
}

/// A logical HTTP message rebuilt from captured chunks
#[derive(Debug, Clone)]
pub struct ReassembledMessage {
    pub connection: ConnectionId,
    pub endpoint: Endpoint,
    pub path: TransportPath,
    pub direction: Direction,
    pub head: MessageHead,
    /// Dechunked, destreamed and decoded body
    pub payload: Bytes,
    /// When the first byte of the head was captured
    pub started_at: CaptureTimestamp,
    completion: Completion,
}

impl ReassembledMessage {
    pub fn new(
        connection: ConnectionId,
        endpoint: Endpoint,
        direction: Direction,
        head: MessageHead,
        started_at: CaptureTimestamp,
    ) -> Self {
        Self {
            path: connection.path,
            connection,
            endpoint,
            direction,
            head,
            payload: Bytes::new(),
            started_at,
            completion: Completion::Partial,
        }
    }

    pub fn completion(&self) -> Completion {
        self.completion
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.completion, Completion::Complete(_))
    }

    /// Transition to complete. Only the first call succeeds.
    pub fn mark_complete(&mut self, reason: CompletionReason) -> Result<(), ReassemblyError> {
        if self.is_complete() {
            return Err(ReassemblyError::AlreadyComplete);
        }
        self.completion = Completion::Complete(reason);
        Ok(())
    }

    pub fn content_type(&self) -> Option<String> {
        self.head.content_type()
    }
}

/// Output of a reassembly step, in the order it occurred
#[derive(Debug)]
pub enum Reassembled {
    Message(ReassembledMessage),
    Fault(ReassemblyError),
}

#[derive(Debug)]
enum BodyDecoder {
    Fixed(usize),
    Chunked(ChunkedDecoder),
    UntilClose,
}

impl BodyDecoder {
    /// Move framed body bytes from `raw` to `out`; true once framing is satisfied
    fn consume(&mut self, raw: &mut BytesMut, out: &mut BytesMut) -> Result<bool, ReassemblyError> {
        match self {
            BodyDecoder::Fixed(remaining) => {
                let take = (*remaining).min(raw.len());
                out.extend_from_slice(&raw.split_to(take));
                *remaining -= take;
                Ok(*remaining == 0)
            }
            BodyDecoder::Chunked(decoder) => decoder.feed(raw, out),
            BodyDecoder::UntilClose => {
                out.extend_from_slice(&raw.split());
                Ok(false)
            }
        }
    }

    fn is_until_close(&self) -> bool {
        matches!(self, BodyDecoder::UntilClose)
    }
}

#[derive(Debug)]
struct BodyState {
    message: ReassembledMessage,
    decoder: BodyDecoder,
    stream: Option<FragmentAssembler>,
    body: BytesMut,
    last_activity: Instant,
}

impl BodyState {
    fn is_streaming(&self) -> bool {
        self.stream.is_some() || self.decoder.is_until_close()
    }

    fn take_decoder(&mut self) -> BodyDecoder {
        std::mem::replace(&mut self.decoder, BodyDecoder::Fixed(0))
    }

    fn len(&self) -> usize {
        self.stream
            .as_ref()
            .map(|s| s.len())
            .unwrap_or(self.body.len())
    }
}

#[derive(Debug)]
enum Phase {
    Head,
    Body(Box<BodyState>),
    /// Consume the rest of a message that has already been emitted or dropped
    Drain(BodyDecoder),
    /// Not HTTP/1.1; ignore the rest of this direction
    Ignored,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    max_head: usize,
    max_message: usize,
    idle: Duration,
}

struct DirectionBuffer {
    direction: Direction,
    raw: BytesMut,
    phase: Phase,
    head_started: Option<CaptureTimestamp>,
    desynced: bool,
}

impl DirectionBuffer {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            raw: BytesMut::new(),
            phase: Phase::Head,
            head_started: None,
            desynced: false,
        }
    }

    fn buffered(&self) -> usize {
        let body = match &self.phase {
            Phase::Body(state) => state.len(),
            _ => 0,
        };
        self.raw.len() + body
    }

    fn push(&mut self, payload: &[u8], at: CaptureTimestamp) {
        if matches!(self.phase, Phase::Ignored) {
            return;
        }
        if self.raw.is_empty() && matches!(self.phase, Phase::Head) {
            self.head_started = Some(at);
        }
        self.raw.extend_from_slice(payload);
    }

    /// Run the state machine until it needs more bytes
    fn advance(
        &mut self,
        origin: &Origin,
        limits: Limits,
        methods: &mut VecDeque<String>,
        at: CaptureTimestamp,
        out: &mut Vec<Reassembled>,
    ) {
        loop {
            let phase = std::mem::replace(&mut self.phase, Phase::Head);
            match phase {
                Phase::Ignored => {
                    self.raw.clear();
                    self.phase = Phase::Ignored;
                    return;
                }
                Phase::Head => {
                    if !self.parse_head(origin, limits, methods, at, out) {
                        return;
                    }
                }
                Phase::Body(mut state) => {
                    let before = state.len();
                    match self.fill_body(&mut state) {
                        Err(e) => {
                            out.push(Reassembled::Fault(e));
                            self.phase = Phase::Drain(state.decoder);
                        }
                        Ok(_) if state.len() > limits.max_message => {
                            out.push(Reassembled::Fault(ReassemblyError::MessageTooLarge(
                                limits.max_message,
                            )));
                            self.phase = Phase::Drain(state.decoder);
                        }
                        Ok(framed) => {
                            if state.len() > before {
                                state.last_activity = at.monotonic;
                            }
                            let marker = state.stream.as_ref().is_some_and(|s| s.is_ended());
                            if framed {
                                let reason = if marker {
                                    CompletionReason::EndMarker
                                } else {
                                    CompletionReason::Framed
                                };
                                out.push(finish(*state, reason));
                            } else if marker {
                                // End marker before the framing ended; drain the rest.
                                let decoder = state.take_decoder();
                                out.push(finish(*state, CompletionReason::EndMarker));
                                self.phase = Phase::Drain(decoder);
                            } else {
                                self.phase = Phase::Body(state);
                                return;
                            }
                        }
                    }
                }
                Phase::Drain(mut decoder) => {
                    let mut discard = BytesMut::new();
                    match decoder.consume(&mut self.raw, &mut discard) {
                        Ok(true) => self.phase = Phase::Head,
                        Ok(false) => {
                            self.phase = Phase::Drain(decoder);
                            return;
                        }
                        Err(e) => {
                            out.push(Reassembled::Fault(e));
                            self.raw.clear();
                            self.phase = Phase::Head;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Returns false when more bytes are needed
    fn parse_head(
        &mut self,
        origin: &Origin,
        limits: Limits,
        methods: &mut VecDeque<String>,
        at: CaptureTimestamp,
        out: &mut Vec<Reassembled>,
    ) -> bool {
        if self.raw.is_empty() {
            return false;
        }

        match http::check_start(&self.raw) {
            StartCheck::Http2 => {
                tracing::debug!(connection = %origin.connection, "HTTP/2 stream ignored");
                self.raw.clear();
                self.phase = Phase::Ignored;
                return false;
            }
            StartCheck::NeedMore => return false,
            StartCheck::Invalid => {
                let skip = http::find_resync_point(&self.raw).unwrap_or(self.raw.len());
                let _ = self.raw.split_to(skip);
                if !self.desynced {
                    self.desynced = true;
                    out.push(Reassembled::Fault(ReassemblyError::Desynchronized(skip)));
                }
                self.head_started = (!self.raw.is_empty()).then_some(at);
                return !self.raw.is_empty();
            }
            StartCheck::Valid => {}
        }

        let Some(head_end) = http::find_head_end(&self.raw) else {
            if self.raw.len() > limits.max_head {
                out.push(Reassembled::Fault(ReassemblyError::HeadTooLarge(limits.max_head)));
                self.raw.clear();
                self.desynced = true;
            }
            return false;
        };
        if head_end > limits.max_head {
            out.push(Reassembled::Fault(ReassemblyError::HeadTooLarge(limits.max_head)));
            let _ = self.raw.split_to(head_end);
            return true;
        }

        let head_bytes = self.raw.split_to(head_end);
        let started_at = self.head_started.take().unwrap_or(at);
        if !self.raw.is_empty() {
            self.head_started = Some(at);
        }

        let head = match http::parse_head(&head_bytes) {
            Ok(head) => head,
            Err(e) => {
                out.push(Reassembled::Fault(e));
                return true;
            }
        };
        self.desynced = false;

        let request_method = match self.direction {
            Direction::Request => {
                if let Some(method) = head.method() {
                    methods.push_back(method.to_string());
                }
                None
            }
            Direction::Response => {
                if head.status().is_some_and(|s| (100..200).contains(&s)) {
                    methods.front().cloned()
                } else {
                    methods.pop_front()
                }
            }
        };

        let framing = match http::body_framing(&head, request_method.as_deref()) {
            Ok(framing) => framing,
            Err(e) => {
                out.push(Reassembled::Fault(e));
                self.raw.clear();
                self.desynced = true;
                return false;
            }
        };

        let stream = StreamKind::from_head(&head).map(FragmentAssembler::new);
        let message = ReassembledMessage::new(
            origin.connection,
            origin.endpoint.clone(),
            self.direction,
            head,
            started_at,
        );

        let decoder = match framing {
            BodyFraming::Empty => {
                let state = BodyState {
                    message,
                    decoder: BodyDecoder::Fixed(0),
                    stream: None,
                    body: BytesMut::new(),
                    last_activity: at.monotonic,
                };
                out.push(finish(state, CompletionReason::Framed));
                return true;
            }
            BodyFraming::Fixed(n) => BodyDecoder::Fixed(n),
            BodyFraming::Chunked => BodyDecoder::Chunked(ChunkedDecoder::new()),
            BodyFraming::UntilClose => BodyDecoder::UntilClose,
        };

        self.phase = Phase::Body(Box::new(BodyState {
            message,
            decoder,
            stream,
            body: BytesMut::new(),
            last_activity: at.monotonic,
        }));
        true
    }

    fn fill_body(&mut self, state: &mut BodyState) -> Result<bool, ReassemblyError> {
        let mut chunk = BytesMut::new();
        let framed = state.decoder.consume(&mut self.raw, &mut chunk)?;
        if !chunk.is_empty() {
            match state.stream.as_mut() {
                Some(stream) => {
                    stream.push(&chunk)?;
                }
                None => state.body.extend_from_slice(&chunk),
            }
        }
        Ok(framed)
    }

    fn tick(&mut self, now: Instant, limits: Limits, out: &mut Vec<Reassembled>) {
        let expired = match &self.phase {
            Phase::Body(state) => {
                state.is_streaming() && now.duration_since(state.last_activity) >= limits.idle
            }
            _ => false,
        };
        if !expired {
            return;
        }

        // The rest of the body still follows its own framing, so a keep-alive
        // connection returns to parsing heads once the tail arrives.
        if let Phase::Body(mut state) = std::mem::replace(&mut self.phase, Phase::Head) {
            self.phase = Phase::Drain(state.take_decoder());
            out.push(finish(*state, CompletionReason::IdleTimeout));
        }
    }

    fn close(&mut self, out: &mut Vec<Reassembled>) {
        match std::mem::replace(&mut self.phase, Phase::Head) {
            Phase::Body(state) => {
                if state.is_streaming() {
                    out.push(finish(*state, CompletionReason::ConnectionClosed));
                } else {
                    out.push(Reassembled::Fault(ReassemblyError::Truncated(
                        "body shorter than its framing".to_string(),
                    )));
                }
            }
            Phase::Head if !self.raw.is_empty() && !self.desynced => {
                out.push(Reassembled::Fault(ReassemblyError::Truncated(
                    "incomplete message head".to_string(),
                )));
            }
            _ => {}
        }
        self.raw.clear();
    }
}

/// Complete a message and decode its content encoding
fn finish(state: BodyState, reason: CompletionReason) -> Reassembled {
    let BodyState {
        mut message,
        stream,
        body,
        ..
    } = state;

    let connect = stream.as_ref().is_some_and(|s| s.kind() == StreamKind::Connect);
    let payload = match stream {
        Some(stream) => stream.finish(),
        None => body.freeze(),
    };

    let payload = if connect {
        payload
    } else {
        match decode_content(message.head.content_encoding().as_deref(), payload) {
            Ok(payload) => payload,
            Err(e) => return Reassembled::Fault(e),
        }
    };

    message.payload = payload;
    match message.mark_complete(reason) {
        Ok(()) => Reassembled::Message(message),
        Err(e) => Reassembled::Fault(e),
    }
}

fn decode_content(encoding: Option<&str>, payload: Bytes) -> Result<Bytes, ReassemblyError> {
    let mut decoded = Vec::new();
    match encoding {
        None => return Ok(payload),
        Some(_) if payload.is_empty() => return Ok(payload),
        Some("gzip") | Some("x-gzip") => GzDecoder::new(&payload[..])
            .read_to_end(&mut decoded)
            .map_err(|e| ReassemblyError::Decompression(format!("gzip: {e}")))?,
        Some("deflate") => ZlibDecoder::new(&payload[..])
            .read_to_end(&mut decoded)
            .map_err(|e| ReassemblyError::Decompression(format!("deflate: {e}")))?,
        Some(other) => {
            return Err(ReassemblyError::Decompression(format!(
                "unsupported content-encoding {other}"
            )));
        }
    };
    Ok(Bytes::from(decoded))
}

struct Origin {
    connection: ConnectionId,
    endpoint: Endpoint,
}

/// Reassembly state for one connection
pub struct ConnectionReassembler {
    origin: Origin,
    limits: Limits,
    request: DirectionBuffer,
    response: DirectionBuffer,
    request_methods: VecDeque<String>,
    next_sequence: u64,
}

impl ConnectionReassembler {
    pub fn new(connection: ConnectionId, endpoint: Endpoint, config: &ReassemblyConfig) -> Self {
        Self {
            origin: Origin {
                connection,
                endpoint,
            },
            limits: Limits {
                max_head: config.max_head_bytes,
                max_message: config.max_message_bytes,
                idle: Duration::from_secs(config.idle_timeout_secs),
            },
            request: DirectionBuffer::new(Direction::Request),
            response: DirectionBuffer::new(Direction::Response),
            request_methods: VecDeque::new(),
            next_sequence: 0,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.origin.connection
    }

    /// Bytes currently held across both directions
    pub fn buffered_bytes(&self) -> usize {
        self.request.buffered() + self.response.buffered()
    }

    /// Feed one captured chunk
    pub fn ingest(&mut self, event: &CapturedEvent) -> Vec<Reassembled> {
        let mut out = Vec::new();

        if event.sequence < self.next_sequence {
            tracing::debug!(
                connection = %self.origin.connection,
                sequence = event.sequence,
                "Ignoring replayed chunk"
            );
            return out;
        }
        self.next_sequence = event.sequence + 1;

        let buffer = match event.direction {
            Direction::Request => &mut self.request,
            Direction::Response => &mut self.response,
        };
        buffer.push(&event.payload, event.captured_at);
        buffer.advance(
            &self.origin,
            self.limits,
            &mut self.request_methods,
            event.captured_at,
            &mut out,
        );
        out
    }

    /// Complete streaming bodies that have been silent past the idle timeout
    pub fn tick(&mut self, now: Instant) -> Vec<Reassembled> {
        let mut out = Vec::new();
        self.request.tick(now, self.limits, &mut out);
        self.response.tick(now, self.limits, &mut out);
        out
    }

    /// Connection ended: finish streaming bodies, report truncated ones
    pub fn close(&mut self) -> Vec<Reassembled> {
        let mut out = Vec::new();
        self.request.close(&mut out);
        self.response.close(&mut out);
        self.request_methods.clear();
        out
    }
}
